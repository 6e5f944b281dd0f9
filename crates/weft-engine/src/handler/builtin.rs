use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeHandler;
use weft_core::types::{HandlerContext, HandlerOutput};
use weft_core::workflow::{ConditionConfig, NodeType};

use crate::graph::{evaluate_rule, is_truthy};

/// Emits the trigger payload, with the node's resolved inputs merged in.
///
/// An object payload gets the inputs as extra keys (inputs win on
/// conflict). Any other payload is wrapped as `{"payload": ..}` when there
/// are inputs to merge.
pub struct TriggerHandler;

impl NodeHandler for TriggerHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Trigger
    }

    fn execute(&self, input: Value, ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move {
            let inputs = into_object(input);
            let output = match ctx.trigger_data {
                Value::Object(mut payload) => {
                    payload.extend(inputs);
                    Value::Object(payload)
                }
                other if inputs.is_empty() => other,
                other => {
                    let mut merged = Map::new();
                    merged.insert("payload".to_string(), other);
                    merged.extend(inputs);
                    Value::Object(merged)
                }
            };
            Ok(HandlerOutput::new(output))
        })
    }
}

/// Evaluates the node's comparison rule and returns `{"result": bool}`.
///
/// Without a rule the result is true when every resolved input is truthy.
pub struct ConditionHandler;

impl NodeHandler for ConditionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Condition
    }

    fn execute(&self, input: Value, ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move {
            let config: ConditionConfig =
                serde_json::from_value(ctx.config).map_err(|e| WeftError::NodeExecution {
                    node_id: ctx.node_id.clone(),
                    message: format!("invalid condition config: {}", e),
                })?;
            let inputs = into_object(input);

            let result = match &config.rule {
                Some(rule) => evaluate_rule(rule, &inputs),
                None => inputs.values().all(is_truthy),
            };
            debug!(node_id = %ctx.node_id, result, "Condition evaluated");

            Ok(HandlerOutput::new(json!({ "result": result })))
        })
    }
}

/// Emits its resolved inputs as an object.
pub struct OutputHandler;

impl NodeHandler for OutputHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Output
    }

    fn execute(&self, input: Value, _ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move { Ok(HandlerOutput::new(Value::Object(into_object(input)))) })
    }
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
