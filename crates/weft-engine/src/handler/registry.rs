use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeHandler;
use weft_core::types::{HandlerContext, HandlerOutput};
use weft_core::workflow::{Node, NodeType};

/// Registry of node handlers, one per node type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for its node type.
    pub fn register(&mut self, handler: impl NodeHandler) {
        self.handlers.insert(handler.node_type(), Arc::new(handler));
    }

    /// Register an already shared handler.
    pub fn register_arc(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.node_type(), handler);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&node_type).cloned()
    }

    pub fn contains(&self, node_type: NodeType) -> bool {
        self.handlers.contains_key(&node_type)
    }

    /// Run `node`'s handler under its deadline.
    ///
    /// The node's `timeoutMs` wins over `default_timeout`. On expiry the
    /// handler future is dropped and a `Timeout` error is returned. Handler
    /// errors that do not already name the node are wrapped in
    /// `NodeExecution`.
    pub async fn execute(
        &self,
        node: &Node,
        input: Value,
        ctx: HandlerContext,
        default_timeout: Duration,
    ) -> Result<HandlerOutput> {
        let node_type = node.node_type();
        let handler = self
            .get(node_type)
            .ok_or_else(|| WeftError::HandlerNotFound(node_type.to_string()))?;

        let timeout = node
            .settings()
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);

        match tokio::time::timeout(timeout, handler.execute(input, ctx)).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(match e {
                WeftError::NodeExecution { .. }
                | WeftError::Timeout { .. }
                | WeftError::VariableResolution { .. }
                | WeftError::Cancelled => e,
                other => WeftError::NodeExecution {
                    node_id: node.id.clone(),
                    message: other.to_string(),
                },
            }),
            Err(_) => Err(WeftError::Timeout {
                node_id: node.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// A registry with the trigger, condition, and output handlers.
    /// Action and agent handlers are supplied by the host.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(super::builtin::TriggerHandler);
        registry.register(super::builtin::ConditionHandler);
        registry.register(super::builtin::OutputHandler);
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use weft_core::types::ExecutionId;
    use weft_core::workflow::{ActionConfig, NodeKind, NodeSettings};

    struct SleepyAction;

    impl NodeHandler for SleepyAction {
        fn node_type(&self) -> NodeType {
            NodeType::Action
        }

        fn execute(&self, _input: Value, _ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(HandlerOutput::new(Value::Null))
            })
        }
    }

    struct BrokenAction;

    impl NodeHandler for BrokenAction {
        fn node_type(&self) -> NodeType {
            NodeType::Action
        }

        fn execute(&self, _input: Value, _ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
            Box::pin(async { Err(WeftError::Database("disk full".into())) })
        }
    }

    fn action(timeout_ms: Option<u64>) -> Node {
        Node::new(
            "act",
            NodeKind::Action(ActionConfig {
                settings: NodeSettings {
                    timeout_ms,
                    ..Default::default()
                },
                action: "noop".into(),
                params: Value::Null,
            }),
        )
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            execution_id: ExecutionId::new(),
            workflow_id: "wf".into(),
            user_id: "u".into(),
            node_id: "act".into(),
            config: json!({}),
            trigger_data: Value::Null,
            node_outputs: HashMap::new(),
            is_test: false,
            attempt: 1,
        }
    }

    #[test]
    fn test_with_builtins() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.contains(NodeType::Trigger));
        assert!(registry.contains(NodeType::Condition));
        assert!(registry.contains(NodeType::Output));
        assert!(!registry.contains(NodeType::Action));
    }

    #[tokio::test]
    async fn test_missing_handler() {
        let registry = HandlerRegistry::new();
        let err = registry
            .execute(&action(None), json!({}), ctx(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::HandlerNotFound(t) if t == "action"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_timeout_overrides_default() {
        let mut registry = HandlerRegistry::new();
        registry.register(SleepyAction);
        let err = registry
            .execute(&action(Some(50)), json!({}), ctx(), Duration::from_secs(300))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WeftError::Timeout { ref node_id, timeout_ms: 50 } if node_id == "act"
        ));
    }

    #[tokio::test]
    async fn test_foreign_errors_are_wrapped() {
        let mut registry = HandlerRegistry::new();
        registry.register(BrokenAction);
        let err = registry
            .execute(&action(None), json!({}), ctx(), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            WeftError::NodeExecution { node_id, message } => {
                assert_eq!(node_id, "act");
                assert!(message.contains("disk full"));
            }
            other => panic!("expected node execution error, got {}", other),
        }
    }
}
