use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::workflow::{Node, SystemField, Variable, VariableSource, VariableType, WorkflowDefinition};

use super::path::get_path;
use super::transform::apply_transforms;
use crate::context::ExecutionContext;

/// Outcome of resolving one variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVariable {
    pub name: String,
    /// `None` when the variable is absent (no value, no default).
    pub value: Option<Value>,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    /// Source kind, or "job" for values seeded by the caller.
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Served from the execution's cache without touching the source.
    pub from_cache: bool,
}

impl ResolvedVariable {
    /// The value, or the resolution error.
    pub fn into_result(self) -> Result<Option<Value>> {
        match self.error {
            Some(message) => Err(WeftError::VariableResolution {
                name: self.name,
                message,
            }),
            None => Ok(self.value),
        }
    }
}

/// Variable definitions for one workflow plus the sandboxed environment.
///
/// Names are global per execution: workflow-level variables and node inputs
/// share one namespace (the graph validator rejects conflicting
/// declarations), and the first defined value resolved for a name is cached
/// in the `ExecutionContext`.
#[derive(Debug, Clone)]
pub struct VariableStore {
    definitions: HashMap<String, Variable>,
    env: Arc<HashMap<String, String>>,
}

impl VariableStore {
    /// Build from definitions; the first declaration of a name wins.
    pub fn new(
        definitions: impl IntoIterator<Item = Variable>,
        env: Arc<HashMap<String, String>>,
    ) -> Self {
        let mut map = HashMap::new();
        for var in definitions {
            map.entry(var.name.clone()).or_insert(var);
        }
        Self {
            definitions: map,
            env,
        }
    }

    /// Collect workflow-level variables and every node's inputs.
    pub fn for_workflow(def: &WorkflowDefinition, env: Arc<HashMap<String, String>>) -> Self {
        let vars = def
            .variables
            .iter()
            .chain(def.nodes.iter().flat_map(|n| n.settings().inputs.iter()))
            .cloned();
        Self::new(vars, env)
    }

    pub fn definition(&self, name: &str) -> Option<&Variable> {
        self.definitions.get(name)
    }

    /// Resolve `name` against the context, caching a defined result.
    pub fn resolve(&self, name: &str, ctx: &mut ExecutionContext) -> ResolvedVariable {
        let def = self.definitions.get(name);
        let var_type = def.map(|d| d.var_type).unwrap_or_default();
        let source = def
            .map(|d| d.source.kind().to_string())
            .unwrap_or_else(|| "job".to_string());

        if let Some(cached) = ctx.cached_variable(name) {
            return ResolvedVariable {
                name: name.to_string(),
                value: Some(cached.clone()),
                var_type,
                source,
                error: None,
                from_cache: true,
            };
        }

        let Some(def) = def else {
            return ResolvedVariable {
                name: name.to_string(),
                value: None,
                var_type,
                source,
                error: Some("no variable with this name is declared".to_string()),
                from_cache: false,
            };
        };

        let raw = self.fetch(&def.source, ctx);
        let value = apply_transforms(raw, &def.transform).or_else(|| def.default_value.clone());

        let error = match &value {
            None if def.required => Some("required variable has no value".to_string()),
            _ => None,
        };
        if let Some(v) = &value {
            ctx.cache_variable(name, v.clone());
        }
        debug!(variable = %name, source = %source, found = value.is_some(), "Resolved variable");

        ResolvedVariable {
            name: name.to_string(),
            value,
            var_type,
            source,
            error,
            from_cache: false,
        }
    }

    /// Resolve several names. A failure is reported for that name only.
    pub fn resolve_many(
        &self,
        names: &[&str],
        ctx: &mut ExecutionContext,
    ) -> HashMap<String, ResolvedVariable> {
        names
            .iter()
            .map(|name| (name.to_string(), self.resolve(name, ctx)))
            .collect()
    }

    /// Build a node's input object from its declared inputs and referenced
    /// workflow variables. Absent optional values are left out; the first
    /// failing required value aborts.
    pub fn resolve_inputs(&self, node: &Node, ctx: &mut ExecutionContext) -> Result<Map<String, Value>> {
        let settings = node.settings();
        let names = settings
            .inputs
            .iter()
            .map(|v| v.name.as_str())
            .chain(settings.variables.iter().map(String::as_str));

        let mut input = Map::new();
        for name in names {
            if let Some(value) = self.resolve(name, ctx).into_result()? {
                input.insert(name.to_string(), value);
            }
        }
        Ok(input)
    }

    fn fetch(&self, source: &VariableSource, ctx: &ExecutionContext) -> Option<Value> {
        match source {
            VariableSource::Input { path } => get_path(&ctx.trigger_data, path).cloned(),
            VariableSource::Step { step_id, path } => ctx
                .node_output(step_id)
                .and_then(|output| get_path(output, path))
                .cloned(),
            VariableSource::Env { key } => self.env.get(key).map(|v| Value::String(v.clone())),
            VariableSource::Constant { value } => Some(value.clone()),
            VariableSource::System { field } => Some(match field {
                SystemField::Timestamp => Value::String(Utc::now().to_rfc3339()),
                SystemField::UserId => Value::String(ctx.user_id.clone()),
                SystemField::WorkflowId => Value::String(ctx.workflow_id.clone()),
                SystemField::ExecutionId => Value::String(ctx.execution_id.to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::types::{ExecutionId, HandlerOutput, JobPayload, TriggerType};
    use weft_core::workflow::Transform;

    fn context(trigger_data: Value) -> ExecutionContext {
        let payload = JobPayload::new("wf-1", "user-1").with_trigger(TriggerType::Webhook, trigger_data);
        ExecutionContext::new(&payload, ExecutionId::from_string("exec-1"), 1)
    }

    fn env() -> Arc<HashMap<String, String>> {
        Arc::new(HashMap::from([("REGION".to_string(), "eu-west".to_string())]))
    }

    #[test]
    fn test_resolve_by_source_kind() {
        let store = VariableStore::new(
            vec![
                Variable::new("email", VariableSource::Input { path: "user.email".into() }),
                Variable::new(
                    "status",
                    VariableSource::Step {
                        step_id: "fetch".into(),
                        path: "body.status".into(),
                    },
                ),
                Variable::new("region", VariableSource::Env { key: "REGION".into() }),
                Variable::new("limit", VariableSource::Constant { value: json!(10) }),
                Variable::new("who", VariableSource::System { field: SystemField::UserId }),
                Variable::new("exec", VariableSource::System { field: SystemField::ExecutionId }),
            ],
            env(),
        );
        let mut ctx = context(json!({"user": {"email": "a@b.c"}}));
        ctx.record_success("fetch", &HandlerOutput::new(json!({"body": {"status": "ok"}})));

        let get = |ctx: &mut ExecutionContext, name: &str| store.resolve(name, ctx).value;
        assert_eq!(get(&mut ctx, "email"), Some(json!("a@b.c")));
        assert_eq!(get(&mut ctx, "status"), Some(json!("ok")));
        assert_eq!(get(&mut ctx, "region"), Some(json!("eu-west")));
        assert_eq!(get(&mut ctx, "limit"), Some(json!(10)));
        assert_eq!(get(&mut ctx, "who"), Some(json!("user-1")));
        assert_eq!(get(&mut ctx, "exec"), Some(json!("exec-1")));
    }

    #[test]
    fn test_second_resolve_hits_cache() {
        let store = VariableStore::new(
            vec![Variable::new("ts", VariableSource::System { field: SystemField::Timestamp })],
            env(),
        );
        let mut ctx = context(Value::Null);

        let first = store.resolve("ts", &mut ctx);
        let second = store.resolve("ts", &mut ctx);
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(first.value, second.value);
        assert_eq!(second.source, "system");
    }

    #[test]
    fn test_transforms_then_default() {
        let store = VariableStore::new(
            vec![
                Variable::new("name", VariableSource::Input { path: "name".into() }).with_transforms(
                    vec![
                        Transform::Trim,
                        Transform::Uppercase,
                        Transform::Truncate {
                            max_length: 3,
                            suffix: String::new(),
                        },
                    ],
                ),
                Variable::new("plan", VariableSource::Input { path: "account.plan".into() })
                    .with_default(json!("free")),
            ],
            env(),
        );
        let mut ctx = context(json!({"name": "  hello "}));
        assert_eq!(store.resolve("name", &mut ctx).value, Some(json!("HEL")));
        assert_eq!(store.resolve("plan", &mut ctx).value, Some(json!("free")));
    }

    #[test]
    fn test_resolve_many_reports_failures_per_name() {
        let store = VariableStore::new(
            vec![
                Variable::new("missing", VariableSource::Input { path: "nope".into() }).required(),
                Variable::new("present", VariableSource::Constant { value: json!(true) }),
            ],
            env(),
        );
        let mut ctx = context(json!({}));
        let results = store.resolve_many(&["missing", "present", "undeclared"], &mut ctx);

        assert_eq!(results.len(), 3);
        assert!(results["missing"].error.is_some());
        assert!(results["missing"].value.is_none());
        assert_eq!(results["present"].value, Some(json!(true)));
        assert!(results["present"].error.is_none());
        assert!(results["undeclared"].error.is_some());

        let err = results["missing"].clone().into_result().unwrap_err();
        assert!(matches!(err, WeftError::VariableResolution { ref name, .. } if name == "missing"));
    }

    #[test]
    fn test_seeded_job_variables_win() {
        let store = VariableStore::new(
            vec![Variable::new("greeting", VariableSource::Constant { value: json!("hello") })],
            env(),
        );
        let payload = JobPayload::new("wf", "u").with_variable("greeting", json!("hi"));
        let mut ctx = ExecutionContext::new(&payload, ExecutionId::new(), 1);

        let resolved = store.resolve("greeting", &mut ctx);
        assert_eq!(resolved.value, Some(json!("hi")));
        assert!(resolved.from_cache);
    }

    #[test]
    fn test_step_lookup_before_step_runs_is_not_cached() {
        let store = VariableStore::new(
            vec![Variable::new(
                "id",
                VariableSource::Step {
                    step_id: "create".into(),
                    path: "id".into(),
                },
            )],
            env(),
        );
        let mut ctx = context(Value::Null);
        assert_eq!(store.resolve("id", &mut ctx).value, None);

        ctx.record_success("create", &HandlerOutput::new(json!({"id": 7})));
        assert_eq!(store.resolve("id", &mut ctx).value, Some(json!(7)));
    }
}
