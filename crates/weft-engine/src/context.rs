use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use weft_core::error::WeftError;
use weft_core::types::{
    ExecutionId, ExecutionRecord, ExecutionStatus, HandlerOutput, JobPayload, NodeLog, NodeStatus,
    TriggerType,
};

/// Mutable state of one execution attempt.
///
/// Owned by exactly one worker for the attempt's lifetime. Node outputs are
/// written once, when the node finishes, and read by later nodes through
/// `step` variables.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub user_id: String,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub is_test: bool,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    status: ExecutionStatus,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    error_code: Option<String>,
    node_states: HashMap<String, NodeStatus>,
    node_outputs: HashMap<String, Value>,
    branches: HashMap<String, bool>,
    variables: HashMap<String, Value>,
    logs: Vec<NodeLog>,
    total_cost: f64,
    total_tokens: u64,
}

impl ExecutionContext {
    /// Start a context for `payload`, seeding its variable cache with the
    /// caller-supplied values.
    pub fn new(payload: &JobPayload, execution_id: ExecutionId, attempt: u32) -> Self {
        Self {
            execution_id,
            workflow_id: payload.workflow_id.clone(),
            user_id: payload.user_id.clone(),
            trigger_type: payload.trigger_type,
            trigger_data: payload.trigger_data.clone(),
            is_test: payload.is_test,
            attempt,
            started_at: Utc::now(),
            status: ExecutionStatus::Running,
            completed_at: None,
            error: None,
            error_code: None,
            node_states: HashMap::new(),
            node_outputs: HashMap::new(),
            branches: HashMap::new(),
            variables: payload.variables.clone(),
            logs: Vec::new(),
            total_cost: 0.0,
            total_tokens: 0,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Move to a terminal status. Returns false (and changes nothing) if the
    /// execution already finished.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<&WeftError>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        if let Some(e) = error {
            self.error = Some(e.to_string());
            self.error_code = Some(e.code().to_string());
        }
        true
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Unvisited nodes report `Pending`.
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.node_states
            .get(node_id)
            .copied()
            .unwrap_or(NodeStatus::Pending)
    }

    pub fn node_states(&self) -> &HashMap<String, NodeStatus> {
        &self.node_states
    }

    pub fn set_node_status(&mut self, node_id: &str, status: NodeStatus) {
        self.node_states.insert(node_id.to_string(), status);
    }

    /// Record a node's successful output and its usage.
    pub fn record_success(&mut self, node_id: &str, output: &HandlerOutput) {
        self.node_outputs
            .entry(node_id.to_string())
            .or_insert_with(|| output.output.clone());
        self.total_cost += output.cost_usd.unwrap_or(0.0);
        self.total_tokens += output.tokens_used.unwrap_or(0);
        self.set_node_status(node_id, NodeStatus::Success);
    }

    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    pub fn node_outputs(&self) -> &HashMap<String, Value> {
        &self.node_outputs
    }

    pub fn set_branch(&mut self, node_id: &str, taken: bool) {
        self.branches.insert(node_id.to_string(), taken);
    }

    pub fn branches(&self) -> &HashMap<String, bool> {
        &self.branches
    }

    pub fn cached_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// First write wins.
    pub fn cache_variable(&mut self, name: &str, value: Value) {
        self.variables.entry(name.to_string()).or_insert(value);
    }

    pub fn push_log(&mut self, log: NodeLog) {
        self.logs.push(log);
    }

    pub fn logs(&self) -> &[NodeLog] {
        &self.logs
    }

    /// Nodes that finished successfully in this attempt.
    pub fn nodes_executed(&self) -> usize {
        self.node_states
            .values()
            .filter(|s| **s == NodeStatus::Success)
            .count()
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Snapshot as a persisted execution row.
    pub fn to_record(&self, output: Option<Value>) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: self.execution_id.clone(),
            workflow_id: self.workflow_id.clone(),
            user_id: self.user_id.clone(),
            trigger_type: self.trigger_type,
            trigger_data: self.trigger_data.clone(),
            status: self.status,
            output,
            error: self.error.clone(),
            error_code: self.error_code.clone(),
            nodes_executed: self.nodes_executed(),
            total_cost: self.total_cost,
            is_test: self.is_test,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let payload = JobPayload::new("wf", "u1").with_variable("greeting", json!("hi"));
        ExecutionContext::new(&payload, ExecutionId::from_string("e1"), 1)
    }

    #[test]
    fn test_seeded_variables_are_cached() {
        let mut ctx = context();
        assert_eq!(ctx.cached_variable("greeting"), Some(&json!("hi")));
        ctx.cache_variable("greeting", json!("ignored"));
        assert_eq!(ctx.cached_variable("greeting"), Some(&json!("hi")));
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut ctx = context();
        assert!(!ctx.finish(ExecutionStatus::Running, None));
        assert!(ctx.finish(
            ExecutionStatus::Error,
            Some(&WeftError::HandlerNotFound("agent".into()))
        ));
        assert!(!ctx.finish(ExecutionStatus::Success, None));
        assert_eq!(ctx.status(), ExecutionStatus::Error);

        let record = ctx.to_record(None);
        assert_eq!(record.error_code.as_deref(), Some("handler_not_found"));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_record_success_accumulates_usage() {
        let mut ctx = context();
        ctx.record_success("a", &HandlerOutput::new(json!(1)).with_usage(10, 0.5));
        ctx.record_success("b", &HandlerOutput::new(json!(2)).with_usage(5, 0.25));
        ctx.set_node_status("c", NodeStatus::Skipped);

        assert_eq!(ctx.nodes_executed(), 2);
        assert_eq!(ctx.total_tokens(), 15);
        assert!((ctx.total_cost() - 0.75).abs() < f64::EPSILON);
        assert_eq!(ctx.node_status("d"), NodeStatus::Pending);
    }
}
