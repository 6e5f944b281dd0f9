use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::event::{EngineEvent, EventPayload};
use weft_core::traits::{EventSink, ExecutionStore, PersistenceClient, QueueClient};
use weft_core::types::{
    ExecutionStatus, HandlerContext, HandlerOutput, JobProgress, NodeLog, NodeStatus, PinMode,
};
use weft_core::workflow::{Node, NodeKind};

use crate::context::ExecutionContext;
use crate::graph::{branch_taken, should_run, WorkflowGraph};
use crate::handler::HandlerRegistry;
use crate::variables::VariableStore;

/// Result of running one execution attempt.
#[derive(Debug)]
pub struct ExecutionOutcome {
    /// `Success`, `Error`, or `Cancelled`.
    pub status: ExecutionStatus,
    /// Output of the output node(s).
    pub output: Value,
    /// The failure that aborted the attempt, if any.
    pub error: Option<WeftError>,
    pub nodes_executed: usize,
    pub total_cost: f64,
    pub duration_ms: u64,
}

/// Writes coarse progress checkpoints to the job's queue record.
pub struct ProgressReporter {
    queue: Arc<dyn QueueClient>,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(queue: Arc<dyn QueueClient>, job_id: impl Into<String>) -> Self {
        Self {
            queue,
            job_id: job_id.into(),
        }
    }

    /// Best effort; a failed update is logged and ignored.
    pub async fn report(&self, progress: JobProgress) {
        if let Err(e) = self.queue.update_progress(&self.job_id, &progress).await {
            warn!(job_id = %self.job_id, error = %e, "Failed to update job progress");
        }
    }
}

/// Dispatches nodes in graph order.
///
/// Execution is strictly sequential: one node at a time, in the graph's
/// topological order. Before each node the cancellation flag is checked;
/// a raised flag ends the attempt as `Cancelled` with later nodes left
/// `Pending`.
pub struct NodeExecutor {
    registry: Arc<HandlerRegistry>,
    persistence: Arc<dyn PersistenceClient>,
    events: Arc<dyn EventSink>,
    env: Arc<HashMap<String, String>>,
    default_timeout: Duration,
}

impl NodeExecutor {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        persistence: Arc<dyn PersistenceClient>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            persistence,
            events,
            env: Arc::new(HashMap::new()),
            default_timeout: Duration::from_secs(30),
        }
    }

    /// Sandboxed environment for `env` variables.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Arc::new(env);
        self
    }

    /// Handler deadline for nodes without their own `timeoutMs`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Run every live node of `graph` against `ctx`.
    ///
    /// A node failure aborts the remaining nodes unless the node has
    /// `continueOnError`. Logs and outputs written before the failure stay
    /// in place. The context's own status is left for the caller to
    /// finalize, since a failed attempt may still be retried.
    pub async fn run(
        &self,
        graph: &WorkflowGraph,
        ctx: &mut ExecutionContext,
        cancel: &AtomicBool,
        progress: Option<&ProgressReporter>,
    ) -> ExecutionOutcome {
        let start = Instant::now();
        let store = VariableStore::for_workflow(graph.definition(), self.env.clone());
        let live = graph.plan(ctx.trigger_type);
        let total = graph.len();
        let mut failure: Option<WeftError> = None;

        for (index, node) in graph.ordered_nodes().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                info!(execution_id = %ctx.execution_id, node_id = %node.id, "Cancellation requested, stopping");
                failure = Some(WeftError::Cancelled);
                break;
            }

            if !should_run(graph, node, &live, ctx.node_states(), ctx.branches()) {
                debug!(execution_id = %ctx.execution_id, node_id = %node.id, "Skipping node");
                ctx.set_node_status(&node.id, NodeStatus::Skipped);
                continue;
            }

            if let Some(reporter) = progress {
                reporter
                    .report(JobProgress::Node {
                        index,
                        total,
                        node_id: node.id.clone(),
                    })
                    .await;
            }

            match self.run_node(node, &store, ctx).await {
                Ok(()) => {}
                Err(e) if node.settings().continue_on_error => {
                    warn!(
                        execution_id = %ctx.execution_id,
                        node_id = %node.id,
                        error = %e,
                        "Node failed, continuing"
                    );
                }
                Err(e) => {
                    error!(execution_id = %ctx.execution_id, node_id = %node.id, error = %e, "Node failed");
                    failure = Some(e);
                    break;
                }
            }
        }

        let status = match &failure {
            None => ExecutionStatus::Success,
            Some(WeftError::Cancelled) => ExecutionStatus::Cancelled,
            Some(_) => ExecutionStatus::Error,
        };

        ExecutionOutcome {
            status,
            output: collect_output(graph, ctx),
            error: failure,
            nodes_executed: ctx.nodes_executed(),
            total_cost: ctx.total_cost(),
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn run_node(&self, node: &Node, store: &VariableStore, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.set_node_status(&node.id, NodeStatus::Running);
        self.emit(ctx, Some(&node.id), "running", EngineEvent::NodeStart);

        match self.invoke(node, store, ctx).await {
            Ok(output) => {
                ctx.record_success(&node.id, &output);
                if matches!(node.kind, NodeKind::Condition(_)) {
                    let taken = branch_taken(&output.output);
                    debug!(node_id = %node.id, taken, "Condition branch selected");
                    ctx.set_branch(&node.id, taken);
                }
                self.emit(ctx, Some(&node.id), "success", EngineEvent::NodeFinish);
                Ok(())
            }
            Err(e) => {
                ctx.set_node_status(&node.id, NodeStatus::Error);
                self.emit(ctx, Some(&node.id), "error", EngineEvent::NodeError);
                Err(e)
            }
        }
    }

    /// Pin substitution, input resolution, handler call, and the node log.
    async fn invoke(
        &self,
        node: &Node,
        store: &VariableStore,
        ctx: &mut ExecutionContext,
    ) -> Result<HandlerOutput> {
        let node_type = node.node_type().as_str();
        let pin = self
            .persistence
            .check_pin(&ctx.workflow_id, &node.id, &ctx.user_id, ctx.is_test)?;

        if pin.should_use_pinned {
            info!(node_id = %node.id, mode = ?pin.mode, "Using pinned output");
            let output = pin.pinned_output.unwrap_or(Value::Null);
            let mut log = NodeLog::started(ctx.execution_id.clone(), &node.id, node_type, ctx.attempt, None);
            log.pinned = true;
            self.persistence.insert_node_log(&log)?;
            log.succeed(output.clone(), None, None);
            self.persistence.finish_node_log(&log)?;
            ctx.push_log(log);
            return Ok(HandlerOutput::new(output));
        }

        let input = store.resolve_inputs(node, ctx);
        let mut log = NodeLog::started(
            ctx.execution_id.clone(),
            &node.id,
            node_type,
            ctx.attempt,
            input.as_ref().ok().map(|m| Value::Object(m.clone())),
        );
        self.persistence.insert_node_log(&log)?;

        let result = match input {
            Ok(input) => {
                let handler_ctx = HandlerContext {
                    execution_id: ctx.execution_id.clone(),
                    workflow_id: ctx.workflow_id.clone(),
                    user_id: ctx.user_id.clone(),
                    node_id: node.id.clone(),
                    config: node.config_value(),
                    trigger_data: ctx.trigger_data.clone(),
                    node_outputs: ctx.node_outputs().clone(),
                    is_test: ctx.is_test,
                    attempt: ctx.attempt,
                };
                self.registry
                    .execute(node, Value::Object(input), handler_ctx, self.default_timeout)
                    .await
            }
            Err(e) => Err(e),
        };

        let result = match result {
            Err(e) if pin.has_pinned_data && pin.mode == Some(PinMode::OnError) => {
                warn!(node_id = %node.id, error = %e, "Handler failed, falling back to pinned output");
                self.persistence
                    .record_pin_usage(&ctx.workflow_id, &node.id, &ctx.user_id)?;
                log.pinned = true;
                Ok(HandlerOutput::new(pin.pinned_output.unwrap_or(Value::Null)))
            }
            other => other,
        };

        match &result {
            Ok(out) => log.succeed(out.output.clone(), out.tokens_used, out.cost_usd),
            Err(e) => log.fail(e.to_string()),
        }
        self.persistence.finish_node_log(&log)?;
        ctx.push_log(log);
        result
    }

    fn emit(
        &self,
        ctx: &ExecutionContext,
        node_id: Option<&str>,
        status: &str,
        event: fn(EventPayload) -> EngineEvent,
    ) {
        self.events.emit(event(EventPayload::new(
            &ctx.execution_id,
            &ctx.workflow_id,
            node_id,
            status,
        )));
    }
}

/// A single output node yields its output directly; several are keyed by
/// node id; none yields `null`.
fn collect_output(graph: &WorkflowGraph, ctx: &ExecutionContext) -> Value {
    let mut outputs: Vec<(&str, &Value)> = graph
        .ordered_nodes()
        .filter(|n| matches!(n.kind, NodeKind::Output(_)))
        .filter(|n| ctx.node_status(&n.id) == NodeStatus::Success)
        .filter_map(|n| ctx.node_output(&n.id).map(|v| (n.id.as_str(), v)))
        .collect();

    match outputs.len() {
        0 => Value::Null,
        1 => outputs.remove(0).1.clone(),
        _ => Value::Object(
            outputs
                .into_iter()
                .map(|(id, v)| (id.to_string(), v.clone()))
                .collect::<Map<String, Value>>(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use weft_core::types::{ExecutionId, JobPayload, NodeLogStatus, PinnedData, TriggerType};
    use weft_store::SqliteStore;
    use weft_test_utils::{fixtures, CountingHandler, EchoHandler, FailingHandler, RecordingSink};

    struct Harness {
        store: Arc<SqliteStore>,
        sink: Arc<RecordingSink>,
        executor: NodeExecutor,
    }

    fn harness(registry: HandlerRegistry) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let sink = Arc::new(RecordingSink::new());
        let executor = NodeExecutor::new(Arc::new(registry), store.clone(), sink.clone());
        Harness {
            store,
            sink,
            executor,
        }
    }

    fn context(payload: JobPayload) -> ExecutionContext {
        ExecutionContext::new(&payload, ExecutionId::new(), 1)
    }

    fn registry_with(handler: impl weft_core::traits::NodeHandler) -> HandlerRegistry {
        let mut registry = HandlerRegistry::with_builtins();
        registry.register(handler);
        registry
    }

    #[tokio::test]
    async fn test_linear_success_passes_step_outputs() {
        let h = harness(registry_with(EchoHandler::action()));
        let graph = WorkflowGraph::build(fixtures::linear_workflow()).unwrap();
        let mut ctx = context(
            JobPayload::new("linear", "u1").with_trigger(TriggerType::Manual, json!({"name": "Ada"})),
        );

        let outcome = h.executor.run(&graph, &mut ctx, &AtomicBool::new(false), None).await;

        assert_eq!(outcome.status, ExecutionStatus::Success, "{:?}", outcome.error);
        assert_eq!(outcome.nodes_executed, 4);
        assert_eq!(outcome.output, json!({"result": "Ada"}));

        let logs = h.store.node_logs(&ctx.execution_id).unwrap();
        assert_eq!(logs.len(), 4);
        assert!(logs.iter().all(|l| l.status == NodeLogStatus::Success));

        let names: Vec<&str> = h.sink.events().iter().map(|e| e.name()).collect::<Vec<_>>();
        assert_eq!(names.iter().filter(|n| **n == "node:start").count(), 4);
        assert_eq!(names.iter().filter(|n| **n == "node:finish").count(), 4);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_nodes() {
        let h = harness(registry_with(FailingHandler::action("boom")));
        let graph = WorkflowGraph::build(fixtures::linear_workflow()).unwrap();
        let mut ctx = context(JobPayload::new("linear", "u1"));

        let outcome = h.executor.run(&graph, &mut ctx, &AtomicBool::new(false), None).await;

        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert_eq!(outcome.nodes_executed, 1);
        assert_eq!(ctx.node_status("trigger"), NodeStatus::Success);
        assert_eq!(ctx.node_status("action_a"), NodeStatus::Error);
        assert_eq!(ctx.node_status("action_b"), NodeStatus::Pending);
        assert!(matches!(outcome.error, Some(WeftError::NodeExecution { .. })));

        let logs = h.store.node_logs(&ctx.execution_id).unwrap();
        assert_eq!(logs.len(), 2);
        let failed = logs.iter().find(|l| l.node_id == "action_a").unwrap();
        assert_eq!(failed.status, NodeLogStatus::Error);
        assert!(failed.error.as_deref().unwrap().contains("boom"));
        assert!(h.sink.events().iter().any(|e| e.name() == "node:error"));
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_going() {
        let h = harness(registry_with(FailingHandler::action("flaky upstream")));
        let mut def = fixtures::linear_workflow();
        if let NodeKind::Action(c) = &mut def.nodes[1].kind {
            c.settings.continue_on_error = true;
        }
        let graph = WorkflowGraph::build(def).unwrap();
        let mut ctx = context(JobPayload::new("linear", "u1"));

        let outcome = h.executor.run(&graph, &mut ctx, &AtomicBool::new(false), None).await;

        assert_eq!(outcome.status, ExecutionStatus::Error, "action_b fails as well");
        assert_eq!(ctx.node_status("action_a"), NodeStatus::Error);
        assert_eq!(ctx.node_status("action_b"), NodeStatus::Error);
        assert_eq!(ctx.node_status("output"), NodeStatus::Pending);
    }

    #[tokio::test]
    async fn test_condition_true_skips_false_branch() {
        let h = harness(registry_with(EchoHandler::action()));
        let graph = WorkflowGraph::build(fixtures::branching_workflow()).unwrap();
        let mut ctx = context(
            JobPayload::new("branching", "u1").with_trigger(TriggerType::Webhook, json!({"score": 9})),
        );

        let outcome = h.executor.run(&graph, &mut ctx, &AtomicBool::new(false), None).await;

        assert_eq!(outcome.status, ExecutionStatus::Success, "{:?}", outcome.error);
        assert_eq!(ctx.node_status("on_true"), NodeStatus::Success);
        assert_eq!(ctx.node_status("on_false"), NodeStatus::Skipped);

        let logs = h.store.node_logs(&ctx.execution_id).unwrap();
        assert!(logs.iter().any(|l| l.node_id == "on_true"));
        assert!(!logs.iter().any(|l| l.node_id == "on_false"));
    }

    #[tokio::test]
    async fn test_always_pin_replaces_handler() {
        let counting = CountingHandler::new(EchoHandler::action());
        let calls = counting.calls();
        let h = harness(registry_with(counting));
        h.store
            .upsert_pin(&PinnedData {
                workflow_id: "linear".into(),
                node_id: "action_a".into(),
                user_id: "u1".into(),
                mode: PinMode::Always,
                output: json!({"pinned": true}),
                usage_count: 0,
                updated_at: Utc::now(),
            })
            .unwrap();
        let graph = WorkflowGraph::build(fixtures::linear_workflow()).unwrap();

        let mut ctx = context(JobPayload::new("linear", "u1"));
        h.executor.run(&graph, &mut ctx, &AtomicBool::new(false), None).await;

        // Only action_b reached the handler.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.node_output("action_a"), Some(&json!({"pinned": true})));
        let pin = h.store.get_pin("linear", "action_a", "u1").unwrap().unwrap();
        assert_eq!(pin.usage_count, 1);

        let logs = h.store.node_logs(&ctx.execution_id).unwrap();
        let pinned = logs.iter().find(|l| l.node_id == "action_a").unwrap();
        assert!(pinned.pinned);
        assert_eq!(pinned.status, NodeLogStatus::Success);
    }

    #[tokio::test]
    async fn test_on_error_pin_rescues_failure() {
        let h = harness(registry_with(FailingHandler::action("down")));
        h.store
            .upsert_pin(&PinnedData {
                workflow_id: "linear".into(),
                node_id: "action_a".into(),
                user_id: "u1".into(),
                mode: PinMode::OnError,
                output: json!({"fallback": 1}),
                usage_count: 0,
                updated_at: Utc::now(),
            })
            .unwrap();
        let graph = WorkflowGraph::build(fixtures::linear_workflow()).unwrap();
        let mut ctx = context(JobPayload::new("linear", "u1"));

        h.executor.run(&graph, &mut ctx, &AtomicBool::new(false), None).await;

        assert_eq!(ctx.node_status("action_a"), NodeStatus::Success);
        assert_eq!(ctx.node_status("action_b"), NodeStatus::Error);
        let pin = h.store.get_pin("linear", "action_a", "u1").unwrap().unwrap();
        assert_eq!(pin.usage_count, 1);
    }

    #[tokio::test]
    async fn test_cancel_flag_stops_before_first_node() {
        let h = harness(registry_with(EchoHandler::action()));
        let graph = WorkflowGraph::build(fixtures::linear_workflow()).unwrap();
        let mut ctx = context(JobPayload::new("linear", "u1"));

        let outcome = h.executor.run(&graph, &mut ctx, &AtomicBool::new(true), None).await;

        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert_eq!(outcome.nodes_executed, 0);
        assert!(h.store.node_logs(&ctx.execution_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_required_input_failure_fails_node() {
        let h = harness(registry_with(EchoHandler::action()));
        let graph = WorkflowGraph::build(fixtures::required_input_workflow()).unwrap();
        let mut ctx = context(JobPayload::new("required", "u1"));

        let outcome = h.executor.run(&graph, &mut ctx, &AtomicBool::new(false), None).await;

        assert_eq!(outcome.status, ExecutionStatus::Error);
        assert!(matches!(
            outcome.error,
            Some(WeftError::VariableResolution { ref name, .. }) if name == "email"
        ));
    }
}
