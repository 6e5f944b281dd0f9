use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures::future::BoxFuture;
use serde_json::Value;

use crate::alert::{ActionResult, AlertAction, AlertIncident, AlertRule, IncidentStatus};
use crate::error::Result;
use crate::event::EngineEvent;
use crate::telemetry::{ExecutionIndexEntry, MetricsSnapshot, QueueHealthSnapshot, SearchQuery};
use crate::types::*;
use crate::workflow::{NodeType, WorkflowDefinition};

/// The business logic behind one node type.
pub trait NodeHandler: Send + Sync + 'static {
    /// The node type this handler serves.
    fn node_type(&self) -> NodeType;

    /// Run the node with its resolved input object.
    fn execute(&self, input: Value, ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>>;
}

/// One-way push of lifecycle events.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: EngineEvent);
}

/// Durable, at-least-once job queue bound to one named queue.
pub trait QueueClient: Send + Sync + 'static {
    /// Queue name.
    fn name(&self) -> &str;

    /// Insert a job. The job id is the payload's execution id.
    fn enqueue(&self, job: JobPayload, max_attempts: u32) -> BoxFuture<'_, Result<JobRecord>>;

    /// Claim the next runnable job, if any. Returns `None` while paused.
    fn dequeue(&self) -> BoxFuture<'_, Result<Option<JobRecord>>>;

    /// Mark an active job completed with its result.
    fn complete(&self, job_id: &str, result: &JobResult) -> BoxFuture<'_, Result<()>>;

    /// Mark an active job failed. With `retry_at` the job is delayed until
    /// then; without it the failure is permanent.
    fn fail(
        &self,
        job_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Record progress. On an active job this also renews its claim.
    fn update_progress(&self, job_id: &str, progress: &JobProgress) -> BoxFuture<'_, Result<()>>;

    /// Renew the claim on an active job so the stalled sweep leaves it
    /// alone. Returns false when the job is no longer active.
    fn extend_claim(&self, job_id: &str) -> BoxFuture<'_, Result<bool>>;

    fn get(&self, job_id: &str) -> BoxFuture<'_, Result<Option<JobRecord>>>;

    fn stats(&self) -> BoxFuture<'_, Result<QueueStats>>;

    /// Put a failed job back to waiting with a fresh attempt budget.
    fn retry(&self, job_id: &str) -> BoxFuture<'_, Result<()>>;

    /// Delete a job that is not currently active.
    fn remove(&self, job_id: &str) -> BoxFuture<'_, Result<bool>>;

    /// Stop new claims.
    fn pause(&self) -> BoxFuture<'_, Result<()>>;

    /// Allow claims again.
    fn resume(&self) -> BoxFuture<'_, Result<()>>;

    /// Return active jobs claimed longer ago than `older_than` to waiting.
    fn requeue_stalled(&self, older_than: Duration) -> BoxFuture<'_, Result<usize>>;
}

/// Validated workflow definitions by id.
pub trait WorkflowStore: Send + Sync {
    fn save_workflow(&self, def: &WorkflowDefinition) -> Result<()>;
    fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>>;
    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>>;
}

/// Execution rows, node logs, and pinned node data.
pub trait ExecutionStore: Send + Sync {
    /// Insert or update an execution. A terminal row never reverts.
    fn upsert_execution(&self, rec: &ExecutionRecord) -> Result<()>;
    /// Put a terminal execution back to `running` for a manual retry,
    /// keeping `started_at`. Returns false when there was nothing to reopen.
    fn reopen_execution(&self, id: &ExecutionId) -> Result<bool>;
    fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>>;

    fn insert_node_log(&self, log: &NodeLog) -> Result<()>;
    /// Write a log's terminal state. Only a `started` row is updated.
    fn finish_node_log(&self, log: &NodeLog) -> Result<()>;
    fn node_logs(&self, id: &ExecutionId) -> Result<Vec<NodeLog>>;

    fn upsert_pin(&self, pin: &PinnedData) -> Result<()>;
    fn get_pin(&self, workflow_id: &str, node_id: &str, user_id: &str)
        -> Result<Option<PinnedData>>;
    /// Look up a pin and, when it should substitute, count one use.
    fn check_pin(
        &self,
        workflow_id: &str,
        node_id: &str,
        user_id: &str,
        is_test: bool,
    ) -> Result<PinCheck>;
    /// Count one use of a pin outside `check_pin` (on-error fallback).
    fn record_pin_usage(&self, workflow_id: &str, node_id: &str, user_id: &str) -> Result<()>;
}

/// Search index, metrics, cost aggregates, and queue health.
///
/// Aggregate writes are atomic upserts at the storage layer.
pub trait TelemetryStore: Send + Sync {
    /// Insert or replace the index row keyed by execution id.
    fn upsert_index_entry(&self, entry: &ExecutionIndexEntry) -> Result<()>;
    fn search_executions(&self, query: &SearchQuery) -> Result<Vec<ExecutionIndexEntry>>;
    /// Index rows whose start time is at or after `since`.
    fn executions_since(&self, since: DateTime<Utc>) -> Result<Vec<ExecutionIndexEntry>>;

    /// Add `delta` to a counter row, creating it if needed.
    fn increment_metric(&self, snapshot: &MetricsSnapshot) -> Result<()>;
    /// Insert or replace a snapshot row (histograms).
    fn upsert_metric_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()>;
    fn metric_snapshots(&self, name: &str, since: DateTime<Utc>) -> Result<Vec<MetricsSnapshot>>;

    fn add_daily_cost(&self, user_id: &str, day: NaiveDate, cost_usd: f64) -> Result<()>;
    fn daily_cost(&self, user_id: &str, day: NaiveDate) -> Result<f64>;

    fn insert_queue_health(&self, snapshot: &QueueHealthSnapshot) -> Result<()>;
    fn queue_health(&self, queue_name: &str, limit: usize) -> Result<Vec<QueueHealthSnapshot>>;
}

/// Alert rules and incidents.
pub trait AlertStore: Send + Sync {
    fn save_alert_rule(&self, rule: &AlertRule) -> Result<()>;
    fn list_alert_rules(&self, enabled_only: bool) -> Result<Vec<AlertRule>>;
    /// Atomically set `last_triggered_at = now` if the rule is outside its
    /// cooldown. Returns whether this caller won the claim.
    fn claim_rule_trigger(&self, rule_id: &str, now: DateTime<Utc>) -> Result<bool>;

    fn insert_incident(&self, incident: &AlertIncident) -> Result<()>;
    /// Store the outcome of an incident's actions without touching its status.
    fn set_incident_actions(&self, id: &str, results: &[ActionResult]) -> Result<bool>;
    fn get_incident(&self, id: &str) -> Result<Option<AlertIncident>>;
    fn list_incidents(&self, status: Option<IncidentStatus>) -> Result<Vec<AlertIncident>>;
    /// Move an open incident to `status`. Returns false if it was not open.
    fn set_incident_status(
        &self,
        id: &str,
        status: IncidentStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;
    /// Resolve active incidents triggered before `before`.
    fn expire_incidents(&self, before: DateTime<Utc>) -> Result<usize>;
}

/// The full persistence surface the engine is constructed with.
pub trait PersistenceClient: WorkflowStore + ExecutionStore + TelemetryStore + AlertStore {}

impl<T> PersistenceClient for T where T: WorkflowStore + ExecutionStore + TelemetryStore + AlertStore {}

/// Delivers one kind of alert action.
pub trait Notifier: Send + Sync + 'static {
    /// Action kind served ("webhook", "email", "chat").
    fn kind(&self) -> &str;

    fn notify(
        &self,
        action: &AlertAction,
        rule: &AlertRule,
        incident: &AlertIncident,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Receives every execution once it reaches a terminal status.
///
/// Called by the worker after the execution row is final. Errors are
/// logged by the caller and never change the execution's outcome.
pub trait ExecutionObserver: Send + Sync + 'static {
    fn on_finished(
        &self,
        record: &ExecutionRecord,
        workflow: Option<&WorkflowDefinition>,
        logs: &[NodeLog],
    ) -> Result<()>;
}
