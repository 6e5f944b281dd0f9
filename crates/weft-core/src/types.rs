use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for one run of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an execution was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    #[default]
    Manual,
    Webhook,
    Scheduled,
    Api,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Webhook => "webhook",
            Self::Scheduled => "scheduled",
            Self::Api => "api",
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "webhook" => Ok(Self::Webhook),
            "scheduled" => Ok(Self::Scheduled),
            "api" => Ok(Self::Api),
            other => Err(format!("unknown trigger type '{}'", other)),
        }
    }
}

/// Queue message requesting one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub workflow_id: String,
    pub user_id: String,
    #[serde(default)]
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub trigger_data: Value,
    /// Caller-supplied variable values, pre-seeded into the execution's
    /// variable cache.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub execution_id: Option<ExecutionId>,
    #[serde(default)]
    pub skip_budget_check: bool,
    #[serde(default)]
    pub is_test: bool,
}

impl JobPayload {
    pub fn new(workflow_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            user_id: user_id.into(),
            trigger_type: TriggerType::Manual,
            trigger_data: Value::Null,
            variables: HashMap::new(),
            execution_id: None,
            skip_budget_check: false,
            is_test: false,
        }
    }

    pub fn with_trigger(mut self, trigger_type: TriggerType, data: Value) -> Self {
        self.trigger_type = trigger_type;
        self.trigger_data = data;
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn test_mode(mut self) -> Self {
        self.is_test = true;
        self
    }

    /// Return the execution id, generating one if the caller did not.
    pub fn ensure_execution_id(&mut self) -> ExecutionId {
        self.execution_id.get_or_insert_with(ExecutionId::new).clone()
    }
}

/// Terminal status reported in a job result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResultStatus {
    Success,
    Error,
    Cancelled,
}

/// What a worker reports once an execution reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub execution_id: ExecutionId,
    pub status: JobResultStatus,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub nodes_executed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
}

/// Queue-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// Coarse progress checkpoints observers can poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum JobProgress {
    Queued,
    Running,
    Node {
        index: usize,
        total: usize,
        node_id: String,
    },
    Completed,
    Failed,
}

/// A job as stored by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub state: JobState,
    /// Attempts started so far, including the current one if active.
    pub attempts: u32,
    pub max_attempts: u32,
    pub progress: JobProgress,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub result: Option<JobResult>,
}

/// Per-queue counters for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub paused: bool,
}

/// Execution lifecycle: `Running -> {Success, Error, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

/// Per-node lifecycle: `Pending -> Running -> {Success, Error, Skipped}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Running,
    Success,
    Error,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLogStatus {
    Started,
    Success,
    Error,
}

impl NodeLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for NodeLogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown node log status '{}'", other)),
        }
    }
}

/// One node invocation, written at start and finalized exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeLog {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub node_type: String,
    pub attempt: u32,
    pub status: NodeLogStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub tokens_used: Option<u64>,
    pub cost_usd: Option<f64>,
    /// Output came from pinned data instead of the handler.
    #[serde(default)]
    pub pinned: bool,
}

impl NodeLog {
    pub fn started(
        execution_id: ExecutionId,
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        attempt: u32,
        input: Option<Value>,
    ) -> Self {
        Self {
            execution_id,
            node_id: node_id.into(),
            node_type: node_type.into(),
            attempt,
            status: NodeLogStatus::Started,
            input,
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            tokens_used: None,
            cost_usd: None,
            pinned: false,
        }
    }

    /// Transition to `success`. No-op unless the log is still `started`.
    pub fn succeed(&mut self, output: Value, tokens_used: Option<u64>, cost_usd: Option<f64>) {
        if self.status != NodeLogStatus::Started {
            return;
        }
        self.status = NodeLogStatus::Success;
        self.output = Some(output);
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self.finish();
    }

    /// Transition to `error`. No-op unless the log is still `started`.
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.status != NodeLogStatus::Started {
            return;
        }
        self.status = NodeLogStatus::Error;
        self.error = Some(error.into());
        self.finish();
    }

    fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.completed_at = Some(now);
    }
}

/// Persisted form of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub user_id: String,
    pub trigger_type: TriggerType,
    pub trigger_data: Value,
    pub status: ExecutionStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub nodes_executed: usize,
    pub total_cost: f64,
    pub is_test: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn duration_ms(&self) -> Option<u64> {
        self.completed_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

/// When pinned output may replace a node's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    Always,
    #[default]
    Development,
    OnError,
    Disabled,
}

impl PinMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::Development => "development",
            Self::OnError => "on_error",
            Self::Disabled => "disabled",
        }
    }

    /// Whether the pin replaces the handler before it is invoked.
    pub fn substitutes(&self, is_test: bool) -> bool {
        match self {
            Self::Always => true,
            Self::Development => is_test,
            Self::OnError | Self::Disabled => false,
        }
    }
}

impl std::str::FromStr for PinMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" => Ok(Self::Always),
            "development" => Ok(Self::Development),
            "on_error" => Ok(Self::OnError),
            "disabled" => Ok(Self::Disabled),
            other => Err(format!("unknown pin mode '{}'", other)),
        }
    }
}

/// Cached node output keyed by `(workflow, node, user)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinnedData {
    pub workflow_id: String,
    pub node_id: String,
    pub user_id: String,
    pub mode: PinMode,
    pub output: Value,
    pub usage_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Outcome of the pre-invocation pin lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinCheck {
    pub has_pinned_data: bool,
    pub should_use_pinned: bool,
    pub pinned_output: Option<Value>,
    pub mode: Option<PinMode>,
}

/// What a node handler sees besides its resolved input.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub user_id: String,
    pub node_id: String,
    /// The node's typed config, re-serialized.
    pub config: Value,
    pub trigger_data: Value,
    /// Outputs of nodes that completed before this one.
    pub node_outputs: HashMap<String, Value>,
    pub is_test: bool,
    pub attempt: u32,
}

/// Successful handler result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerOutput {
    pub output: Value,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

impl HandlerOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            tokens_used: None,
            cost_usd: None,
        }
    }

    pub fn with_usage(mut self, tokens_used: u64, cost_usd: f64) -> Self {
        self.tokens_used = Some(tokens_used);
        self.cost_usd = Some(cost_usd);
        self
    }
}
