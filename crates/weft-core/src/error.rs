use thiserror::Error;

#[derive(Debug, Error)]
pub enum WeftError {
    // Graph errors
    #[error("Workflow validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Workflow graph contains a cycle: {}", .cycle.join(" -> "))]
    GraphCycle { cycle: Vec<String> },

    // Variable errors
    #[error("Variable '{name}' could not be resolved: {message}")]
    VariableResolution { name: String, message: String },

    // Node errors
    #[error("Node execution failed: {node_id}: {message}")]
    NodeExecution { node_id: String, message: String },

    #[error("Node timeout after {timeout_ms}ms: {node_id}")]
    Timeout { node_id: String, timeout_ms: u64 },

    #[error("No handler registered for node type: {0}")]
    HandlerNotFound(String),

    // Budget errors
    #[error("Daily budget exceeded for {user_id}: spent ${spent_usd:.4} of ${budget_usd:.4}")]
    BudgetExceeded {
        user_id: String,
        spent_usd: f64,
        budget_usd: f64,
    },

    #[error("Execution cancelled")]
    Cancelled,

    // Queue errors
    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Alerting errors
    #[error("Notifier error: {channel}: {message}")]
    Notify { channel: String, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WeftError {
    /// Whether a job that failed with this error should be retried by the queue.
    ///
    /// Graph problems, budget refusals and cancellations fail the same way on
    /// every attempt, so they are permanent.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WeftError::Validation(_)
                | WeftError::GraphCycle { .. }
                | WeftError::HandlerNotFound(_)
                | WeftError::BudgetExceeded { .. }
                | WeftError::Cancelled
                | WeftError::Config(_)
                | WeftError::ConfigNotFound(_)
                | WeftError::NotFound(_)
        )
    }

    /// Short machine-readable code stored alongside indexed executions.
    pub fn code(&self) -> &'static str {
        match self {
            WeftError::Validation(_) => "validation_error",
            WeftError::GraphCycle { .. } => "graph_cycle",
            WeftError::VariableResolution { .. } => "variable_resolution",
            WeftError::NodeExecution { .. } => "node_execution",
            WeftError::Timeout { .. } => "timeout",
            WeftError::HandlerNotFound(_) => "handler_not_found",
            WeftError::BudgetExceeded { .. } => "budget_exceeded",
            WeftError::Cancelled => "cancelled",
            WeftError::Queue(_) => "queue_error",
            WeftError::NotFound(_) => "not_found",
            WeftError::Config(_) | WeftError::ConfigNotFound(_) => "config_error",
            WeftError::Database(_) => "database_error",
            WeftError::Notify { .. } => "notify_error",
            WeftError::Io(_) => "io_error",
            WeftError::Json(_) => "json_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;
