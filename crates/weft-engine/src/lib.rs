pub mod backoff;
pub mod cancel;
pub mod context;
pub mod engine;
pub mod executor;
pub mod graph;
pub mod handler;
pub mod rate_limit;
pub mod run_log;
pub mod scheduler;
pub mod variables;
mod worker;

pub use backoff::backoff_delay;
pub use cancel::CancelRegistry;
pub use context::ExecutionContext;
pub use engine::Engine;
pub use executor::{ExecutionOutcome, NodeExecutor, ProgressReporter};
pub use graph::WorkflowGraph;
pub use handler::{ConditionHandler, HandlerRegistry, OutputHandler, TriggerHandler};
pub use rate_limit::RateLimiter;
pub use run_log::RunLogger;
pub use scheduler::CronScheduler;
pub use variables::{apply_transforms, get_path, ResolvedVariable, VariableStore};
