//! Operational monitoring over finished executions.
//!
//! The engine hands every terminal execution to its `ExecutionObserver`s;
//! `ExecutionIndexer` and `MetricsRecorder` are the two observers provided
//! here. `MetricsRollup`, `QueueHealthMonitor` and `AlertEvaluator` are
//! background loops that read what the observers wrote.

pub mod alerting;
pub mod indexer;
pub mod metrics;
pub mod notify;
pub mod queue_health;

pub use alerting::AlertEvaluator;
pub use indexer::ExecutionIndexer;
pub use metrics::{percentile, MetricsRecorder, MetricsRollup};
pub use notify::{ChatNotifier, WebhookNotifier};
pub use queue_health::QueueHealthMonitor;
