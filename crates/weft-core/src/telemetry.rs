use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ExecutionId, ExecutionStatus};

/// Denormalized, searchable view of one completed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionIndexEntry {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub workflow_name: String,
    pub workspace_id: Option<String>,
    pub user_id: String,
    pub tags: Vec<String>,
    pub status: ExecutionStatus,
    pub trigger_type: String,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    /// Flattened `path: value` lines from the trigger payload and outputs.
    pub payload_text: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub nodes_executed: usize,
    pub total_cost: f64,
}

/// Filter for execution search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Case-insensitive substring over name, error and payload text.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub status: Option<ExecutionStatus>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default)]
    pub since: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

impl SearchQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            limit: default_limit(),
            ..Default::default()
        }
    }
}

/// Time-bucketed metric row. Counters carry only `value`; histograms add
/// percentiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub metric_name: String,
    pub bucket_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub p50: Option<f64>,
    #[serde(default)]
    pub p90: Option<f64>,
    #[serde(default)]
    pub p95: Option<f64>,
    #[serde(default)]
    pub p99: Option<f64>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Canonical, order-independent encoding of a label set, used as part of a
/// metric row's unique key.
pub fn labels_key(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Start and end of the bucket containing `at`.
pub fn bucket_bounds(at: DateTime<Utc>, bucket_secs: i64) -> (DateTime<Utc>, DateTime<Utc>) {
    let bucket_secs = bucket_secs.max(1);
    let ts = at.timestamp();
    let start = ts - ts.rem_euclid(bucket_secs);
    let start = Utc.timestamp_opt(start, 0).single().unwrap_or(at);
    (start, start + chrono::Duration::seconds(bucket_secs))
}

/// Periodic sample of a queue's depth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealthSnapshot {
    pub queue_name: String,
    pub waiting_count: u64,
    pub active_count: u64,
    pub failed_count: u64,
    pub delayed_count: u64,
    pub worker_count: usize,
    pub captured_at: DateTime<Utc>,
}
