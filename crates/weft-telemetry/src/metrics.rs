use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::error::Result;
use weft_core::telemetry::{bucket_bounds, MetricsSnapshot};
use weft_core::traits::{ExecutionObserver, TelemetryStore};
use weft_core::types::{ExecutionRecord, ExecutionStatus, NodeLog};
use weft_core::workflow::WorkflowDefinition;

pub const EXECUTIONS_TOTAL: &str = "executions_total";
pub const EXECUTIONS_FAILED: &str = "executions_failed";
pub const NODES_EXECUTED: &str = "nodes_executed";
pub const COST_USD: &str = "cost_usd";
pub const EXECUTION_DURATION_MS: &str = "execution_duration_ms";

fn workflow_labels(workflow_id: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("workflow".to_string(), workflow_id.to_string());
    labels
}

fn snapshot(
    name: &str,
    bounds: (DateTime<Utc>, DateTime<Utc>),
    value: f64,
    labels: BTreeMap<String, String>,
) -> MetricsSnapshot {
    MetricsSnapshot {
        metric_name: name.to_string(),
        bucket_start: bounds.0,
        bucket_end: bounds.1,
        value,
        p50: None,
        p90: None,
        p95: None,
        p99: None,
        labels,
    }
}

/// Nearest-rank percentile over an ascending slice.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Bumps per-bucket counters for each finished execution.
pub struct MetricsRecorder {
    store: Arc<dyn TelemetryStore>,
    bucket_secs: i64,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn TelemetryStore>, bucket_secs: i64) -> Self {
        Self { store, bucket_secs }
    }

    pub fn record(&self, record: &ExecutionRecord) -> Result<()> {
        let at = record.completed_at.unwrap_or_else(Utc::now);
        let bounds = bucket_bounds(at, self.bucket_secs);
        let labels = workflow_labels(&record.workflow_id);

        let mut counters = vec![
            (EXECUTIONS_TOTAL, 1.0),
            (NODES_EXECUTED, record.nodes_executed as f64),
        ];
        if record.status == ExecutionStatus::Error {
            counters.push((EXECUTIONS_FAILED, 1.0));
        }
        if record.total_cost > 0.0 {
            counters.push((COST_USD, record.total_cost));
        }

        for (name, value) in counters {
            self.store
                .increment_metric(&snapshot(name, bounds, value, labels.clone()))?;
        }
        Ok(())
    }
}

impl ExecutionObserver for MetricsRecorder {
    fn on_finished(
        &self,
        record: &ExecutionRecord,
        _workflow: Option<&WorkflowDefinition>,
        _logs: &[NodeLog],
    ) -> Result<()> {
        self.record(record)
    }
}

/// Periodically writes `execution_duration_ms` histogram snapshots.
///
/// Each pass recomputes the current and previous bucket from the execution
/// index, so late-finishing executions land in the right bucket.
pub struct MetricsRollup {
    store: Arc<dyn TelemetryStore>,
    bucket_secs: i64,
}

impl MetricsRollup {
    pub fn new(store: Arc<dyn TelemetryStore>, bucket_secs: i64) -> Self {
        Self {
            store,
            bucket_secs: bucket_secs.max(1),
        }
    }

    /// Recompute histograms for the buckets around `now`. Returns the number
    /// of snapshots written.
    pub fn rollup(&self, now: DateTime<Utc>) -> Result<usize> {
        let (current_start, _) = bucket_bounds(now, self.bucket_secs);
        let since = current_start - chrono::Duration::seconds(self.bucket_secs);

        let mut samples: HashMap<(DateTime<Utc>, String), Vec<f64>> = HashMap::new();
        for entry in self.store.executions_since(since)? {
            let Some(duration) = entry.duration_ms else {
                continue;
            };
            let (start, _) = bucket_bounds(entry.started_at, self.bucket_secs);
            samples
                .entry((start, entry.workflow_id))
                .or_default()
                .push(duration as f64);
        }

        let written = samples.len();
        for ((start, workflow_id), mut durations) in samples {
            durations.sort_by(|a, b| a.total_cmp(b));
            let mean = durations.iter().sum::<f64>() / durations.len() as f64;
            let mut snap = snapshot(
                EXECUTION_DURATION_MS,
                bucket_bounds(start, self.bucket_secs),
                mean,
                workflow_labels(&workflow_id),
            );
            snap.p50 = percentile(&durations, 50.0);
            snap.p90 = percentile(&durations, 90.0);
            snap.p95 = percentile(&durations, 95.0);
            snap.p99 = percentile(&durations, 99.0);
            self.store.upsert_metric_snapshot(&snap)?;
        }
        Ok(written)
    }

    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Metrics rollup started");
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Metrics rollup cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match self.rollup(Utc::now()) {
                        Ok(n) => debug!(snapshots = n, "Metrics rolled up"),
                        Err(e) => warn!(error = %e, "Metrics rollup failed"),
                    }
                }
            }
        }
    }
}
