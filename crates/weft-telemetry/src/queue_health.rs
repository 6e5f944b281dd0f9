use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::error::Result;
use weft_core::telemetry::QueueHealthSnapshot;
use weft_core::traits::{QueueClient, TelemetryStore};

/// Samples a queue's depth on a fixed cadence.
pub struct QueueHealthMonitor {
    queue: Arc<dyn QueueClient>,
    store: Arc<dyn TelemetryStore>,
    worker_count: usize,
}

impl QueueHealthMonitor {
    pub fn new(queue: Arc<dyn QueueClient>, store: Arc<dyn TelemetryStore>, worker_count: usize) -> Self {
        Self {
            queue,
            store,
            worker_count,
        }
    }

    /// Take and persist one snapshot.
    pub async fn capture(&self) -> Result<QueueHealthSnapshot> {
        let stats = self.queue.stats().await?;
        let snapshot = QueueHealthSnapshot {
            queue_name: self.queue.name().to_string(),
            waiting_count: stats.waiting,
            active_count: stats.active,
            failed_count: stats.failed,
            delayed_count: stats.delayed,
            worker_count: self.worker_count,
            captured_at: Utc::now(),
        };
        self.store.insert_queue_health(&snapshot)?;
        Ok(snapshot)
    }

    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        info!(queue = %self.queue.name(), interval_secs = interval.as_secs(), "Queue health monitor started");
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Queue health monitor cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match self.capture().await {
                        Ok(s) => debug!(waiting = s.waiting_count, active = s.active_count, "Queue health captured"),
                        Err(e) => warn!(error = %e, "Queue health capture failed"),
                    }
                }
            }
        }
    }
}
