use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use weft_core::config::ScheduleConfig;
use weft_core::types::JobPayload;

use crate::engine::Engine;

struct CronTrigger {
    config: ScheduleConfig,
    schedule: Schedule,
}

impl CronTrigger {
    fn job(&self) -> JobPayload {
        JobPayload::new(&self.config.workflow_id, &self.config.user_id)
            .with_trigger(self.config.trigger_type(), self.config.trigger_data.clone())
    }
}

/// Enqueues `scheduled` jobs for each configured cron entry.
pub struct CronScheduler {
    triggers: Vec<CronTrigger>,
    engine: Arc<Engine>,
    cancel: CancellationToken,
}

impl CronScheduler {
    pub fn new(schedules: &[ScheduleConfig], engine: Arc<Engine>, cancel: CancellationToken) -> Self {
        let mut triggers = Vec::new();

        for config in schedules {
            match Schedule::from_str(&config.cron) {
                Ok(schedule) => {
                    info!(name = %config.name, cron = %config.cron, workflow_id = %config.workflow_id, "Schedule registered");
                    triggers.push(CronTrigger {
                        config: config.clone(),
                        schedule,
                    });
                }
                Err(e) => {
                    warn!(
                        name = %config.name,
                        cron = %config.cron,
                        error = %e,
                        "Invalid cron expression, skipping schedule"
                    );
                }
            }
        }

        Self {
            triggers,
            engine,
            cancel,
        }
    }

    /// Number of schedules with a valid cron expression.
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Run the scheduler loop. Blocks until cancelled.
    pub async fn run(&self) {
        if self.triggers.is_empty() {
            info!("No schedules configured, scheduler idle");
            self.cancel.cancelled().await;
            return;
        }

        info!(count = self.triggers.len(), "Cron scheduler started");

        loop {
            let Some((fire_at, trigger)) = self.next_fire(Utc::now()) else {
                self.cancel.cancelled().await;
                break;
            };
            let delay = (fire_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::from_millis(0));

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    match self.engine.submit(trigger.job()).await {
                        Ok(id) => info!(schedule = %trigger.config.name, execution_id = %id, "Scheduled job enqueued"),
                        Err(e) => error!(schedule = %trigger.config.name, error = %e, "Scheduled job rejected"),
                    }
                    // Step past the fire time so the same tick is not taken twice.
                    let remaining = (fire_at - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(remaining + Duration::from_millis(1)).await;
                }
                _ = self.cancel.cancelled() => {
                    info!("Cron scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// Earliest upcoming fire time after `now` across all schedules.
    fn next_fire(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, &CronTrigger)> {
        self.triggers
            .iter()
            .filter_map(|t| t.schedule.after(&now).next().map(|at| (at, t)))
            .min_by_key(|(at, _)| *at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use weft_core::config::AppConfig;
    use weft_core::event::EventBus;
    use weft_core::types::TriggerType;
    use weft_store::{SqliteQueue, SqliteStore};

    use crate::handler::HandlerRegistry;

    fn schedule(name: &str, cron: &str) -> ScheduleConfig {
        ScheduleConfig {
            name: name.into(),
            cron: cron.into(),
            workflow_id: "linear".into(),
            user_id: "scheduler".into(),
            trigger_data: json!({"source": "cron"}),
        }
    }

    fn engine() -> Arc<Engine> {
        Arc::new(Engine::new(
            AppConfig::default(),
            Arc::new(SqliteQueue::in_memory("workflow-executions").unwrap()),
            Arc::new(SqliteStore::in_memory().unwrap()),
            Arc::new(EventBus::new(8)),
            HandlerRegistry::with_builtins(),
        ))
    }

    #[test]
    fn test_invalid_expressions_are_skipped() {
        let scheduler = CronScheduler::new(
            &[schedule("ok", "0 */5 * * * *"), schedule("bad", "every five minutes")],
            engine(),
            CancellationToken::new(),
        );
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_next_fire_picks_earliest() {
        let scheduler = CronScheduler::new(
            &[schedule("hourly", "0 0 * * * *"), schedule("five", "0 */5 * * * *")],
            engine(),
            CancellationToken::new(),
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 7, 0).unwrap();
        let (at, trigger) = scheduler.next_fire(now).unwrap();
        assert_eq!(trigger.config.name, "five");
        assert_eq!(at, Utc.with_ymd_and_hms(2026, 3, 1, 10, 10, 0).unwrap());

        let job = trigger.job();
        assert_eq!(job.trigger_type, TriggerType::Scheduled);
        assert_eq!(job.trigger_data["source"], "cron");
    }

    #[tokio::test]
    async fn test_idle_scheduler_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let scheduler = CronScheduler::new(&[], engine(), cancel.clone());
        assert!(scheduler.is_empty());
        cancel.cancel();
        scheduler.run().await;
    }
}
