//! Alert rule evaluation.
//!
//! Each enabled rule is checked on its own `check_interval_secs`. A met
//! condition opens an incident only if the store grants the cooldown claim
//! (`claim_rule_trigger`), which is atomic, so two evaluators sharing a
//! database never double-fire a rule.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::alert::{
    ActionResult, AlertCondition, AlertIncident, AlertRule, AlertScope, IncidentStatus,
};
use weft_core::error::{Result, WeftError};
use weft_core::telemetry::ExecutionIndexEntry;
use weft_core::traits::{AlertStore, Notifier, PersistenceClient, TelemetryStore};
use weft_core::types::ExecutionStatus;

pub struct AlertEvaluator {
    store: Arc<dyn PersistenceClient>,
    notifiers: HashMap<String, Arc<dyn Notifier>>,
    incident_ttl: Option<chrono::Duration>,
    next_due: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertEvaluator {
    pub fn new(store: Arc<dyn PersistenceClient>) -> Self {
        Self {
            store,
            notifiers: HashMap::new(),
            incident_ttl: None,
            next_due: Mutex::new(HashMap::new()),
        }
    }

    /// Register the notifier for one action kind, replacing any earlier one.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.insert(notifier.kind().to_string(), notifier);
        self
    }

    /// Auto-resolve active incidents older than `hours` (0 disables).
    pub fn with_incident_ttl(mut self, hours: i64) -> Self {
        self.incident_ttl = (hours > 0).then(|| chrono::Duration::hours(hours));
        self
    }

    /// Compute a rule's condition at `now`.
    ///
    /// Returns the incident context when the condition is met.
    pub fn evaluate_rule(&self, rule: &AlertRule, now: DateTime<Utc>) -> Result<Option<Value>> {
        let kind = rule.condition.kind();
        let context = match &rule.condition {
            AlertCondition::FailureCount {
                window_minutes,
                threshold,
            } => {
                let entries = self.window(&rule.scope, *window_minutes, now)?;
                let failures = count_failures(&entries);
                (failures >= *threshold).then(|| {
                    json!({"failures": failures, "windowMinutes": window_minutes, "threshold": threshold})
                })
            }
            AlertCondition::FailureRate {
                window_minutes,
                threshold,
                min_samples,
            } => {
                let entries = self.window(&rule.scope, *window_minutes, now)?;
                let total = entries.len() as u64;
                let failures = count_failures(&entries);
                let rate = if total == 0 {
                    0.0
                } else {
                    failures as f64 / total as f64
                };
                (total >= *min_samples && total > 0 && rate >= *threshold).then(|| {
                    json!({"failures": failures, "total": total, "rate": rate, "threshold": threshold})
                })
            }
            AlertCondition::DurationThreshold {
                window_minutes,
                max_duration_ms,
                threshold,
            } => {
                let entries = self.window(&rule.scope, *window_minutes, now)?;
                let slow: Vec<&str> = entries
                    .iter()
                    .filter(|e| e.duration_ms.is_some_and(|d| d > *max_duration_ms))
                    .map(|e| e.execution_id.as_str())
                    .collect();
                (slow.len() as u64 >= *threshold).then(|| {
                    json!({"slowExecutions": slow.len(), "maxDurationMs": max_duration_ms, "executionIds": slow})
                })
            }
            AlertCondition::QueueBacklog {
                queue_name,
                max_waiting,
            } => {
                let latest = self.store.queue_health(queue_name, 1)?;
                latest
                    .first()
                    .filter(|s| s.waiting_count > *max_waiting)
                    .map(|s| {
                        json!({
                            "queueName": queue_name,
                            "waiting": s.waiting_count,
                            "maxWaiting": max_waiting,
                            "capturedAt": s.captured_at,
                        })
                    })
            }
            AlertCondition::ErrorPattern {
                window_minutes,
                pattern,
                threshold,
            } => {
                let re = Regex::new(pattern).map_err(|e| {
                    WeftError::Config(format!("rule '{}': invalid pattern: {}", rule.id, e))
                })?;
                let entries = self.window(&rule.scope, *window_minutes, now)?;
                let matched: Vec<&str> = entries
                    .iter()
                    .filter_map(|e| e.error_message.as_deref())
                    .filter(|msg| re.is_match(msg))
                    .collect();
                (matched.len() as u64 >= *threshold).then(|| {
                    json!({"matches": matched.len(), "pattern": pattern, "sample": matched.first()})
                })
            }
            AlertCondition::CostThreshold { budget_usd } => {
                let midnight = now
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|t| t.and_utc())
                    .unwrap_or(now);
                let spent: f64 = self
                    .store
                    .executions_since(midnight)?
                    .iter()
                    .filter(|e| in_scope(&rule.scope, e))
                    .map(|e| e.total_cost)
                    .sum();
                (spent >= *budget_usd).then(|| json!({"spentUsd": spent, "budgetUsd": budget_usd}))
            }
            AlertCondition::Custom {
                metric_name,
                window_minutes,
                operator,
                threshold,
            } => {
                let since = now - chrono::Duration::minutes(*window_minutes);
                let observed: f64 = self
                    .store
                    .metric_snapshots(metric_name, since)?
                    .iter()
                    .filter(|s| match &rule.scope.workflow_id {
                        Some(wf) => s.labels.get("workflow") == Some(wf),
                        None => true,
                    })
                    .map(|s| s.value)
                    .sum();
                operator.compare(observed, *threshold).then(|| {
                    json!({"metric": metric_name, "observed": observed, "threshold": threshold})
                })
            }
        };

        debug!(rule_id = %rule.id, condition = kind, met = context.is_some(), "Rule evaluated");
        Ok(context.map(|mut c| {
            if let Value::Object(map) = &mut c {
                map.insert("conditionType".into(), json!(kind));
                map.insert("ruleName".into(), json!(rule.name));
            }
            c
        }))
    }

    /// Evaluate one rule and, when it fires outside its cooldown, open an
    /// incident and run its actions.
    pub async fn check_rule(&self, rule: &AlertRule, now: DateTime<Utc>) -> Result<Option<AlertIncident>> {
        if !rule.enabled || !rule.cooldown_elapsed(now) {
            return Ok(None);
        }
        let Some(context) = self.evaluate_rule(rule, now)? else {
            return Ok(None);
        };
        if !self.store.claim_rule_trigger(&rule.id, now)? {
            debug!(rule_id = %rule.id, "Rule in cooldown, no incident");
            return Ok(None);
        }

        let mut incident = AlertIncident {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            status: IncidentStatus::Active,
            severity: rule.severity,
            context,
            action_results: Vec::new(),
            triggered_at: now,
            resolved_at: None,
        };
        self.store.insert_incident(&incident)?;
        warn!(
            rule_id = %rule.id,
            incident_id = %incident.id,
            severity = incident.severity.as_str(),
            "Alert incident opened"
        );

        incident.action_results = self.dispatch(rule, &incident).await;
        self.store
            .set_incident_actions(&incident.id, &incident.action_results)?;
        // An operator may have moved the incident on while actions ran.
        Ok(Some(self.store.get_incident(&incident.id)?.unwrap_or(incident)))
    }

    async fn dispatch(&self, rule: &AlertRule, incident: &AlertIncident) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(rule.actions.len());
        for action in &rule.actions {
            let kind = action.kind();
            let outcome = match self.notifiers.get(kind) {
                Some(notifier) => notifier.notify(action, rule, incident).await,
                None => Err(WeftError::Notify {
                    channel: kind.to_string(),
                    message: "no notifier registered".to_string(),
                }),
            };
            results.push(match outcome {
                Ok(()) => ActionResult {
                    action: kind.to_string(),
                    success: true,
                    message: None,
                },
                Err(e) => {
                    warn!(rule_id = %rule.id, action = kind, error = %e, "Alert action failed");
                    ActionResult {
                        action: kind.to_string(),
                        success: false,
                        message: Some(e.to_string()),
                    }
                }
            });
        }
        results
    }

    /// One evaluator pass: check every due rule, then expire old incidents.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<AlertIncident>> {
        let rules = self.store.list_alert_rules(true)?;
        let mut opened = Vec::new();

        for rule in &rules {
            if !self.take_due(rule, now) {
                continue;
            }
            match self.check_rule(rule, now).await {
                Ok(Some(incident)) => opened.push(incident),
                Ok(None) => {}
                Err(e) => error!(rule_id = %rule.id, error = %e, "Alert rule evaluation failed"),
            }
        }

        if let Some(ttl) = self.incident_ttl {
            let expired = self.store.expire_incidents(now - ttl)?;
            if expired > 0 {
                info!(count = expired, "Expired stale incidents");
            }
        }
        Ok(opened)
    }

    /// Whether `rule` is due at `now`; if so, schedule its next check.
    fn take_due(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        let mut next_due = self.next_due.lock().unwrap();
        if next_due.get(&rule.id).is_some_and(|due| *due > now) {
            return false;
        }
        let interval = chrono::Duration::seconds(rule.check_interval_secs.max(1) as i64);
        next_due.insert(rule.id.clone(), now + interval);
        true
    }

    /// Run until cancelled, waking every `tick` to check due rules.
    pub async fn run(self: Arc<Self>, tick: Duration, cancel: CancellationToken) {
        info!(tick_secs = tick.as_secs(), notifiers = self.notifiers.len(), "Alert evaluator started");
        let mut ticker = tokio::time::interval(tick.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Alert evaluator cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "Alert evaluator pass failed");
                    }
                }
            }
        }
    }

    fn window(
        &self,
        scope: &AlertScope,
        window_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExecutionIndexEntry>> {
        let since = now - chrono::Duration::minutes(window_minutes);
        Ok(self
            .store
            .executions_since(since)?
            .into_iter()
            .filter(|e| e.started_at <= now && in_scope(scope, e))
            .collect())
    }
}

fn in_scope(scope: &AlertScope, entry: &ExecutionIndexEntry) -> bool {
    scope.matches(entry.workspace_id.as_deref(), &entry.workflow_id, &entry.tags)
}

fn count_failures(entries: &[ExecutionIndexEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.status == ExecutionStatus::Error)
        .count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use weft_core::alert::{AlertAction, AlertSeverity, ThresholdOperator};
    use weft_core::telemetry::{bucket_bounds, MetricsSnapshot, QueueHealthSnapshot};
    use weft_core::types::ExecutionId;
    use weft_store::SqliteStore;
    use weft_test_utils::RecordingNotifier;

    struct Harness {
        store: Arc<SqliteStore>,
        evaluator: AlertEvaluator,
        webhook: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let webhook = Arc::new(RecordingNotifier::new("webhook"));
        let evaluator = AlertEvaluator::new(store.clone()).with_notifier(webhook.clone());
        Harness {
            store,
            evaluator,
            webhook,
        }
    }

    fn entry(id: &str, workflow: &str, status: ExecutionStatus, minutes_ago: i64) -> ExecutionIndexEntry {
        let started_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        ExecutionIndexEntry {
            execution_id: ExecutionId::from_string(id),
            workflow_id: workflow.into(),
            workflow_name: workflow.into(),
            workspace_id: None,
            user_id: "u1".into(),
            tags: vec![],
            status,
            trigger_type: "manual".into(),
            error_message: (status == ExecutionStatus::Error).then(|| "ECONNRESET from crm".to_string()),
            error_code: None,
            payload_text: String::new(),
            started_at,
            completed_at: Some(started_at + chrono::Duration::seconds(1)),
            duration_ms: Some(1000),
            nodes_executed: 1,
            total_cost: 0.5,
        }
    }

    fn seed(store: &SqliteStore, failures: usize, successes: usize) {
        for i in 0..failures {
            store
                .upsert_index_entry(&entry(&format!("f{}", i), "wf", ExecutionStatus::Error, 1))
                .unwrap();
        }
        for i in 0..successes {
            store
                .upsert_index_entry(&entry(&format!("s{}", i), "wf", ExecutionStatus::Success, 1))
                .unwrap();
        }
    }

    fn failure_rule(threshold: u64) -> AlertRule {
        let mut rule = AlertRule::new(
            "failures",
            AlertCondition::FailureCount {
                window_minutes: 10,
                threshold,
            },
        );
        rule.severity = AlertSeverity::Critical;
        rule.actions = vec![AlertAction::Webhook {
            url: "https://hooks.example.com/alerts".into(),
        }];
        rule
    }

    #[test]
    fn test_failure_count_respects_scope_and_window() {
        let h = harness();
        seed(&h.store, 3, 2);
        h.store
            .upsert_index_entry(&entry("old", "wf", ExecutionStatus::Error, 30))
            .unwrap();
        h.store
            .upsert_index_entry(&entry("other", "billing", ExecutionStatus::Error, 1))
            .unwrap();

        let mut rule = failure_rule(4);
        assert!(h.evaluator.evaluate_rule(&rule, Utc::now()).unwrap().is_some());

        rule.scope.workflow_id = Some("wf".into());
        assert!(h.evaluator.evaluate_rule(&rule, Utc::now()).unwrap().is_none());

        rule.condition = AlertCondition::FailureCount {
            window_minutes: 10,
            threshold: 3,
        };
        let context = h.evaluator.evaluate_rule(&rule, Utc::now()).unwrap().unwrap();
        assert_eq!(context["failures"], 3);
        assert_eq!(context["conditionType"], "failure_count");
    }

    #[test]
    fn test_failure_rate_needs_min_samples() {
        let h = harness();
        seed(&h.store, 3, 1);
        let mut rule = AlertRule::new(
            "rate",
            AlertCondition::FailureRate {
                window_minutes: 10,
                threshold: 0.5,
                min_samples: 10,
            },
        );
        assert!(h.evaluator.evaluate_rule(&rule, Utc::now()).unwrap().is_none());

        rule.condition = AlertCondition::FailureRate {
            window_minutes: 10,
            threshold: 0.5,
            min_samples: 4,
        };
        let context = h.evaluator.evaluate_rule(&rule, Utc::now()).unwrap().unwrap();
        assert_eq!(context["rate"], 0.75);
    }

    #[test]
    fn test_duration_pattern_and_cost_conditions() {
        let h = harness();
        seed(&h.store, 2, 2);

        let slow = AlertRule::new(
            "slow",
            AlertCondition::DurationThreshold {
                window_minutes: 10,
                max_duration_ms: 500,
                threshold: 4,
            },
        );
        assert!(h.evaluator.evaluate_rule(&slow, Utc::now()).unwrap().is_some());

        let pattern = AlertRule::new(
            "reset",
            AlertCondition::ErrorPattern {
                window_minutes: 10,
                pattern: "ECONN(RESET|REFUSED)".into(),
                threshold: 2,
            },
        );
        assert!(h.evaluator.evaluate_rule(&pattern, Utc::now()).unwrap().is_some());

        let bad = AlertRule::new(
            "bad",
            AlertCondition::ErrorPattern {
                window_minutes: 10,
                pattern: "(".into(),
                threshold: 1,
            },
        );
        assert!(matches!(
            h.evaluator.evaluate_rule(&bad, Utc::now()),
            Err(WeftError::Config(_))
        ));

        let cost = AlertRule::new("cost", AlertCondition::CostThreshold { budget_usd: 2.0 });
        let context = h.evaluator.evaluate_rule(&cost, Utc::now()).unwrap().unwrap();
        assert_eq!(context["spentUsd"], 2.0);
    }

    #[test]
    fn test_queue_backlog_uses_latest_snapshot() {
        let h = harness();
        let rule = AlertRule::new(
            "backlog",
            AlertCondition::QueueBacklog {
                queue_name: "workflow-executions".into(),
                max_waiting: 10,
            },
        );
        assert!(h.evaluator.evaluate_rule(&rule, Utc::now()).unwrap().is_none());

        h.store
            .insert_queue_health(&QueueHealthSnapshot {
                queue_name: "workflow-executions".into(),
                waiting_count: 25,
                active_count: 5,
                failed_count: 0,
                delayed_count: 0,
                worker_count: 5,
                captured_at: Utc::now(),
            })
            .unwrap();
        let context = h.evaluator.evaluate_rule(&rule, Utc::now()).unwrap().unwrap();
        assert_eq!(context["waiting"], 25);
    }

    #[test]
    fn test_custom_metric_condition() {
        let h = harness();
        let now = Utc::now();
        let (bucket_start, bucket_end) = bucket_bounds(now, 60);
        let mut labels = BTreeMap::new();
        labels.insert("workflow".to_string(), "wf".to_string());
        h.store
            .increment_metric(&MetricsSnapshot {
                metric_name: "cost_usd".into(),
                bucket_start,
                bucket_end,
                value: 7.5,
                p50: None,
                p90: None,
                p95: None,
                p99: None,
                labels,
            })
            .unwrap();

        let mut rule = AlertRule::new(
            "spend",
            AlertCondition::Custom {
                metric_name: "cost_usd".into(),
                window_minutes: 5,
                operator: ThresholdOperator::Gt,
                threshold: 5.0,
            },
        );
        assert!(h.evaluator.evaluate_rule(&rule, now).unwrap().is_some());

        rule.scope.workflow_id = Some("other".into());
        assert!(h.evaluator.evaluate_rule(&rule, now).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_allows_one_incident() {
        let h = harness();
        seed(&h.store, 5, 0);
        let mut rule = failure_rule(3);
        rule.condition = AlertCondition::FailureCount {
            window_minutes: 60,
            threshold: 3,
        };
        h.store.save_alert_rule(&rule).unwrap();

        let now = Utc::now();
        let first = h.evaluator.check_rule(&rule, now).await.unwrap().unwrap();
        assert_eq!(first.status, IncidentStatus::Active);
        assert_eq!(first.action_results.len(), 1);
        assert!(first.action_results[0].success);

        // The in-memory copy still has no trigger time; the store claim wins.
        for minutes in [1, 7, 14] {
            let later = now + chrono::Duration::minutes(minutes);
            assert!(h.evaluator.check_rule(&rule, later).await.unwrap().is_none());
        }
        assert_eq!(h.store.list_incidents(None).unwrap().len(), 1);
        assert_eq!(h.webhook.deliveries().len(), 1);

        let after = now + chrono::Duration::minutes(15);
        assert!(h.evaluator.check_rule(&rule, after).await.unwrap().is_some());
        assert_eq!(h.store.list_incidents(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_action_failures_are_recorded() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let evaluator = AlertEvaluator::new(store.clone())
            .with_notifier(Arc::new(RecordingNotifier::failing("webhook")));
        seed(&store, 3, 0);

        let mut rule = failure_rule(1);
        rule.actions.push(AlertAction::Email {
            to: vec!["ops@example.com".into()],
        });
        store.save_alert_rule(&rule).unwrap();

        let incident = evaluator.check_rule(&rule, Utc::now()).await.unwrap().unwrap();
        assert_eq!(incident.action_results.len(), 2);
        assert!(incident.action_results.iter().all(|r| !r.success));
        assert_eq!(incident.action_results[1].action, "email");

        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.action_results, incident.action_results);
    }

    /// Acknowledges the incident it is asked to deliver, like an operator
    /// racing a slow webhook.
    struct AckingNotifier {
        store: Arc<SqliteStore>,
    }

    impl Notifier for AckingNotifier {
        fn kind(&self) -> &str {
            "webhook"
        }

        fn notify(
            &self,
            _action: &AlertAction,
            _rule: &AlertRule,
            incident: &AlertIncident,
        ) -> futures::future::BoxFuture<'_, Result<()>> {
            let id = incident.id.clone();
            Box::pin(async move {
                self.store
                    .set_incident_status(&id, IncidentStatus::Acknowledged, Utc::now())?;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_status_change_during_dispatch_survives() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let evaluator = AlertEvaluator::new(store.clone()).with_notifier(Arc::new(AckingNotifier {
            store: store.clone(),
        }));
        seed(&store, 3, 0);
        let rule = failure_rule(1);
        store.save_alert_rule(&rule).unwrap();

        let incident = evaluator.check_rule(&rule, Utc::now()).await.unwrap().unwrap();
        assert_eq!(incident.status, IncidentStatus::Acknowledged);

        let stored = store.get_incident(&incident.id).unwrap().unwrap();
        assert_eq!(stored.status, IncidentStatus::Acknowledged);
        assert_eq!(stored.action_results.len(), 1);
        assert!(stored.action_results[0].success);
    }

    #[tokio::test]
    async fn test_tick_honors_check_interval() {
        let h = harness();
        seed(&h.store, 3, 0);
        let mut rule = failure_rule(1);
        rule.cooldown_minutes = 0;
        rule.check_interval_secs = 300;
        h.store.save_alert_rule(&rule).unwrap();

        let now = Utc::now();
        assert_eq!(h.evaluator.tick(now).await.unwrap().len(), 1);
        // Not due again until the interval passes.
        let soon = now + chrono::Duration::seconds(60);
        assert!(h.evaluator.tick(soon).await.unwrap().is_empty());
        let due = now + chrono::Duration::seconds(300);
        assert_eq!(h.evaluator.tick(due).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_expires_stale_incidents() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let evaluator = AlertEvaluator::new(store.clone()).with_incident_ttl(24);
        store
            .insert_incident(&AlertIncident {
                id: "stale".into(),
                rule_id: "r".into(),
                status: IncidentStatus::Active,
                severity: AlertSeverity::Warning,
                context: json!({}),
                action_results: vec![],
                triggered_at: Utc::now() - chrono::Duration::hours(30),
                resolved_at: None,
            })
            .unwrap();

        evaluator.tick(Utc::now()).await.unwrap();
        let stale = store.get_incident("stale").unwrap().unwrap();
        assert_eq!(stale.status, IncidentStatus::Resolved);
    }
}
