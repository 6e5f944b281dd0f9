//! Alert rules watched over execution telemetry, and the incidents they raise.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A condition watched over execution telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: AlertScope,
    pub condition: AlertCondition,
    #[serde(default)]
    pub severity: AlertSeverity,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: i64,
    /// How often the evaluator checks this rule.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub last_triggered_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown_minutes() -> i64 {
    15
}

fn default_check_interval_secs() -> u64 {
    60
}

impl AlertRule {
    pub fn new(id: impl Into<String>, condition: AlertCondition) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            enabled: true,
            scope: AlertScope::default(),
            condition,
            severity: AlertSeverity::default(),
            actions: vec![],
            cooldown_minutes: default_cooldown_minutes(),
            check_interval_secs: default_check_interval_secs(),
            last_triggered_at: None,
        }
    }

    /// True when no incident was raised within the cooldown window before `now`.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_triggered_at {
            None => true,
            Some(last) => now - last >= Duration::minutes(self.cooldown_minutes),
        }
    }
}

/// Which executions a rule looks at. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertScope {
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub workflow_id: Option<String>,
    /// An execution matches when its workflow carries any of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AlertScope {
    pub fn matches(&self, workspace_id: Option<&str>, workflow_id: &str, tags: &[String]) -> bool {
        if let Some(ws) = &self.workspace_id {
            if workspace_id != Some(ws.as_str()) {
                return false;
            }
        }
        if let Some(wf) = &self.workflow_id {
            if wf != workflow_id {
                return false;
            }
        }
        self.tags.is_empty() || self.tags.iter().any(|t| tags.contains(t))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "conditionType",
    content = "conditionConfig",
    rename_all = "snake_case"
)]
pub enum AlertCondition {
    /// Failed executions within the window reach `threshold`.
    #[serde(rename_all = "camelCase")]
    FailureCount { window_minutes: i64, threshold: u64 },
    /// Failed / total within the window reaches `threshold` (0..=1),
    /// once at least `min_samples` executions exist.
    #[serde(rename_all = "camelCase")]
    FailureRate {
        window_minutes: i64,
        threshold: f64,
        #[serde(default = "default_min_samples")]
        min_samples: u64,
    },
    /// At least `threshold` executions in the window ran longer than the limit.
    #[serde(rename_all = "camelCase")]
    DurationThreshold {
        window_minutes: i64,
        max_duration_ms: u64,
        #[serde(default = "default_one")]
        threshold: u64,
    },
    /// The named queue's waiting count exceeds `max_waiting`.
    #[serde(rename_all = "camelCase")]
    QueueBacklog { queue_name: String, max_waiting: u64 },
    /// At least `threshold` error messages in the window match the regex.
    #[serde(rename_all = "camelCase")]
    ErrorPattern {
        window_minutes: i64,
        pattern: String,
        #[serde(default = "default_one")]
        threshold: u64,
    },
    /// Today's total cost reaches the budget.
    #[serde(rename_all = "camelCase")]
    CostThreshold { budget_usd: f64 },
    /// Sum of a recorded metric over the window compared to a threshold.
    #[serde(rename_all = "camelCase")]
    Custom {
        metric_name: String,
        window_minutes: i64,
        operator: ThresholdOperator,
        threshold: f64,
    },
}

fn default_min_samples() -> u64 {
    10
}

fn default_one() -> u64 {
    1
}

impl AlertCondition {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FailureCount { .. } => "failure_count",
            Self::FailureRate { .. } => "failure_rate",
            Self::DurationThreshold { .. } => "duration_threshold",
            Self::QueueBacklog { .. } => "queue_backlog",
            Self::ErrorPattern { .. } => "error_pattern",
            Self::CostThreshold { .. } => "cost_threshold",
            Self::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOperator {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl ThresholdOperator {
    pub fn compare(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => observed > threshold,
            Self::Gte => observed >= threshold,
            Self::Lt => observed < threshold,
            Self::Lte => observed <= threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::str::FromStr for AlertSeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Notification fired when an incident opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertAction {
    Webhook {
        url: String,
    },
    Email {
        to: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Chat {
        channel: String,
        webhook_url: String,
    },
}

impl AlertAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Webhook { .. } => "webhook",
            Self::Email { .. } => "email",
            Self::Chat { .. } => "chat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Active,
    Acknowledged,
    Resolved,
    Silenced,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
            Self::Silenced => "silenced",
        }
    }
}

impl std::str::FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            "silenced" => Ok(Self::Silenced),
            other => Err(format!("unknown incident status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A materialized trigger of an alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertIncident {
    pub id: String,
    pub rule_id: String,
    pub status: IncidentStatus,
    pub severity: AlertSeverity,
    pub context: Value,
    pub action_results: Vec<ActionResult>,
    pub triggered_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}
