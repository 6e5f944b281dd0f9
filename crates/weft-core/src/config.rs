use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::types::TriggerType;

/// Top-level weft configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker tasks pulling from the queue.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Default per-node handler deadline.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
    /// Idle sleep between empty dequeues.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Per-user daily spend ceiling (unset = unlimited).
    #[serde(default)]
    pub daily_budget_usd: Option<f64>,
    /// Sandboxed environment visible to `env` variables. Process env is
    /// never read directly; use `${VAR}` expansion to forward values.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            node_timeout_ms: default_node_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            daily_budget_usd: None,
            env: HashMap::new(),
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_concurrency() -> usize { 5 }
fn default_node_timeout_ms() -> u64 { 30_000 }
fn default_poll_interval_ms() -> u64 { 500 }
fn default_event_capacity() -> usize { 256 }

/// Queue, retry, and rate-limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_name")]
    pub name: String,
    /// Total attempts per job, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Jobs started per sliding window.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: usize,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    /// Active jobs older than this are considered abandoned and requeued.
    #[serde(default = "default_stalled_after_secs")]
    pub stalled_after_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: default_queue_name(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            stalled_after_secs: default_stalled_after_secs(),
        }
    }
}

fn default_queue_name() -> String { "workflow-executions".to_string() }
fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base_ms() -> u64 { 1000 }
fn default_backoff_cap_ms() -> u64 { 32_000 }
fn default_rate_limit_max() -> usize { 100 }
fn default_rate_limit_window_secs() -> u64 { 60 }
fn default_stalled_after_secs() -> u64 { 300 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> String { "~/.weft/weft.db".to_string() }

/// Background telemetry loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_metrics_bucket_secs")]
    pub metrics_bucket_secs: i64,
    #[serde(default = "default_rollup_interval_secs")]
    pub rollup_interval_secs: u64,
    #[serde(default = "default_queue_health_interval_secs")]
    pub queue_health_interval_secs: u64,
    /// Granularity of the alert evaluator's scheduling loop.
    #[serde(default = "default_alert_tick_secs")]
    pub alert_tick_secs: u64,
    /// Active incidents auto-resolve after this many hours (0 = never).
    #[serde(default = "default_incident_ttl_hours")]
    pub incident_ttl_hours: i64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics_bucket_secs: default_metrics_bucket_secs(),
            rollup_interval_secs: default_rollup_interval_secs(),
            queue_health_interval_secs: default_queue_health_interval_secs(),
            alert_tick_secs: default_alert_tick_secs(),
            incident_ttl_hours: default_incident_ttl_hours(),
        }
    }
}

fn default_metrics_bucket_secs() -> i64 { 60 }
fn default_rollup_interval_secs() -> u64 { 60 }
fn default_queue_health_interval_secs() -> u64 { 30 }
fn default_alert_tick_secs() -> u64 { 15 }
fn default_incident_ttl_hours() -> i64 { 24 }

/// JSONL lifecycle-event logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable event logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.weft/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = execution events only, 2 = node events as well.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// A cron-driven trigger that enqueues `scheduled` jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    /// Cron expression (with seconds field), e.g. "0 */5 * * * *".
    pub cron: String,
    pub workflow_id: String,
    pub user_id: String,
    #[serde(default)]
    pub trigger_data: serde_json::Value,
}

impl ScheduleConfig {
    pub fn trigger_type(&self) -> TriggerType {
        TriggerType::Scheduled
    }
}

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.engine.concurrency == 0 {
            problems.push("engine.concurrency must be at least 1");
        }
        if self.queue.max_attempts == 0 {
            problems.push("queue.max_attempts must be at least 1");
        }
        if self.queue.rate_limit_max == 0 {
            problems.push("queue.rate_limit_max must be at least 1");
        }
        if self.queue.backoff_cap_ms < self.queue.backoff_base_ms {
            problems.push("queue.backoff_cap_ms must not be below backoff_base_ms");
        }
        if self.telemetry.metrics_bucket_secs <= 0 {
            problems.push("telemetry.metrics_bucket_secs must be positive");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(WeftError::Config(problems.join("; ")))
        }
    }

    /// Resolve the database path (expand ~).
    pub fn storage_path(&self) -> PathBuf {
        expand_home(&self.storage.path)
    }

    /// JSONL verbosity, if event logging is enabled.
    pub fn log_level(&self) -> Option<u8> {
        self.log.as_ref().filter(|l| l.enabled).map(|l| l.level)
    }

    /// Resolve the JSONL log directory, if event logging is enabled.
    pub fn log_dir(&self) -> Option<PathBuf> {
        let log = self.log.as_ref().filter(|l| l.enabled)?;
        Some(match &log.log_dir {
            Some(dir) => expand_home(dir),
            None => expand_home("~/.weft/logs"),
        })
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
