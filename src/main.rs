mod http_action;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::alert::{AlertRule, IncidentStatus};
use weft_core::config::AppConfig;
use weft_core::event::EventBus;
use weft_core::telemetry::SearchQuery;
use weft_core::traits::{
    AlertStore, ExecutionStore, QueueClient, TelemetryStore, WorkflowStore,
};
use weft_core::types::{ExecutionId, ExecutionStatus, JobPayload, TriggerType};
use weft_core::workflow::WorkflowDefinition;

use weft_engine::{CronScheduler, Engine, HandlerRegistry, RunLogger, WorkflowGraph};
use weft_store::{SqliteQueue, SqliteStore};
use weft_telemetry::{
    AlertEvaluator, ChatNotifier, ExecutionIndexer, MetricsRecorder, MetricsRollup,
    QueueHealthMonitor, WebhookNotifier,
};

use crate::http_action::HttpActionHandler;

#[derive(Parser)]
#[command(name = "weft", version, about = "Durable DAG workflow execution engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml", env = "WEFT_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition file and print its execution order
    Validate {
        /// Path to a workflow JSON file
        file: PathBuf,
    },
    /// Manage registered workflows
    Workflows {
        #[command(subcommand)]
        action: WorkflowAction,
    },
    /// Enqueue an execution of a registered workflow
    Enqueue {
        workflow_id: String,
        /// User the execution runs as
        #[arg(long, default_value = "cli")]
        user: String,
        /// Trigger type (manual, webhook, scheduled, api, event)
        #[arg(long, default_value = "manual")]
        trigger: TriggerType,
        /// Trigger payload as JSON
        #[arg(long)]
        data: Option<String>,
        /// Job-level variable overrides (NAME=JSON)
        #[arg(long = "var")]
        vars: Vec<String>,
        /// Skip the daily budget check
        #[arg(long)]
        skip_budget_check: bool,
        /// Mark the execution as a test run
        #[arg(long)]
        test: bool,
    },
    /// Run the worker pool, schedules, and telemetry loops until Ctrl-C
    Worker,
    /// Queue administration
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Show an execution and its node logs
    Executions {
        /// Execution id
        id: String,
    },
    /// Search finished executions
    Search {
        /// Case-insensitive text to look for
        text: Option<String>,
        #[arg(long)]
        status: Option<ExecutionStatus>,
        #[arg(long)]
        workflow: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Manage alert rules and incidents
    Alerts {
        #[command(subcommand)]
        action: AlertAction,
    },
    /// Show the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// List registered workflows
    List,
    /// Validate and register a workflow JSON file
    Register { file: PathBuf },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Show job counts by state
    Stats,
    /// Show one job
    Get { id: String },
    /// Return a failed job to the queue
    Retry { id: String },
    /// Delete a job that is not running
    Remove {
        id: String,
        /// Do not ask for confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Stop handing out jobs
    Pause,
    /// Resume handing out jobs
    Resume,
}

#[derive(Subcommand)]
enum AlertAction {
    /// List alert rules
    List,
    /// Add or replace a rule from a JSON file
    Add { file: PathBuf },
    /// List incidents
    Incidents {
        #[arg(long)]
        status: Option<IncidentStatus>,
    },
    /// Acknowledge an active incident
    Ack { id: String },
    /// Resolve an incident
    Resolve { id: String },
    /// Silence an incident
    Silence { id: String },
    /// Run one evaluation pass now
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Commands that need no config
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "weft", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Validate { file } => return validate_file(file),
        _ => {}
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Workflows { action } => {
            let store = open_store(&config)?;
            match action {
                WorkflowAction::List => {
                    for def in store.list_workflows()? {
                        println!(
                            "{:<24} {:<32} nodes={} edges={}",
                            def.id,
                            def.name,
                            def.nodes.len(),
                            def.edges.len()
                        );
                    }
                }
                WorkflowAction::Register { file } => {
                    let graph = WorkflowGraph::build(read_workflow(&file)?)?;
                    store.save_workflow(graph.definition())?;
                    println!("Registered '{}' ({} nodes)", graph.definition().id, graph.len());
                }
            }
        }
        Commands::Enqueue {
            workflow_id,
            user,
            trigger,
            data,
            vars,
            skip_budget_check,
            test,
        } => {
            let trigger_data = match data {
                Some(raw) => serde_json::from_str(&raw).context("--data is not valid JSON")?,
                None => serde_json::Value::Null,
            };
            let mut job = JobPayload::new(workflow_id, user).with_trigger(trigger, trigger_data);
            for var in vars {
                let (name, value) = parse_var(&var)?;
                job = job.with_variable(name, value);
            }
            job.skip_budget_check = skip_budget_check;
            job.is_test = test;

            let engine = build_engine(&config)?;
            let id = engine.submit(job).await?;
            println!("{}", id);
        }
        Commands::Worker => run_worker(config).await?,
        Commands::Queue { action } => handle_queue(action, &config).await?,
        Commands::Executions { id } => {
            let store = open_store(&config)?;
            let id = ExecutionId::from_string(&id);
            let record = store
                .get_execution(&id)?
                .with_context(|| format!("execution '{}' not found", id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            for log in store.node_logs(&id)? {
                println!(
                    "  {:<20} attempt={} {:<10} {}ms{}{}",
                    log.node_id,
                    log.attempt,
                    log.status.as_str(),
                    log.duration_ms,
                    if log.pinned { " (pinned)" } else { "" },
                    log.error.map(|e| format!(" error: {}", e)).unwrap_or_default()
                );
            }
        }
        Commands::Search {
            text,
            status,
            workflow,
            limit,
        } => {
            let store = open_store(&config)?;
            let query = SearchQuery {
                text,
                status,
                workflow_id: workflow,
                since: None,
                limit,
            };
            for hit in store.search_executions(&query)? {
                println!(
                    "{}  {:<10} {:<24} {}{}",
                    hit.started_at.format("%Y-%m-%d %H:%M:%S"),
                    hit.status,
                    hit.workflow_name,
                    hit.execution_id,
                    hit.error_message
                        .map(|e| format!("  {}", truncate(&e, 80)))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Alerts { action } => handle_alerts(action, &config).await?,
        Commands::Completions { .. } | Commands::Validate { .. } => unreachable!(),
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    if let Some(home) = dirs_home().map(|h| h.join(".weft").join("config.toml")) {
        if home.exists() {
            info!(path = %home.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home)?);
        }
    }
    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn open_store(config: &AppConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let path = config.storage_path();
    Ok(Arc::new(
        SqliteStore::open(&path).with_context(|| format!("opening {}", path.display()))?,
    ))
}

fn open_queue(config: &AppConfig) -> anyhow::Result<Arc<SqliteQueue>> {
    Ok(Arc::new(SqliteQueue::open(
        &config.storage_path(),
        &config.queue.name,
    )?))
}

fn build_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::with_builtins();
    registry.register(HttpActionHandler::new());
    registry
}

fn build_engine(config: &AppConfig) -> anyhow::Result<Engine> {
    let events = Arc::new(EventBus::new(config.engine.event_capacity));
    Ok(Engine::new(
        config.clone(),
        open_queue(config)?,
        open_store(config)?,
        events,
        build_registry(),
    ))
}

fn read_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(WorkflowDefinition::parse_str(&raw)?)
}

fn validate_file(path: &Path) -> anyhow::Result<()> {
    let graph = WorkflowGraph::build(read_workflow(path)?)?;
    println!("'{}' is valid ({} nodes)", graph.definition().id, graph.len());
    println!("Execution order: {}", graph.order().join(" -> "));
    Ok(())
}

fn parse_var(raw: &str) -> anyhow::Result<(String, serde_json::Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("--var '{}' must be NAME=VALUE", raw))?;
    // Bare words are taken as strings.
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

async fn run_worker(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let queue = open_queue(&config)?;
    let event_bus = Arc::new(EventBus::new(config.engine.event_capacity));
    let cancel = CancellationToken::new();
    let telemetry = config.telemetry.clone();

    let engine = Arc::new(Engine::new(
        config.clone(),
        queue.clone(),
        store.clone(),
        event_bus.clone(),
        build_registry(),
    ));
    engine.add_observer(Arc::new(ExecutionIndexer::new(store.clone())));
    engine.add_observer(Arc::new(MetricsRecorder::new(
        store.clone(),
        telemetry.metrics_bucket_secs,
    )));

    let mut tasks = Vec::new();

    if let (Some(dir), Some(level)) = (config.log_dir(), config.log_level()) {
        info!(dir = %dir.display(), "Run logging enabled");
        let logger = RunLogger::new(dir, level);
        tasks.push(tokio::spawn(logger.run(event_bus.clone(), cancel.clone())));
    }

    let scheduler = CronScheduler::new(&config.schedules, engine.clone(), cancel.clone());
    if !scheduler.is_empty() {
        tasks.push(tokio::spawn(async move { scheduler.run().await }));
    }

    let rollup = MetricsRollup::new(store.clone(), telemetry.metrics_bucket_secs);
    tasks.push(tokio::spawn(rollup.run(
        Duration::from_secs(telemetry.rollup_interval_secs),
        cancel.clone(),
    )));

    let health = QueueHealthMonitor::new(queue.clone(), store.clone(), config.engine.concurrency);
    tasks.push(tokio::spawn(health.run(
        Duration::from_secs(telemetry.queue_health_interval_secs),
        cancel.clone(),
    )));

    let evaluator = Arc::new(
        AlertEvaluator::new(store.clone())
            .with_notifier(Arc::new(WebhookNotifier::new()))
            .with_notifier(Arc::new(ChatNotifier::new()))
            .with_incident_ttl(telemetry.incident_ttl_hours),
    );
    tasks.push(tokio::spawn(evaluator.run(
        Duration::from_secs(telemetry.alert_tick_secs),
        cancel.clone(),
    )));

    engine.start().await;
    info!("Worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    cancel.cancel();
    engine.stop().await;
    for task in tasks {
        task.await.ok();
    }
    Ok(())
}

async fn handle_queue(action: QueueAction, config: &AppConfig) -> anyhow::Result<()> {
    let queue = open_queue(config)?;
    match action {
        QueueAction::Stats => {
            let stats = queue.stats().await?;
            println!("Queue: {}{}", queue.name(), if stats.paused { " (paused)" } else { "" });
            println!("  waiting:   {}", stats.waiting);
            println!("  active:    {}", stats.active);
            println!("  delayed:   {}", stats.delayed);
            println!("  completed: {}", stats.completed);
            println!("  failed:    {}", stats.failed);
        }
        QueueAction::Get { id } => {
            let job = queue
                .get(&id)
                .await?
                .with_context(|| format!("job '{}' not found", id))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        QueueAction::Retry { id } => {
            queue.retry(&id).await?;
            open_store(config)?.reopen_execution(&ExecutionId::from_string(&id))?;
            println!("Job '{}' queued for retry", id);
        }
        QueueAction::Remove { id, yes } => {
            if !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(format!("Remove job '{}'?", id))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    return Ok(());
                }
            }
            if queue.remove(&id).await? {
                println!("Removed '{}'", id);
            } else {
                println!("Job '{}' not found", id);
            }
        }
        QueueAction::Pause => {
            queue.pause().await?;
            println!("Queue '{}' paused", queue.name());
        }
        QueueAction::Resume => {
            queue.resume().await?;
            println!("Queue '{}' resumed", queue.name());
        }
    }
    Ok(())
}

async fn handle_alerts(action: AlertAction, config: &AppConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match action {
        AlertAction::List => {
            for rule in store.list_alert_rules(false)? {
                println!(
                    "{:<20} {:<8} {:<18} {:<9} cooldown={}m{}",
                    rule.id,
                    if rule.enabled { "enabled" } else { "disabled" },
                    rule.condition.kind(),
                    rule.severity.as_str(),
                    rule.cooldown_minutes,
                    rule.last_triggered_at
                        .map(|t| format!(" last={}", t.format("%Y-%m-%d %H:%M")))
                        .unwrap_or_default()
                );
            }
        }
        AlertAction::Add { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let rule: AlertRule = serde_json::from_str(&raw).context("invalid alert rule")?;
            store.save_alert_rule(&rule)?;
            println!("Saved rule '{}' ({})", rule.id, rule.condition.kind());
        }
        AlertAction::Incidents { status } => {
            for incident in store.list_incidents(status)? {
                let failed = incident.action_results.iter().filter(|r| !r.success).count();
                println!(
                    "{}  {:<12} {:<9} {:<20} {}{}",
                    incident.triggered_at.format("%Y-%m-%d %H:%M:%S"),
                    incident.status.as_str(),
                    incident.severity.as_str(),
                    incident.rule_id,
                    incident.id,
                    if failed > 0 { format!("  ({} actions failed)", failed) } else { String::new() }
                );
            }
        }
        AlertAction::Ack { id } => set_status(&store, &id, IncidentStatus::Acknowledged)?,
        AlertAction::Resolve { id } => set_status(&store, &id, IncidentStatus::Resolved)?,
        AlertAction::Silence { id } => set_status(&store, &id, IncidentStatus::Silenced)?,
        AlertAction::Check => {
            let evaluator = AlertEvaluator::new(store.clone())
                .with_notifier(Arc::new(WebhookNotifier::new()))
                .with_notifier(Arc::new(ChatNotifier::new()))
                .with_incident_ttl(config.telemetry.incident_ttl_hours);
            let opened = evaluator.tick(chrono::Utc::now()).await?;
            println!("{} incident(s) opened", opened.len());
            for incident in opened {
                println!("  {} ({})", incident.id, incident.rule_id);
            }
        }
    }
    Ok(())
}

fn set_status(store: &SqliteStore, id: &str, status: IncidentStatus) -> anyhow::Result<()> {
    if store.set_incident_status(id, status, chrono::Utc::now())? {
        println!("Incident '{}' is now {}", id, status.as_str());
    } else {
        anyhow::bail!("incident '{}' not found or cannot move to {}", id, status.as_str());
    }
    Ok(())
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
