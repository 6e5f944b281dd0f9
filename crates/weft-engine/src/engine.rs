use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use weft_core::config::AppConfig;
use weft_core::error::{Result, WeftError};
use weft_core::traits::{
    EventSink, ExecutionObserver, ExecutionStore, PersistenceClient, QueueClient, WorkflowStore,
};
use weft_core::types::{ExecutionId, JobPayload, QueueStats};
use weft_core::workflow::WorkflowDefinition;

use crate::cancel::CancelRegistry;
use crate::executor::NodeExecutor;
use crate::graph::WorkflowGraph;
use crate::handler::HandlerRegistry;
use crate::rate_limit::RateLimiter;
use crate::worker::worker_loop;

/// State shared by the engine handle and its worker tasks.
pub(crate) struct EngineInner {
    pub config: AppConfig,
    pub queue: Arc<dyn QueueClient>,
    pub persistence: Arc<dyn PersistenceClient>,
    pub events: Arc<dyn EventSink>,
    pub executor: NodeExecutor,
    pub limiter: RateLimiter,
    pub cancels: CancelRegistry,
    pub observers: RwLock<Vec<Arc<dyn ExecutionObserver>>>,
}

/// The workflow engine: a bounded worker pool over one durable queue.
///
/// Constructed with its collaborators; nothing is global. `start` spawns the
/// workers, `stop` lets each finish the job it holds and joins them.
pub struct Engine {
    inner: Arc<EngineInner>,
    shutdown: CancellationToken,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        queue: Arc<dyn QueueClient>,
        persistence: Arc<dyn PersistenceClient>,
        events: Arc<dyn EventSink>,
        registry: HandlerRegistry,
    ) -> Self {
        let executor = NodeExecutor::new(Arc::new(registry), persistence.clone(), events.clone())
            .with_env(config.engine.env.clone())
            .with_default_timeout(Duration::from_millis(config.engine.node_timeout_ms));
        let limiter = RateLimiter::new(
            config.queue.rate_limit_max,
            Duration::from_secs(config.queue.rate_limit_window_secs),
        );

        Self {
            inner: Arc::new(EngineInner {
                config,
                queue,
                persistence,
                events,
                executor,
                limiter,
                cancels: CancelRegistry::new(),
                observers: RwLock::new(Vec::new()),
            }),
            shutdown: CancellationToken::new(),
            workers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Receive every execution once it is final.
    pub fn add_observer(&self, observer: Arc<dyn ExecutionObserver>) {
        self.inner.observers.write().unwrap().push(observer);
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    /// Validate a definition and store it under its id.
    pub fn register_workflow(&self, def: WorkflowDefinition) -> Result<()> {
        let graph = WorkflowGraph::build(def)?;
        self.inner.persistence.save_workflow(graph.definition())?;
        info!(workflow_id = %graph.definition().id, nodes = graph.len(), "Workflow registered");
        Ok(())
    }

    /// Validate the job's workflow and enqueue it.
    ///
    /// Graph errors surface here and never reach a worker. The returned id
    /// is both the execution id and the job id.
    pub async fn submit(&self, mut job: JobPayload) -> Result<ExecutionId> {
        let def = self
            .inner
            .persistence
            .load_workflow(&job.workflow_id)?
            .ok_or_else(|| WeftError::NotFound(format!("workflow '{}'", job.workflow_id)))?;
        WorkflowGraph::build(def)?;

        let execution_id = job.ensure_execution_id();
        self.inner
            .queue
            .enqueue(job, self.inner.config.queue.max_attempts)
            .await?;
        debug!(execution_id = %execution_id, "Job enqueued");
        Ok(execution_id)
    }

    /// Spawn the worker pool and the stalled-job sweeper.
    pub async fn start(&self) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            warn!("Engine already started");
            return;
        }

        let concurrency = self.inner.config.engine.concurrency;
        for index in 0..concurrency {
            workers.push(tokio::spawn(worker_loop(
                self.inner.clone(),
                self.shutdown.clone(),
                index,
            )));
        }
        workers.push(tokio::spawn(stalled_sweeper(
            self.inner.clone(),
            self.shutdown.clone(),
        )));

        info!(
            queue = %self.inner.queue.name(),
            concurrency,
            "Engine started"
        );
    }

    /// Stop claiming jobs and wait for in-flight executions to settle.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Engine stopped");
    }

    /// Request cooperative cancellation.
    ///
    /// Returns false when the execution is unknown or already terminal. A
    /// job still waiting in the queue is cancelled once a worker claims it.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> Result<bool> {
        if let Some(record) = self.inner.persistence.get_execution(execution_id)? {
            if record.status.is_terminal() {
                return Ok(false);
            }
        } else if self.inner.queue.get(execution_id.as_str()).await?.is_none() {
            return Ok(false);
        }

        let running = self.inner.cancels.request(execution_id);
        info!(execution_id = %execution_id, running, "Cancellation requested");
        Ok(true)
    }

    /// Claim and run at most one job. Returns whether a job was processed.
    pub async fn process_next(&self) -> Result<bool> {
        self.inner.process_next().await
    }

    /// Executions currently held by a worker.
    pub fn active_executions(&self) -> usize {
        self.inner.cancels.running()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.inner.queue.stats().await
    }

    /// Give a permanently failed job a fresh attempt budget.
    ///
    /// The execution row is reopened too, otherwise the new run could never
    /// overwrite its terminal status.
    pub async fn retry_job(&self, job_id: &str) -> Result<()> {
        self.inner.queue.retry(job_id).await?;
        let execution_id = ExecutionId::from_string(job_id);
        if self.inner.persistence.reopen_execution(&execution_id)? {
            info!(execution_id = %execution_id, "Execution reopened for retry");
        }
        Ok(())
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let removed = self.inner.queue.remove(job_id).await?;
        if removed {
            self.inner.cancels.remove(&ExecutionId::from_string(job_id));
        }
        Ok(removed)
    }

    pub async fn pause(&self) -> Result<()> {
        self.inner.queue.pause().await
    }

    pub async fn resume(&self) -> Result<()> {
        self.inner.queue.resume().await
    }
}

/// Return abandoned active jobs to waiting on a fixed cadence.
async fn stalled_sweeper(inner: Arc<EngineInner>, shutdown: CancellationToken) {
    let older_than = Duration::from_secs(inner.config.queue.stalled_after_secs);
    let mut interval = tokio::time::interval(older_than.max(Duration::from_secs(1)) / 2);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                match inner.queue.requeue_stalled(older_than).await {
                    Ok(0) => {}
                    Ok(n) => warn!(count = n, "Requeued stalled jobs"),
                    Err(e) => warn!(error = %e, "Stalled job sweep failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::event::EventBus;
    use weft_core::traits::TelemetryStore;
    use weft_core::types::{ExecutionStatus, JobState, TriggerType};
    use weft_store::{SqliteQueue, SqliteStore};
    use std::sync::atomic::Ordering;
    use weft_test_utils::{
        fixtures, CountingHandler, EchoHandler, FailingHandler, FlakyHandler, SlowHandler,
    };

    struct Harness {
        engine: Engine,
        store: Arc<SqliteStore>,
        queue: Arc<SqliteQueue>,
    }

    fn harness(config: AppConfig, action: impl weft_core::traits::NodeHandler) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::in_memory(&config.queue.name).unwrap());
        let mut registry = HandlerRegistry::with_builtins();
        registry.register(action);
        let engine = Engine::new(
            config,
            queue.clone(),
            store.clone(),
            Arc::new(EventBus::new(64)),
            registry,
        );
        engine.register_workflow(fixtures::linear_workflow()).unwrap();
        Harness { engine, store, queue }
    }

    fn job() -> JobPayload {
        JobPayload::new("linear", "u1").with_trigger(TriggerType::Api, json!({"name": "Grace"}))
    }

    #[tokio::test]
    async fn test_submit_rejects_unknown_workflow() {
        let h = harness(AppConfig::default(), EchoHandler::action());
        let err = h.engine.submit(JobPayload::new("missing", "u1")).await.unwrap_err();
        assert!(matches!(err, WeftError::NotFound(_)));
        assert_eq!(h.engine.queue_stats().await.unwrap().waiting, 0);
    }

    #[tokio::test]
    async fn test_register_rejects_cyclic_workflow() {
        let h = harness(AppConfig::default(), EchoHandler::action());
        let err = h.engine.register_workflow(fixtures::cyclic_workflow()).unwrap_err();
        assert!(matches!(err, WeftError::GraphCycle { .. }));
        assert!(h.store.load_workflow("cyclic").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_process_next_runs_job_to_success() {
        let h = harness(AppConfig::default(), EchoHandler::action());
        let id = h.engine.submit(job()).await.unwrap();

        assert!(h.engine.process_next().await.unwrap());
        assert!(!h.engine.process_next().await.unwrap());

        let record = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.output, Some(json!({"result": "Grace"})));
        assert_eq!(record.nodes_executed, 4);

        let queued = h.queue.get(id.as_str()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Completed);
        assert_eq!(queued.result.unwrap().nodes_executed, 4);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_delayed_then_exhausted() {
        let mut config = AppConfig::default();
        config.queue.max_attempts = 2;
        config.queue.backoff_base_ms = 0;
        config.queue.backoff_cap_ms = 0;
        let h = harness(config, FailingHandler::action("upstream down"));
        let id = h.engine.submit(job()).await.unwrap();

        assert!(h.engine.process_next().await.unwrap());
        let first = h.queue.get(id.as_str()).await.unwrap().unwrap();
        assert_eq!(first.state, JobState::Delayed);
        let record = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);

        assert!(h.engine.process_next().await.unwrap());
        let second = h.queue.get(id.as_str()).await.unwrap().unwrap();
        assert_eq!(second.state, JobState::Failed);
        assert_eq!(second.attempts, 2);

        let record = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.error.unwrap().contains("upstream down"));
        assert_eq!(record.error_code.as_deref(), Some("node_execution"));
    }

    #[tokio::test]
    async fn test_budget_exceeded_fails_without_retry() {
        let mut config = AppConfig::default();
        config.engine.daily_budget_usd = Some(1.0);
        let h = harness(config, EchoHandler::action());
        h.store
            .add_daily_cost("u1", chrono::Utc::now().date_naive(), 1.5)
            .unwrap();

        let id = h.engine.submit(job()).await.unwrap();
        h.engine.process_next().await.unwrap();

        let queued = h.queue.get(id.as_str()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Failed);
        assert_eq!(queued.attempts, 1);
        let record = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert_eq!(record.error_code.as_deref(), Some("budget_exceeded"));

        let mut skip = job();
        skip.skip_budget_check = true;
        let id = h.engine.submit(skip).await.unwrap();
        h.engine.process_next().await.unwrap();
        let record = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let h = harness(AppConfig::default(), EchoHandler::action());
        let id = h.engine.submit(job()).await.unwrap();

        assert!(h.engine.cancel(&id).await.unwrap());
        h.engine.process_next().await.unwrap();

        let record = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(record.nodes_executed, 0);
        let queued = h.queue.get(id.as_str()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Completed);

        assert!(!h.engine.cancel(&id).await.unwrap(), "already terminal");
        assert!(!h.engine.cancel(&ExecutionId::from_string("nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_manual_retry_reopens_failed_execution() {
        let mut config = AppConfig::default();
        config.queue.max_attempts = 1;
        let h = harness(config, FlakyHandler::action(1));
        let id = h.engine.submit(job()).await.unwrap();

        h.engine.process_next().await.unwrap();
        let failed = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(failed.status, ExecutionStatus::Error);
        assert_eq!(h.queue.get(id.as_str()).await.unwrap().unwrap().state, JobState::Failed);

        h.engine.retry_job(id.as_str()).await.unwrap();
        assert_eq!(
            h.store.get_execution(&id).unwrap().unwrap().status,
            ExecutionStatus::Running
        );
        assert!(h.engine.process_next().await.unwrap());

        let queued = h.queue.get(id.as_str()).await.unwrap().unwrap();
        assert_eq!(queued.state, JobState::Completed);
        let record = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert!(record.error.is_none());
        assert_eq!(record.output, Some(json!({"result": "Grace"})));
        assert_eq!(record.started_at, failed.started_at);
    }

    #[tokio::test]
    async fn test_remove_forgets_pending_cancel() {
        let h = harness(AppConfig::default(), EchoHandler::action());
        let id = h.engine.submit(job()).await.unwrap();

        assert!(h.engine.cancel(&id).await.unwrap());
        assert!(h.engine.inner.cancels.is_requested(&id));
        assert!(h.engine.remove_job(id.as_str()).await.unwrap());
        assert!(!h.engine.inner.cancels.is_requested(&id));
    }

    #[tokio::test]
    async fn test_long_execution_keeps_its_claim() {
        let mut config = AppConfig::default();
        config.engine.concurrency = 2;
        config.engine.poll_interval_ms = 20;
        config.queue.stalled_after_secs = 2;
        let slow = CountingHandler::new(SlowHandler::action(Duration::from_millis(1800)));
        let calls = slow.calls();
        let h = harness(config, slow);
        let id = h.engine.submit(job()).await.unwrap();

        h.engine.start().await;
        let finished = tokio::time::timeout(Duration::from_secs(15), async {
            loop {
                if h.engine.queue_stats().await.unwrap().completed == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        h.engine.stop().await;
        assert!(finished.is_ok(), "job never completed");

        // Two action nodes, one attempt, one owner.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let queued = h.queue.get(id.as_str()).await.unwrap().unwrap();
        assert_eq!(queued.attempts, 1);
        let record = h.store.get_execution(&id).unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let mut config = AppConfig::default();
        config.engine.concurrency = 3;
        config.engine.poll_interval_ms = 10;
        let h = harness(config, EchoHandler::action());

        let mut ids = Vec::new();
        for _ in 0..6 {
            ids.push(h.engine.submit(job()).await.unwrap());
        }
        h.engine.start().await;

        for _ in 0..200 {
            let stats = h.engine.queue_stats().await.unwrap();
            if stats.completed == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        h.engine.stop().await;

        assert_eq!(h.engine.queue_stats().await.unwrap().completed, 6);
        assert_eq!(h.engine.active_executions(), 0);
        for id in ids {
            let record = h.store.get_execution(&id).unwrap().unwrap();
            assert_eq!(record.status, ExecutionStatus::Success);
        }
    }
}
