use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::error::{Result, WeftError};
use weft_core::event::{EngineEvent, EventPayload};
use weft_core::traits::{ExecutionStore, QueueClient, TelemetryStore, WorkflowStore};
use weft_core::types::{
    ExecutionId, ExecutionRecord, ExecutionStatus, JobProgress, JobRecord, JobResult,
    JobResultStatus,
};
use weft_core::workflow::WorkflowDefinition;

use crate::backoff::backoff_delay;
use crate::context::ExecutionContext;
use crate::engine::EngineInner;
use crate::executor::{ExecutionOutcome, ProgressReporter};
use crate::graph::WorkflowGraph;

/// One worker: claim, run, settle, repeat until shutdown.
///
/// Shutdown is only observed between jobs, so a claimed job always settles.
pub(crate) async fn worker_loop(inner: Arc<EngineInner>, shutdown: CancellationToken, worker: usize) {
    let idle = Duration::from_millis(inner.config.engine.poll_interval_ms);
    debug!(worker, "Worker started");

    while !shutdown.is_cancelled() {
        match inner.process_next().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => error!(worker, error = %e, "Failed to claim job"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(idle) => {}
        }
    }

    debug!(worker, "Worker stopped");
}

/// Renew a held job's claim well inside the stall threshold until `held`
/// is cancelled, so the stalled sweep never hands it to a second worker.
async fn claim_heartbeat(
    queue: Arc<dyn QueueClient>,
    job_id: String,
    stalled_after: Duration,
    held: CancellationToken,
) {
    let period = (stalled_after / 3).max(Duration::from_millis(100));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = held.cancelled() => break,
            _ = interval.tick() => {
                match queue.extend_claim(&job_id).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => warn!(job_id = %job_id, error = %e, "Failed to renew job claim"),
                }
            }
        }
    }
}

/// What one attempt produced before it was settled.
#[derive(Default)]
struct Attempt {
    workflow: Option<Arc<WorkflowDefinition>>,
    context: Option<ExecutionContext>,
}

impl EngineInner {
    pub(crate) async fn process_next(&self) -> Result<bool> {
        let Some(job) = self.queue.dequeue().await? else {
            return Ok(false);
        };
        self.limiter.acquire().await;
        self.process_job(job).await;
        Ok(true)
    }

    async fn process_job(&self, job: JobRecord) {
        let execution_id = job
            .payload
            .execution_id
            .clone()
            .unwrap_or_else(|| ExecutionId::from_string(&job.id));
        let cancel = self.cancels.register(&execution_id);
        let progress = ProgressReporter::new(self.queue.clone(), &job.id);
        progress.report(JobProgress::Running).await;

        info!(
            execution_id = %execution_id,
            workflow_id = %job.payload.workflow_id,
            attempt = job.attempts,
            "Execution attempt started"
        );

        let held = CancellationToken::new();
        tokio::spawn(claim_heartbeat(
            self.queue.clone(),
            job.id.clone(),
            Duration::from_secs(self.config.queue.stalled_after_secs),
            held.clone(),
        ));

        let mut attempt = Attempt::default();
        let result = self
            .run_attempt(&job, &execution_id, &cancel, &progress, &mut attempt)
            .await;
        self.settle(&job, &execution_id, attempt, result, &progress).await;
        held.cancel();
        self.cancels.remove(&execution_id);
    }

    async fn run_attempt(
        &self,
        job: &JobRecord,
        execution_id: &ExecutionId,
        cancel: &AtomicBool,
        progress: &ProgressReporter,
        attempt: &mut Attempt,
    ) -> Result<ExecutionOutcome> {
        let payload = &job.payload;
        let def = self
            .persistence
            .load_workflow(&payload.workflow_id)?
            .ok_or_else(|| WeftError::NotFound(format!("workflow '{}'", payload.workflow_id)))?;
        let graph = WorkflowGraph::build(def)?;
        attempt.workflow = Some(graph.shared_definition());

        if !payload.skip_budget_check {
            if let Some(budget_usd) = self.config.engine.daily_budget_usd {
                let spent_usd = self
                    .persistence
                    .daily_cost(&payload.user_id, Utc::now().date_naive())?;
                if spent_usd >= budget_usd {
                    return Err(WeftError::BudgetExceeded {
                        user_id: payload.user_id.clone(),
                        spent_usd,
                        budget_usd,
                    });
                }
            }
        }

        let mut ctx = ExecutionContext::new(payload, execution_id.clone(), job.attempts);
        if let Some(existing) = self.persistence.get_execution(execution_id)? {
            ctx.started_at = existing.started_at;
        }
        self.persistence.upsert_execution(&ctx.to_record(None))?;
        let ctx = attempt.context.insert(ctx);
        self.emit(EngineEvent::ExecutionStart, execution_id, &payload.workflow_id, "running");

        let outcome = self.executor.run(&graph, ctx, cancel, Some(progress)).await;

        if outcome.total_cost > 0.0 {
            self.persistence
                .add_daily_cost(&ctx.user_id, Utc::now().date_naive(), outcome.total_cost)?;
        }
        Ok(outcome)
    }

    /// Retry, complete, or permanently fail the job for one attempt's result.
    async fn settle(
        &self,
        job: &JobRecord,
        execution_id: &ExecutionId,
        attempt: Attempt,
        result: Result<ExecutionOutcome>,
        progress: &ProgressReporter,
    ) {
        let (status, output, failure, duration_ms) = match result {
            Ok(outcome) => (outcome.status, outcome.output, outcome.error, outcome.duration_ms),
            Err(e) => (ExecutionStatus::Error, Value::Null, Some(e), 0),
        };

        if status == ExecutionStatus::Error {
            if let Some(e) = failure.as_ref().filter(|e| e.is_retryable()) {
                if job.attempts < job.max_attempts {
                    self.schedule_retry(job, execution_id, e).await;
                    return;
                }
            }
        }

        let Attempt { workflow, context } = attempt;
        let record = match context {
            Some(mut ctx) => {
                ctx.finish(status, failure.as_ref());
                ctx.to_record(Some(output.clone()))
            }
            None => self.synthesize_record(job, execution_id, failure.as_ref()),
        };
        if let Err(e) = self.persistence.upsert_execution(&record) {
            error!(execution_id = %execution_id, error = %e, "Failed to persist execution");
        }

        let message = failure.as_ref().map(|e| e.to_string());
        let queued = match status {
            ExecutionStatus::Error => {
                progress.report(JobProgress::Failed).await;
                self.queue
                    .fail(&job.id, message.as_deref().unwrap_or("execution failed"), None)
                    .await
            }
            _ => {
                let result = JobResult {
                    execution_id: execution_id.clone(),
                    status: if status == ExecutionStatus::Cancelled {
                        JobResultStatus::Cancelled
                    } else {
                        JobResultStatus::Success
                    },
                    output,
                    error: message.clone(),
                    duration_ms,
                    nodes_executed: record.nodes_executed,
                    total_cost: (record.total_cost > 0.0).then_some(record.total_cost),
                };
                progress.report(JobProgress::Completed).await;
                self.queue.complete(&job.id, &result).await
            }
        };
        if let Err(e) = queued {
            error!(job_id = %job.id, error = %e, "Failed to settle job");
        }

        match &failure {
            Some(e) if status == ExecutionStatus::Error => {
                error!(execution_id = %execution_id, error = %e, "Execution failed")
            }
            _ => info!(
                execution_id = %execution_id,
                status = %status,
                nodes = record.nodes_executed,
                "Execution finished"
            ),
        }
        self.emit(
            EngineEvent::ExecutionFinish,
            execution_id,
            &record.workflow_id,
            status.as_str(),
        );
        self.notify_observers(&record, workflow.as_deref());
    }

    async fn schedule_retry(&self, job: &JobRecord, execution_id: &ExecutionId, error: &WeftError) {
        let delay = backoff_delay(
            job.attempts,
            Duration::from_millis(self.config.queue.backoff_base_ms),
            Duration::from_millis(self.config.queue.backoff_cap_ms),
        );
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        warn!(
            execution_id = %execution_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Execution attempt failed, retrying"
        );
        if let Err(e) = self.queue.fail(&job.id, &error.to_string(), Some(retry_at)).await {
            error!(job_id = %job.id, error = %e, "Failed to schedule retry");
        }
    }

    /// Record for a job that failed before its context existed.
    fn synthesize_record(
        &self,
        job: &JobRecord,
        execution_id: &ExecutionId,
        failure: Option<&WeftError>,
    ) -> ExecutionRecord {
        let existing = self.persistence.get_execution(execution_id).ok().flatten();
        let mut ctx = ExecutionContext::new(&job.payload, execution_id.clone(), job.attempts);
        if let Some(existing) = existing {
            ctx.started_at = existing.started_at;
        }
        ctx.finish(ExecutionStatus::Error, failure);
        ctx.to_record(None)
    }

    fn notify_observers(&self, record: &ExecutionRecord, workflow: Option<&WorkflowDefinition>) {
        let observers = self.observers.read().unwrap().clone();
        if observers.is_empty() {
            return;
        }
        let logs = match self.persistence.node_logs(&record.execution_id) {
            Ok(logs) => logs,
            Err(e) => {
                warn!(execution_id = %record.execution_id, error = %e, "Failed to load node logs");
                Vec::new()
            }
        };
        for observer in observers {
            if let Err(e) = observer.on_finished(record, workflow, &logs) {
                warn!(execution_id = %record.execution_id, error = %e, "Execution observer failed");
            }
        }
    }

    fn emit(
        &self,
        event: fn(EventPayload) -> EngineEvent,
        execution_id: &ExecutionId,
        workflow_id: &str,
        status: &str,
    ) {
        self.events
            .emit(event(EventPayload::new(execution_id, workflow_id, None, status)));
    }
}
