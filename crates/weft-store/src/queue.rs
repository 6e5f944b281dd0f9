use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use weft_core::error::{Result, WeftError};
use weft_core::traits::QueueClient;
use weft_core::types::{JobPayload, JobProgress, JobRecord, JobResult, JobState, QueueStats};

use crate::{db_err, parse_enum, parse_json, parse_ts, schema, ts};

const JOB_COLUMNS: &str = "id, queue, payload, state, attempts, max_attempts, progress, run_at_ms, \
     created_at, updated_at, last_error, result";

/// Durable job queue in SQLite.
///
/// One instance serves one named queue; several queues may share a file.
/// Claims are a single `UPDATE .. RETURNING`, so a job is handed to at most
/// one worker even when several processes poll the same database.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
    name: String,
}

struct JobRow {
    id: String,
    queue: String,
    payload: String,
    state: String,
    attempts: i64,
    max_attempts: i64,
    progress: String,
    run_at_ms: i64,
    created_at: String,
    updated_at: String,
    last_error: Option<String>,
    result: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            queue: row.get(1)?,
            payload: row.get(2)?,
            state: row.get(3)?,
            attempts: row.get(4)?,
            max_attempts: row.get(5)?,
            progress: row.get(6)?,
            run_at_ms: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            last_error: row.get(10)?,
            result: row.get(11)?,
        })
    }

    fn into_record(self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id,
            queue: self.queue,
            payload: parse_json(&self.payload)?,
            state: parse_enum(&self.state)?,
            attempts: self.attempts.max(0) as u32,
            max_attempts: self.max_attempts.max(0) as u32,
            progress: parse_json(&self.progress)?,
            run_at: from_millis(self.run_at_ms)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_error: self.last_error,
            result: self.result.as_deref().map(parse_json).transpose()?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| WeftError::Database(format!("bad timestamp millis {}", ms)))
}

fn not_active(job_id: &str) -> WeftError {
    WeftError::Queue(format!("job '{}' is not active", job_id))
}

impl SqliteQueue {
    /// Open or create a queue database at the given path.
    pub fn open(path: &Path, name: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeftError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        schema::configure_file(&conn)?;
        schema::init_queue(&conn)?;

        debug!(path = %path.display(), queue = %name, "SQLite queue opened");
        Ok(Self {
            conn: Mutex::new(conn),
            name: name.to_string(),
        })
    }

    /// Open an in-memory queue (for testing).
    pub fn in_memory(name: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        schema::init_queue(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            name: name.to_string(),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }

    fn load(&self, conn: &Connection, job_id: &str) -> Result<Option<JobRecord>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1 AND queue = ?2", JOB_COLUMNS),
                params![job_id, self.name],
                JobRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(JobRow::into_record).transpose()
    }

    fn is_paused(&self, conn: &Connection) -> Result<bool> {
        let paused: Option<bool> = conn
            .query_row(
                "SELECT paused FROM queue_state WHERE queue = ?1",
                params![self.name],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(paused.unwrap_or(false))
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO queue_state (queue, paused) VALUES (?1, ?2)
             ON CONFLICT(queue) DO UPDATE SET paused = excluded.paused",
            params![self.name, paused],
        )
        .map_err(db_err)?;
        info!(queue = %self.name, paused, "Queue state changed");
        Ok(())
    }

    fn enqueue_sync(&self, mut job: JobPayload, max_attempts: u32) -> Result<JobRecord> {
        let id = job.ensure_execution_id();
        let now = Utc::now();
        let payload = serde_json::to_string(&job)?;
        let progress = serde_json::to_string(&JobProgress::Queued)?;

        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO jobs
                    (id, queue, payload, state, attempts, max_attempts, progress, run_at_ms,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'waiting', 0, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.as_str(),
                    self.name,
                    payload,
                    max_attempts.max(1),
                    progress,
                    now.timestamp_millis(),
                    ts(now),
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(WeftError::Queue(format!("job '{}' already exists", id)));
        }

        debug!(queue = %self.name, job_id = %id, "Job enqueued");
        self.load(&conn, id.as_str())?
            .ok_or_else(|| WeftError::Queue(format!("job '{}' vanished after insert", id)))
    }

    fn dequeue_sync(&self) -> Result<Option<JobRecord>> {
        let conn = self.lock()?;
        if self.is_paused(&conn)? {
            return Ok(None);
        }

        let now = Utc::now();
        let progress = serde_json::to_string(&JobProgress::Running)?;
        let claimed: Option<String> = conn
            .query_row(
                "UPDATE jobs SET
                    state = 'active',
                    attempts = attempts + 1,
                    claimed_at_ms = ?2,
                    progress = ?3,
                    updated_at = ?4
                 WHERE seq = (
                    SELECT seq FROM jobs
                    WHERE queue = ?1 AND state IN ('waiting', 'delayed') AND run_at_ms <= ?2
                    ORDER BY run_at_ms ASC, seq ASC
                    LIMIT 1
                 )
                 RETURNING id",
                params![self.name, now.timestamp_millis(), progress, ts(now)],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        match claimed {
            Some(id) => self.load(&conn, &id),
            None => Ok(None),
        }
    }

    fn complete_sync(&self, job_id: &str, result: &JobResult) -> Result<()> {
        let body = serde_json::to_string(result)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET state = 'completed', result = ?3, claimed_at_ms = NULL, updated_at = ?4
                 WHERE id = ?1 AND queue = ?2 AND state = 'active'",
                params![job_id, self.name, body, ts(Utc::now())],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(not_active(job_id));
        }
        Ok(())
    }

    fn fail_sync(&self, job_id: &str, error: &str, retry_at: Option<DateTime<Utc>>) -> Result<()> {
        let now = Utc::now();
        let (state, run_at_ms) = match retry_at {
            Some(at) => (JobState::Delayed, Some(at.timestamp_millis())),
            None => (JobState::Failed, None),
        };

        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET
                    state = ?3,
                    last_error = ?4,
                    run_at_ms = COALESCE(?5, run_at_ms),
                    claimed_at_ms = NULL,
                    updated_at = ?6
                 WHERE id = ?1 AND queue = ?2 AND state = 'active'",
                params![job_id, self.name, state.as_str(), error, run_at_ms, ts(now)],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(not_active(job_id));
        }
        Ok(())
    }

    fn stats_sync(&self) -> Result<QueueStats> {
        let conn = self.lock()?;
        let mut stats = QueueStats {
            paused: self.is_paused(&conn)?,
            ..Default::default()
        };

        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY state")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![self.name], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(db_err)?;

        for row in rows {
            let (state, count) = row.map_err(db_err)?;
            let count = count.max(0) as u64;
            match parse_enum::<JobState>(&state)? {
                JobState::Waiting => stats.waiting = count,
                JobState::Delayed => stats.delayed = count,
                JobState::Active => stats.active = count,
                JobState::Completed => stats.completed = count,
                JobState::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

impl QueueClient for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, job: JobPayload, max_attempts: u32) -> BoxFuture<'_, Result<JobRecord>> {
        Box::pin(async move { self.enqueue_sync(job, max_attempts) })
    }

    fn dequeue(&self) -> BoxFuture<'_, Result<Option<JobRecord>>> {
        Box::pin(async move { self.dequeue_sync() })
    }

    fn complete(&self, job_id: &str, result: &JobResult) -> BoxFuture<'_, Result<()>> {
        let job_id = job_id.to_string();
        let result = result.clone();
        Box::pin(async move { self.complete_sync(&job_id, &result) })
    }

    fn fail(
        &self,
        job_id: &str,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> BoxFuture<'_, Result<()>> {
        let job_id = job_id.to_string();
        let error = error.to_string();
        Box::pin(async move { self.fail_sync(&job_id, &error, retry_at) })
    }

    fn update_progress(&self, job_id: &str, progress: &JobProgress) -> BoxFuture<'_, Result<()>> {
        let job_id = job_id.to_string();
        let progress = serde_json::to_string(progress);
        Box::pin(async move {
            let progress = progress?;
            let conn = self.lock()?;
            let now = Utc::now();
            conn.execute(
                "UPDATE jobs SET
                    progress = ?3,
                    claimed_at_ms = CASE WHEN state = 'active' THEN ?4 ELSE claimed_at_ms END,
                    updated_at = ?5
                 WHERE id = ?1 AND queue = ?2",
                params![job_id, self.name, progress, now.timestamp_millis(), ts(now)],
            )
            .map_err(db_err)?;
            Ok(())
        })
    }

    fn extend_claim(&self, job_id: &str) -> BoxFuture<'_, Result<bool>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let now = Utc::now();
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE jobs SET claimed_at_ms = ?3, updated_at = ?4
                     WHERE id = ?1 AND queue = ?2 AND state = 'active'",
                    params![job_id, self.name, now.timestamp_millis(), ts(now)],
                )
                .map_err(db_err)?;
            Ok(changed == 1)
        })
    }

    fn get(&self, job_id: &str) -> BoxFuture<'_, Result<Option<JobRecord>>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            self.load(&conn, &job_id)
        })
    }

    fn stats(&self) -> BoxFuture<'_, Result<QueueStats>> {
        Box::pin(async move { self.stats_sync() })
    }

    fn retry(&self, job_id: &str) -> BoxFuture<'_, Result<()>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let now = Utc::now();
            let progress = serde_json::to_string(&JobProgress::Queued)?;
            let conn = self.lock()?;
            let changed = conn
                .execute(
                    "UPDATE jobs SET
                        state = 'waiting', attempts = 0, run_at_ms = ?3, progress = ?4,
                        last_error = NULL, result = NULL, updated_at = ?5
                     WHERE id = ?1 AND queue = ?2 AND state = 'failed'",
                    params![job_id, self.name, now.timestamp_millis(), progress, ts(now)],
                )
                .map_err(db_err)?;
            if changed == 0 {
                return Err(WeftError::Queue(format!("job '{}' is not failed", job_id)));
            }
            info!(queue = %self.name, job_id = %job_id, "Job retried");
            Ok(())
        })
    }

    fn remove(&self, job_id: &str) -> BoxFuture<'_, Result<bool>> {
        let job_id = job_id.to_string();
        Box::pin(async move {
            let conn = self.lock()?;
            let removed = conn
                .execute(
                    "DELETE FROM jobs WHERE id = ?1 AND queue = ?2 AND state != 'active'",
                    params![job_id, self.name],
                )
                .map_err(db_err)?;
            Ok(removed == 1)
        })
    }

    fn pause(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.set_paused(true) })
    }

    fn resume(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.set_paused(false) })
    }

    fn requeue_stalled(&self, older_than: Duration) -> BoxFuture<'_, Result<usize>> {
        Box::pin(async move {
            let now = Utc::now();
            let cutoff = now.timestamp_millis() - older_than.as_millis() as i64;
            let conn = self.lock()?;
            conn.execute(
                "UPDATE jobs SET state = 'waiting', claimed_at_ms = NULL, run_at_ms = ?3, updated_at = ?4
                 WHERE queue = ?1 AND state = 'active' AND claimed_at_ms <= ?2",
                params![self.name, cutoff, now.timestamp_millis(), ts(now)],
            )
            .map_err(db_err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use weft_core::types::{ExecutionId, JobResultStatus};

    fn result(id: &str) -> JobResult {
        JobResult {
            execution_id: ExecutionId::from_string(id),
            status: JobResultStatus::Success,
            output: json!({"ok": true}),
            error: None,
            duration_ms: 12,
            nodes_executed: 3,
            total_cost: None,
        }
    }

    #[tokio::test]
    async fn test_enqueue_uses_execution_id() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let mut job = JobPayload::new("wf", "u1");
        let id = job.ensure_execution_id();

        let record = queue.enqueue(job.clone(), 3).await.unwrap();
        assert_eq!(record.id, id.as_str());
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.progress, JobProgress::Queued);
        assert_eq!(record.payload, job);

        let err = queue.enqueue(job, 3).await.unwrap_err();
        assert!(matches!(err, WeftError::Queue(_)));
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_exclusive() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let first = queue.enqueue(JobPayload::new("a", "u1"), 3).await.unwrap();
        let second = queue.enqueue(JobPayload::new("b", "u1"), 3).await.unwrap();

        let claimed = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts, 1);

        assert_eq!(queue.dequeue().await.unwrap().unwrap().id, second.id);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        let a = SqliteQueue::open(&path, "a").unwrap();
        let b = SqliteQueue::open(&path, "b").unwrap();
        a.enqueue(JobPayload::new("wf", "u1"), 1).await.unwrap();

        assert!(b.dequeue().await.unwrap().is_none());
        assert_eq!(b.stats().await.unwrap().waiting, 0);
        assert!(a.dequeue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_complete_stores_result() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let job = queue.enqueue(JobPayload::new("wf", "u1"), 3).await.unwrap();

        // Completing a job nobody claimed is rejected.
        assert!(queue.complete(&job.id, &result(&job.id)).await.is_err());

        queue.dequeue().await.unwrap().unwrap();
        queue.complete(&job.id, &result(&job.id)).await.unwrap();

        let done = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.result.unwrap().output, json!({"ok": true}));
        assert_eq!(queue.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_delayed_job_waits_for_run_at() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let job = queue.enqueue(JobPayload::new("wf", "u1"), 3).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();

        let later = Utc::now() + chrono::Duration::minutes(5);
        queue.fail(&job.id, "boom", Some(later)).await.unwrap();
        let delayed = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(delayed.state, JobState::Delayed);
        assert_eq!(delayed.last_error.as_deref(), Some("boom"));
        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.stats().await.unwrap().delayed, 1);

        queue.fail(&job.id, "again", None).await.unwrap_err();
    }

    #[tokio::test]
    async fn test_retry_resets_failed_job() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let job = queue.enqueue(JobPayload::new("wf", "u1"), 1).await.unwrap();
        assert!(queue.retry(&job.id).await.is_err());

        queue.dequeue().await.unwrap().unwrap();
        queue.fail(&job.id, "fatal", None).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().failed, 1);

        queue.retry(&job.id).await.unwrap();
        let reset = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(reset.state, JobState::Waiting);
        assert_eq!(reset.attempts, 0);
        assert!(reset.last_error.is_none());

        let again = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(again.attempts, 1);
    }

    #[tokio::test]
    async fn test_pause_blocks_claims() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        queue.enqueue(JobPayload::new("wf", "u1"), 1).await.unwrap();

        queue.pause().await.unwrap();
        assert!(queue.stats().await.unwrap().paused);
        assert!(queue.dequeue().await.unwrap().is_none());

        queue.resume().await.unwrap();
        assert!(queue.dequeue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_skips_active_jobs() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let job = queue.enqueue(JobPayload::new("wf", "u1"), 1).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();
        assert!(!queue.remove(&job.id).await.unwrap());

        queue.fail(&job.id, "fatal", None).await.unwrap();
        assert!(queue.remove(&job.id).await.unwrap());
        assert!(queue.get(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_requeue_stalled_returns_old_claims() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let job = queue.enqueue(JobPayload::new("wf", "u1"), 3).await.unwrap();
        queue.dequeue().await.unwrap().unwrap();

        assert_eq!(queue.requeue_stalled(Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(queue.requeue_stalled(Duration::ZERO).await.unwrap(), 1);

        let requeued = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(requeued.id, job.id);
        assert_eq!(requeued.attempts, 2);
    }

    #[tokio::test]
    async fn test_renewed_claim_is_not_stalled() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let job = queue.enqueue(JobPayload::new("wf", "u1"), 3).await.unwrap();
        assert!(!queue.extend_claim(&job.id).await.unwrap(), "not claimed yet");
        queue.dequeue().await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.extend_claim(&job.id).await.unwrap());
        assert_eq!(queue.requeue_stalled(Duration::from_millis(50)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        queue.update_progress(&job.id, &JobProgress::Running).await.unwrap();
        assert_eq!(queue.requeue_stalled(Duration::from_millis(50)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(queue.requeue_stalled(Duration::from_millis(50)).await.unwrap(), 1);
        assert!(!queue.extend_claim(&job.id).await.unwrap());
        assert_eq!(queue.get(&job.id).await.unwrap().unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_progress_round_trips() {
        let queue = SqliteQueue::in_memory("workflows").unwrap();
        let job = queue.enqueue(JobPayload::new("wf", "u1"), 1).await.unwrap();
        let progress = JobProgress::Node {
            index: 2,
            total: 4,
            node_id: "action_b".into(),
        };
        queue.update_progress(&job.id, &progress).await.unwrap();

        let stored = queue.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.progress, progress);
        let raw: Value = serde_json::to_value(&stored.progress).unwrap();
        assert_eq!(raw["stage"], "node");
    }
}
