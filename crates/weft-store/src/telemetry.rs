use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use weft_core::error::Result;
use weft_core::telemetry::{
    labels_key, ExecutionIndexEntry, MetricsSnapshot, QueueHealthSnapshot, SearchQuery,
};
use weft_core::traits::TelemetryStore;
use weft_core::types::ExecutionId;

use crate::store::SqliteStore;
use crate::{db_err, parse_enum, parse_json, parse_opt_ts, parse_ts, ts};

const INDEX_COLUMNS: &str = "execution_id, workflow_id, workflow_name, workspace_id, user_id, tags, \
     status, trigger_type, error_message, error_code, payload_text, started_at, completed_at, \
     duration_ms, nodes_executed, total_cost";

struct IndexRow {
    execution_id: String,
    workflow_id: String,
    workflow_name: String,
    workspace_id: Option<String>,
    user_id: String,
    tags: String,
    status: String,
    trigger_type: String,
    error_message: Option<String>,
    error_code: Option<String>,
    payload_text: String,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: Option<i64>,
    nodes_executed: i64,
    total_cost: f64,
}

impl IndexRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_name: row.get(2)?,
            workspace_id: row.get(3)?,
            user_id: row.get(4)?,
            tags: row.get(5)?,
            status: row.get(6)?,
            trigger_type: row.get(7)?,
            error_message: row.get(8)?,
            error_code: row.get(9)?,
            payload_text: row.get(10)?,
            started_at: row.get(11)?,
            completed_at: row.get(12)?,
            duration_ms: row.get(13)?,
            nodes_executed: row.get(14)?,
            total_cost: row.get(15)?,
        })
    }

    fn into_entry(self) -> Result<ExecutionIndexEntry> {
        Ok(ExecutionIndexEntry {
            execution_id: ExecutionId(self.execution_id),
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            workspace_id: self.workspace_id,
            user_id: self.user_id,
            tags: parse_json(&self.tags)?,
            status: parse_enum(&self.status)?,
            trigger_type: self.trigger_type,
            error_message: self.error_message,
            error_code: self.error_code,
            payload_text: self.payload_text,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            nodes_executed: self.nodes_executed.max(0) as usize,
            total_cost: self.total_cost,
        })
    }
}

fn collect_entries(
    rows: impl Iterator<Item = rusqlite::Result<IndexRow>>,
) -> Result<Vec<ExecutionIndexEntry>> {
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.map_err(db_err)?.into_entry()?);
    }
    Ok(entries)
}

struct MetricRow {
    metric_name: String,
    bucket_start: String,
    bucket_end: String,
    labels: String,
    value: f64,
    p50: Option<f64>,
    p90: Option<f64>,
    p95: Option<f64>,
    p99: Option<f64>,
}

impl MetricRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            metric_name: row.get(0)?,
            bucket_start: row.get(1)?,
            bucket_end: row.get(2)?,
            labels: row.get(3)?,
            value: row.get(4)?,
            p50: row.get(5)?,
            p90: row.get(6)?,
            p95: row.get(7)?,
            p99: row.get(8)?,
        })
    }

    fn into_snapshot(self) -> Result<MetricsSnapshot> {
        let labels: BTreeMap<String, String> = parse_json(&self.labels)?;
        Ok(MetricsSnapshot {
            metric_name: self.metric_name,
            bucket_start: parse_ts(&self.bucket_start)?,
            bucket_end: parse_ts(&self.bucket_end)?,
            value: self.value,
            p50: self.p50,
            p90: self.p90,
            p95: self.p95,
            p99: self.p99,
            labels,
        })
    }
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

impl TelemetryStore for SqliteStore {
    fn upsert_index_entry(&self, entry: &ExecutionIndexEntry) -> Result<()> {
        let tags = serde_json::to_string(&entry.tags)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO execution_index ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                INDEX_COLUMNS
            ),
            params![
                entry.execution_id.as_str(),
                entry.workflow_id,
                entry.workflow_name,
                entry.workspace_id,
                entry.user_id,
                tags,
                entry.status.as_str(),
                entry.trigger_type,
                entry.error_message,
                entry.error_code,
                entry.payload_text,
                ts(entry.started_at),
                entry.completed_at.map(ts),
                entry.duration_ms.map(|d| d as i64),
                entry.nodes_executed as i64,
                entry.total_cost,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn search_executions(&self, query: &SearchQuery) -> Result<Vec<ExecutionIndexEntry>> {
        let text = query
            .text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        let status = query.status.map(|s| s.as_str());
        let since = query.since.map(ts);
        let limit = query.limit.max(1) as i64;

        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM execution_index
                 WHERE (?1 IS NULL OR instr(lower(workflow_name), ?1) > 0
                                   OR instr(lower(coalesce(error_message, '')), ?1) > 0
                                   OR instr(lower(payload_text), ?1) > 0)
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR workflow_id = ?3)
                   AND (?4 IS NULL OR started_at >= ?4)
                 ORDER BY started_at DESC
                 LIMIT ?5",
                INDEX_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![text, status, query.workflow_id, since, limit],
                IndexRow::from_row,
            )
            .map_err(db_err)?;
        collect_entries(rows)
    }

    fn executions_since(&self, since: DateTime<Utc>) -> Result<Vec<ExecutionIndexEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM execution_index WHERE started_at >= ?1 ORDER BY started_at ASC",
                INDEX_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![ts(since)], IndexRow::from_row)
            .map_err(db_err)?;
        collect_entries(rows)
    }

    fn increment_metric(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let labels = serde_json::to_string(&snapshot.labels)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO metrics (metric_name, bucket_start, bucket_end, labels_key, labels, value)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(metric_name, bucket_start, labels_key)
             DO UPDATE SET value = value + excluded.value",
            params![
                snapshot.metric_name,
                ts(snapshot.bucket_start),
                ts(snapshot.bucket_end),
                labels_key(&snapshot.labels),
                labels,
                snapshot.value,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn upsert_metric_snapshot(&self, snapshot: &MetricsSnapshot) -> Result<()> {
        let labels = serde_json::to_string(&snapshot.labels)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO metrics
                (metric_name, bucket_start, bucket_end, labels_key, labels, value, p50, p90, p95, p99)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                snapshot.metric_name,
                ts(snapshot.bucket_start),
                ts(snapshot.bucket_end),
                labels_key(&snapshot.labels),
                labels,
                snapshot.value,
                snapshot.p50,
                snapshot.p90,
                snapshot.p95,
                snapshot.p99,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn metric_snapshots(&self, name: &str, since: DateTime<Utc>) -> Result<Vec<MetricsSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT metric_name, bucket_start, bucket_end, labels, value, p50, p90, p95, p99
                 FROM metrics WHERE metric_name = ?1 AND bucket_start >= ?2
                 ORDER BY bucket_start ASC, labels_key ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![name, ts(since)], MetricRow::from_row)
            .map_err(db_err)?;

        let mut snapshots = Vec::new();
        for row in rows {
            snapshots.push(row.map_err(db_err)?.into_snapshot()?);
        }
        Ok(snapshots)
    }

    fn add_daily_cost(&self, user_id: &str, day: NaiveDate, cost_usd: f64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO daily_costs (user_id, day, cost_usd) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, day) DO UPDATE SET cost_usd = cost_usd + excluded.cost_usd",
            params![user_id, day_key(day), cost_usd],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn daily_cost(&self, user_id: &str, day: NaiveDate) -> Result<f64> {
        let conn = self.lock()?;
        let cost: Option<f64> = conn
            .query_row(
                "SELECT cost_usd FROM daily_costs WHERE user_id = ?1 AND day = ?2",
                params![user_id, day_key(day)],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(cost.unwrap_or(0.0))
    }

    fn insert_queue_health(&self, snapshot: &QueueHealthSnapshot) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO queue_health
                (queue_name, waiting_count, active_count, failed_count, delayed_count, worker_count, captured_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.queue_name,
                snapshot.waiting_count as i64,
                snapshot.active_count as i64,
                snapshot.failed_count as i64,
                snapshot.delayed_count as i64,
                snapshot.worker_count as i64,
                ts(snapshot.captured_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn queue_health(&self, queue_name: &str, limit: usize) -> Result<Vec<QueueHealthSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT queue_name, waiting_count, active_count, failed_count, delayed_count,
                        worker_count, captured_at
                 FROM queue_health WHERE queue_name = ?1
                 ORDER BY captured_at DESC, id DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![queue_name, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(db_err)?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (queue_name, waiting, active, failed, delayed, workers, captured_at) =
                row.map_err(db_err)?;
            snapshots.push(QueueHealthSnapshot {
                queue_name,
                waiting_count: waiting.max(0) as u64,
                active_count: active.max(0) as u64,
                failed_count: failed.max(0) as u64,
                delayed_count: delayed.max(0) as u64,
                worker_count: workers.max(0) as usize,
                captured_at: parse_ts(&captured_at)?,
            });
        }
        Ok(snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use weft_core::telemetry::bucket_bounds;
    use weft_core::types::ExecutionStatus;

    fn entry(id: &str, name: &str, status: ExecutionStatus, minutes_ago: i64) -> ExecutionIndexEntry {
        let started_at = Utc::now() - Duration::minutes(minutes_ago);
        ExecutionIndexEntry {
            execution_id: ExecutionId::from_string(id),
            workflow_id: "wf".into(),
            workflow_name: name.into(),
            workspace_id: Some("ws".into()),
            user_id: "u1".into(),
            tags: vec!["billing".into()],
            status,
            trigger_type: "webhook".into(),
            error_message: None,
            error_code: None,
            payload_text: format!("customer.email: {}@example.com", id),
            started_at,
            completed_at: Some(started_at + Duration::seconds(2)),
            duration_ms: Some(2000),
            nodes_executed: 3,
            total_cost: 0.02,
        }
    }

    fn bucket_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 10, 7, 0).unwrap()
    }

    fn counter(name: &str, value: f64, workflow: &str) -> MetricsSnapshot {
        let (bucket_start, bucket_end) = bucket_bounds(bucket_time(), 300);
        let mut labels = BTreeMap::new();
        labels.insert("workflow".to_string(), workflow.to_string());
        MetricsSnapshot {
            metric_name: name.into(),
            bucket_start,
            bucket_end,
            value,
            p50: None,
            p90: None,
            p95: None,
            p99: None,
            labels,
        }
    }

    #[test]
    fn test_search_matches_text_case_insensitively() {
        let store = SqliteStore::in_memory().unwrap();
        let mut failed = entry("e2", "Invoice sync", ExecutionStatus::Error, 1);
        failed.error_message = Some("Upstream TIMEOUT from ledger".into());
        store.upsert_index_entry(&entry("e1", "Invoice sync", ExecutionStatus::Success, 2)).unwrap();
        store.upsert_index_entry(&failed).unwrap();
        store.upsert_index_entry(&entry("e3", "Welcome mail", ExecutionStatus::Success, 3)).unwrap();

        let hits = store.search_executions(&SearchQuery::text("invoice")).unwrap();
        let ids: Vec<&str> = hits.iter().map(|e| e.execution_id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e1"]);

        let hits = store.search_executions(&SearchQuery::text("timeout")).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tags, vec!["billing".to_string()]);

        let hits = store.search_executions(&SearchQuery::text("E3@EXAMPLE")).unwrap();
        assert_eq!(hits[0].execution_id.as_str(), "e3");
    }

    #[test]
    fn test_search_filters_and_limit() {
        let store = SqliteStore::in_memory().unwrap();
        for i in 0..5 {
            let status = if i % 2 == 0 {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Error
            };
            store
                .upsert_index_entry(&entry(&format!("e{}", i), "Sync", status, i * 10))
                .unwrap();
        }

        let query = SearchQuery {
            status: Some(ExecutionStatus::Error),
            limit: 50,
            ..Default::default()
        };
        assert_eq!(store.search_executions(&query).unwrap().len(), 2);

        let query = SearchQuery {
            since: Some(Utc::now() - Duration::minutes(25)),
            limit: 2,
            ..Default::default()
        };
        let ids: Vec<String> = store
            .search_executions(&query)
            .unwrap()
            .into_iter()
            .map(|e| e.execution_id.0)
            .collect();
        assert_eq!(ids, vec!["e0", "e1"]);
    }

    #[test]
    fn test_index_upsert_replaces_row() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_index_entry(&entry("e1", "Sync", ExecutionStatus::Error, 1)).unwrap();
        store.upsert_index_entry(&entry("e1", "Sync", ExecutionStatus::Success, 1)).unwrap();
        let rows = store.executions_since(Utc::now() - Duration::hours(1)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, ExecutionStatus::Success);
    }

    #[test]
    fn test_counters_accumulate_per_label_set() {
        let store = SqliteStore::in_memory().unwrap();
        store.increment_metric(&counter("executions_total", 1.0, "a")).unwrap();
        store.increment_metric(&counter("executions_total", 1.0, "a")).unwrap();
        store.increment_metric(&counter("executions_total", 1.0, "b")).unwrap();

        let rows = store
            .metric_snapshots("executions_total", bucket_time() - Duration::hours(1))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].labels["workflow"], "a");
        assert_eq!(rows[0].value, 2.0);
        assert_eq!(rows[1].value, 1.0);
    }

    #[test]
    fn test_snapshot_upsert_replaces_value() {
        let store = SqliteStore::in_memory().unwrap();
        let mut snap = counter("execution_duration_ms", 10.0, "a");
        snap.p95 = Some(40.0);
        store.upsert_metric_snapshot(&snap).unwrap();
        snap.value = 12.0;
        snap.p95 = Some(55.0);
        store.upsert_metric_snapshot(&snap).unwrap();

        let rows = store
            .metric_snapshots("execution_duration_ms", bucket_time() - Duration::hours(1))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 12.0);
        assert_eq!(rows[0].p95, Some(55.0));
        assert_eq!(rows[0].bucket_start, snap.bucket_start);
    }

    #[test]
    fn test_daily_cost_is_per_user_and_day() {
        let store = SqliteStore::in_memory().unwrap();
        let today = Utc::now().date_naive();
        let yesterday = today.pred_opt().unwrap();
        store.add_daily_cost("u1", today, 0.25).unwrap();
        store.add_daily_cost("u1", today, 0.5).unwrap();
        store.add_daily_cost("u1", yesterday, 3.0).unwrap();

        assert!((store.daily_cost("u1", today).unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(store.daily_cost("u2", today).unwrap(), 0.0);
    }

    #[test]
    fn test_queue_health_newest_first() {
        let store = SqliteStore::in_memory().unwrap();
        for waiting in 0..3u64 {
            store
                .insert_queue_health(&QueueHealthSnapshot {
                    queue_name: "workflows".into(),
                    waiting_count: waiting,
                    active_count: 1,
                    failed_count: 0,
                    delayed_count: 0,
                    worker_count: 2,
                    captured_at: Utc::now() + Duration::seconds(waiting as i64),
                })
                .unwrap();
        }
        let rows = store.queue_health("workflows", 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].waiting_count, 2);
        assert_eq!(rows[1].waiting_count, 1);
        assert!(store.queue_health("other", 10).unwrap().is_empty());
    }
}
