use rusqlite::Connection;

use weft_core::error::Result;

use crate::db_err;

const STORE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS executions (
        execution_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        trigger_data TEXT NOT NULL,
        status TEXT NOT NULL,
        output TEXT,
        error TEXT,
        error_code TEXT,
        nodes_executed INTEGER NOT NULL DEFAULT 0,
        total_cost REAL NOT NULL DEFAULT 0,
        is_test INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE TABLE IF NOT EXISTS node_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        execution_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        node_type TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        status TEXT NOT NULL,
        input TEXT,
        output TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        tokens_used INTEGER,
        cost_usd REAL,
        pinned INTEGER NOT NULL DEFAULT 0,
        UNIQUE (execution_id, node_id, attempt)
    );

    CREATE TABLE IF NOT EXISTS pinned_data (
        workflow_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        mode TEXT NOT NULL,
        output TEXT NOT NULL,
        usage_count INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (workflow_id, node_id, user_id)
    );

    CREATE TABLE IF NOT EXISTS execution_index (
        execution_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_name TEXT NOT NULL,
        workspace_id TEXT,
        user_id TEXT NOT NULL,
        tags TEXT NOT NULL,
        status TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        error_message TEXT,
        error_code TEXT,
        payload_text TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        duration_ms INTEGER,
        nodes_executed INTEGER NOT NULL,
        total_cost REAL NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_index_started ON execution_index(started_at DESC);

    CREATE TABLE IF NOT EXISTS metrics (
        metric_name TEXT NOT NULL,
        bucket_start TEXT NOT NULL,
        bucket_end TEXT NOT NULL,
        labels_key TEXT NOT NULL,
        labels TEXT NOT NULL,
        value REAL NOT NULL,
        p50 REAL,
        p90 REAL,
        p95 REAL,
        p99 REAL,
        PRIMARY KEY (metric_name, bucket_start, labels_key)
    );

    CREATE TABLE IF NOT EXISTS daily_costs (
        user_id TEXT NOT NULL,
        day TEXT NOT NULL,
        cost_usd REAL NOT NULL,
        PRIMARY KEY (user_id, day)
    );

    CREATE TABLE IF NOT EXISTS queue_health (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue_name TEXT NOT NULL,
        waiting_count INTEGER NOT NULL,
        active_count INTEGER NOT NULL,
        failed_count INTEGER NOT NULL,
        delayed_count INTEGER NOT NULL,
        worker_count INTEGER NOT NULL,
        captured_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_queue_health ON queue_health(queue_name, captured_at DESC);

    CREATE TABLE IF NOT EXISTS alert_rules (
        id TEXT PRIMARY KEY,
        rule TEXT NOT NULL,
        enabled INTEGER NOT NULL,
        cooldown_minutes INTEGER NOT NULL,
        last_triggered_ms INTEGER
    );

    CREATE TABLE IF NOT EXISTS alert_incidents (
        id TEXT PRIMARY KEY,
        rule_id TEXT NOT NULL,
        status TEXT NOT NULL,
        severity TEXT NOT NULL,
        context TEXT NOT NULL,
        action_results TEXT NOT NULL,
        triggered_at TEXT NOT NULL,
        resolved_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_incidents_status ON alert_incidents(status, triggered_at);
";

const QUEUE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        id TEXT NOT NULL UNIQUE,
        queue TEXT NOT NULL,
        payload TEXT NOT NULL,
        state TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        progress TEXT NOT NULL,
        run_at_ms INTEGER NOT NULL,
        claimed_at_ms INTEGER,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_error TEXT,
        result TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, state, run_at_ms, seq);

    CREATE TABLE IF NOT EXISTS queue_state (
        queue TEXT PRIMARY KEY,
        paused INTEGER NOT NULL DEFAULT 0
    );
";

/// Journal settings for file-backed databases.
pub(crate) fn configure_file(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;")
        .map_err(db_err)
}

pub(crate) fn init_store(conn: &Connection) -> Result<()> {
    conn.execute_batch(STORE_SCHEMA).map_err(db_err)
}

pub(crate) fn init_queue(conn: &Connection) -> Result<()> {
    conn.execute_batch(QUEUE_SCHEMA).map_err(db_err)
}
