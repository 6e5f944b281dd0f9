use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::{ExecutionStore, WorkflowStore};
use weft_core::types::{ExecutionId, ExecutionRecord, NodeLog, PinCheck, PinMode, PinnedData};
use weft_core::workflow::WorkflowDefinition;

use crate::{db_err, parse_enum, parse_json, parse_opt_json, parse_opt_ts, parse_ts, schema, ts};

/// SQLite-backed persistence for workflows, executions, telemetry and alerts.
pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                WeftError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        schema::configure_file(&conn)?;
        schema::init_store(&conn)?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        schema::init_store(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| WeftError::Database(e.to_string()))
    }
}

impl WorkflowStore for SqliteStore {
    fn save_workflow(&self, def: &WorkflowDefinition) -> Result<()> {
        let definition = serde_json::to_string(def)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO workflows (id, name, definition, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = excluded.updated_at",
            params![def.id, def.name, definition, ts(Utc::now())],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn load_workflow(&self, id: &str) -> Result<Option<WorkflowDefinition>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT definition FROM workflows WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        raw.as_deref().map(parse_json).transpose()
    }

    fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT definition FROM workflows ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;

        let mut defs = Vec::new();
        for row in rows {
            defs.push(parse_json(&row.map_err(db_err)?)?);
        }
        Ok(defs)
    }
}

const EXECUTION_COLUMNS: &str = "execution_id, workflow_id, user_id, trigger_type, trigger_data, status, \
     output, error, error_code, nodes_executed, total_cost, is_test, started_at, completed_at";

struct ExecutionRow {
    execution_id: String,
    workflow_id: String,
    user_id: String,
    trigger_type: String,
    trigger_data: String,
    status: String,
    output: Option<String>,
    error: Option<String>,
    error_code: Option<String>,
    nodes_executed: i64,
    total_cost: f64,
    is_test: bool,
    started_at: String,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            workflow_id: row.get(1)?,
            user_id: row.get(2)?,
            trigger_type: row.get(3)?,
            trigger_data: row.get(4)?,
            status: row.get(5)?,
            output: row.get(6)?,
            error: row.get(7)?,
            error_code: row.get(8)?,
            nodes_executed: row.get(9)?,
            total_cost: row.get(10)?,
            is_test: row.get(11)?,
            started_at: row.get(12)?,
            completed_at: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<ExecutionRecord> {
        Ok(ExecutionRecord {
            execution_id: ExecutionId(self.execution_id),
            workflow_id: self.workflow_id,
            user_id: self.user_id,
            trigger_type: parse_enum(&self.trigger_type)?,
            trigger_data: parse_json(&self.trigger_data)?,
            status: parse_enum(&self.status)?,
            output: parse_opt_json(self.output)?,
            error: self.error,
            error_code: self.error_code,
            nodes_executed: self.nodes_executed.max(0) as usize,
            total_cost: self.total_cost,
            is_test: self.is_test,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct NodeLogRow {
    execution_id: String,
    node_id: String,
    node_type: String,
    attempt: i64,
    status: String,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
    started_at: String,
    completed_at: Option<String>,
    duration_ms: i64,
    tokens_used: Option<i64>,
    cost_usd: Option<f64>,
    pinned: bool,
}

impl NodeLogRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            execution_id: row.get(0)?,
            node_id: row.get(1)?,
            node_type: row.get(2)?,
            attempt: row.get(3)?,
            status: row.get(4)?,
            input: row.get(5)?,
            output: row.get(6)?,
            error: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
            duration_ms: row.get(10)?,
            tokens_used: row.get(11)?,
            cost_usd: row.get(12)?,
            pinned: row.get(13)?,
        })
    }

    fn into_log(self) -> Result<NodeLog> {
        Ok(NodeLog {
            execution_id: ExecutionId(self.execution_id),
            node_id: self.node_id,
            node_type: self.node_type,
            attempt: self.attempt.max(0) as u32,
            status: parse_enum(&self.status)?,
            input: parse_opt_json(self.input)?,
            output: parse_opt_json(self.output)?,
            error: self.error,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
            duration_ms: self.duration_ms.max(0) as u64,
            tokens_used: self.tokens_used.map(|t| t.max(0) as u64),
            cost_usd: self.cost_usd,
            pinned: self.pinned,
        })
    }
}

fn json_text(value: Option<&Value>) -> Option<String> {
    value.map(Value::to_string)
}

fn read_pin(conn: &Connection, workflow_id: &str, node_id: &str, user_id: &str) -> Result<Option<PinnedData>> {
    let row = conn
        .query_row(
            "SELECT mode, output, usage_count, updated_at FROM pinned_data
             WHERE workflow_id = ?1 AND node_id = ?2 AND user_id = ?3",
            params![workflow_id, node_id, user_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()
        .map_err(db_err)?;

    let Some((mode, output, usage_count, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(PinnedData {
        workflow_id: workflow_id.to_string(),
        node_id: node_id.to_string(),
        user_id: user_id.to_string(),
        mode: parse_enum(&mode)?,
        output: parse_json(&output)?,
        usage_count: usage_count.max(0) as u64,
        updated_at: parse_ts(&updated_at)?,
    }))
}

fn bump_pin_usage(conn: &Connection, workflow_id: &str, node_id: &str, user_id: &str) -> Result<usize> {
    conn.execute(
        "UPDATE pinned_data SET usage_count = usage_count + 1
         WHERE workflow_id = ?1 AND node_id = ?2 AND user_id = ?3",
        params![workflow_id, node_id, user_id],
    )
    .map_err(db_err)
}

impl ExecutionStore for SqliteStore {
    fn upsert_execution(&self, rec: &ExecutionRecord) -> Result<()> {
        let conn = self.lock()?;
        // The WHERE clause keeps terminal rows frozen.
        conn.execute(
            &format!(
                "INSERT INTO executions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(execution_id) DO UPDATE SET
                    status = excluded.status,
                    output = excluded.output,
                    error = excluded.error,
                    error_code = excluded.error_code,
                    nodes_executed = excluded.nodes_executed,
                    total_cost = excluded.total_cost,
                    completed_at = excluded.completed_at
                 WHERE executions.status = 'running'",
                EXECUTION_COLUMNS
            ),
            params![
                rec.execution_id.as_str(),
                rec.workflow_id,
                rec.user_id,
                rec.trigger_type.as_str(),
                rec.trigger_data.to_string(),
                rec.status.as_str(),
                json_text(rec.output.as_ref()),
                rec.error,
                rec.error_code,
                rec.nodes_executed as i64,
                rec.total_cost,
                rec.is_test,
                ts(rec.started_at),
                rec.completed_at.map(ts),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn reopen_execution(&self, id: &ExecutionId) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE executions SET
                    status = 'running', output = NULL, error = NULL, error_code = NULL,
                    completed_at = NULL
                 WHERE execution_id = ?1 AND status != 'running'",
                params![id.as_str()],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    fn get_execution(&self, id: &ExecutionId) -> Result<Option<ExecutionRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE execution_id = ?1", EXECUTION_COLUMNS),
                params![id.as_str()],
                ExecutionRow::from_row,
            )
            .optional()
            .map_err(db_err)?;
        row.map(ExecutionRow::into_record).transpose()
    }

    fn insert_node_log(&self, log: &NodeLog) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO node_logs
                (execution_id, node_id, node_type, attempt, status, input, output, error,
                 started_at, completed_at, duration_ms, tokens_used, cost_usd, pinned)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                log.execution_id.as_str(),
                log.node_id,
                log.node_type,
                log.attempt,
                log.status.as_str(),
                json_text(log.input.as_ref()),
                json_text(log.output.as_ref()),
                log.error,
                ts(log.started_at),
                log.completed_at.map(ts),
                log.duration_ms as i64,
                log.tokens_used.map(|t| t as i64),
                log.cost_usd,
                log.pinned,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn finish_node_log(&self, log: &NodeLog) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE node_logs SET
                status = ?4, output = ?5, error = ?6, completed_at = ?7,
                duration_ms = ?8, tokens_used = ?9, cost_usd = ?10, pinned = ?11
             WHERE execution_id = ?1 AND node_id = ?2 AND attempt = ?3 AND status = 'started'",
            params![
                log.execution_id.as_str(),
                log.node_id,
                log.attempt,
                log.status.as_str(),
                json_text(log.output.as_ref()),
                log.error,
                log.completed_at.map(ts),
                log.duration_ms as i64,
                log.tokens_used.map(|t| t as i64),
                log.cost_usd,
                log.pinned,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn node_logs(&self, id: &ExecutionId) -> Result<Vec<NodeLog>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, node_id, node_type, attempt, status, input, output, error,
                        started_at, completed_at, duration_ms, tokens_used, cost_usd, pinned
                 FROM node_logs WHERE execution_id = ?1 ORDER BY id ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.as_str()], NodeLogRow::from_row)
            .map_err(db_err)?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row.map_err(db_err)?.into_log()?);
        }
        Ok(logs)
    }

    fn upsert_pin(&self, pin: &PinnedData) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pinned_data (workflow_id, node_id, user_id, mode, output, usage_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(workflow_id, node_id, user_id) DO UPDATE SET
                mode = excluded.mode,
                output = excluded.output,
                updated_at = excluded.updated_at",
            params![
                pin.workflow_id,
                pin.node_id,
                pin.user_id,
                pin.mode.as_str(),
                pin.output.to_string(),
                pin.usage_count as i64,
                ts(pin.updated_at),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn get_pin(&self, workflow_id: &str, node_id: &str, user_id: &str) -> Result<Option<PinnedData>> {
        let conn = self.lock()?;
        read_pin(&conn, workflow_id, node_id, user_id)
    }

    fn check_pin(
        &self,
        workflow_id: &str,
        node_id: &str,
        user_id: &str,
        is_test: bool,
    ) -> Result<PinCheck> {
        let conn = self.lock()?;
        let Some(pin) = read_pin(&conn, workflow_id, node_id, user_id)? else {
            return Ok(PinCheck::default());
        };

        let should_use_pinned = pin.mode.substitutes(is_test);
        if should_use_pinned {
            bump_pin_usage(&conn, workflow_id, node_id, user_id)?;
        }
        Ok(PinCheck {
            has_pinned_data: pin.mode != PinMode::Disabled,
            should_use_pinned,
            pinned_output: Some(pin.output),
            mode: Some(pin.mode),
        })
    }

    fn record_pin_usage(&self, workflow_id: &str, node_id: &str, user_id: &str) -> Result<()> {
        let conn = self.lock()?;
        bump_pin_usage(&conn, workflow_id, node_id, user_id)?;
        Ok(())
    }
}
