use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use weft_core::error::Result;
use weft_core::telemetry::ExecutionIndexEntry;
use weft_core::traits::{ExecutionObserver, TelemetryStore};
use weft_core::types::{ExecutionRecord, NodeLog};
use weft_core::workflow::WorkflowDefinition;

/// Upper bound on indexed payload text per execution.
const MAX_PAYLOAD_TEXT: usize = 16 * 1024;

/// Denormalizes finished executions into the search index.
pub struct ExecutionIndexer {
    store: Arc<dyn TelemetryStore>,
}

impl ExecutionIndexer {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Build and upsert the index row for one execution.
    pub fn index(
        &self,
        record: &ExecutionRecord,
        workflow: Option<&WorkflowDefinition>,
        logs: &[NodeLog],
    ) -> Result<ExecutionIndexEntry> {
        let entry = build_entry(record, workflow, logs);
        self.store.upsert_index_entry(&entry)?;
        debug!(execution_id = %record.execution_id, status = %record.status, "Execution indexed");
        Ok(entry)
    }
}

impl ExecutionObserver for ExecutionIndexer {
    fn on_finished(
        &self,
        record: &ExecutionRecord,
        workflow: Option<&WorkflowDefinition>,
        logs: &[NodeLog],
    ) -> Result<()> {
        self.index(record, workflow, logs).map(|_| ())
    }
}

pub fn build_entry(
    record: &ExecutionRecord,
    workflow: Option<&WorkflowDefinition>,
    logs: &[NodeLog],
) -> ExecutionIndexEntry {
    let mut lines = Vec::new();
    flatten("trigger", &record.trigger_data, &mut lines);
    for log in logs {
        if let Some(output) = &log.output {
            flatten(&log.node_id, output, &mut lines);
        }
        if let Some(error) = &log.error {
            lines.push(format!("{}.error: {}", log.node_id, error));
        }
    }

    ExecutionIndexEntry {
        execution_id: record.execution_id.clone(),
        workflow_id: record.workflow_id.clone(),
        workflow_name: workflow
            .map(|w| w.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| record.workflow_id.clone()),
        workspace_id: workflow.and_then(|w| w.workspace_id.clone()),
        user_id: record.user_id.clone(),
        tags: workflow.map(|w| w.tags.clone()).unwrap_or_default(),
        status: record.status,
        trigger_type: record.trigger_type.as_str().to_string(),
        error_message: record.error.clone(),
        error_code: record.error_code.clone(),
        payload_text: truncate(lines.join("\n"), MAX_PAYLOAD_TEXT),
        started_at: record.started_at,
        completed_at: record.completed_at,
        duration_ms: record.duration_ms(),
        nodes_executed: record.nodes_executed,
        total_cost: record.total_cost,
    }
}

/// Append `path: value` lines for every scalar leaf under `value`.
pub fn flatten(prefix: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&format!("{}.{}", prefix, key), child, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten(&format!("{}.{}", prefix, i), child, out);
            }
        }
        Value::String(s) => out.push(format!("{}: {}", prefix, s)),
        other => out.push(format!("{}: {}", prefix, other)),
    }
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
