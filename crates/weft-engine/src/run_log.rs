use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use weft_core::event::{EngineEvent, EventBus};

/// JSONL lifecycle logger.
///
/// Subscribes to the EventBus and appends one JSON object per event to
/// `{log_dir}/{YYYYMMDD}.jsonl`, rolling to a new file when the UTC date
/// changes. Every line is flushed, so a crash loses nothing already written.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log line.
#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    event: &'a str,
    execution_id: &'a str,
    workflow_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<&'a str>,
    status: &'a str,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = execution events, 2 = node events too.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Path of the file that receives events stamped `at`.
    pub fn log_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", at.format("%Y%m%d")))
    }

    /// Run until cancellation or until the bus closes.
    pub async fn run(self, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        info!(dir = %self.log_dir.display(), "RunLogger started");

        let mut rx = event_bus.subscribe();
        let mut current: Option<(PathBuf, BufWriter<File>)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let Some(line) = self.format_event(&event) else {
                                continue;
                            };
                            let path = self.log_path(event.payload().timestamp);
                            if current.as_ref().map(|(p, _)| p != &path).unwrap_or(true) {
                                if let Some((_, mut old)) = current.take() {
                                    old.flush().await.ok();
                                }
                                match open_append(&path).await {
                                    Ok(writer) => current = Some((path, writer)),
                                    Err(e) => {
                                        error!(error = %e, path = %path.display(), "Failed to open log file");
                                        break;
                                    }
                                }
                            }
                            let Some((_, writer)) = current.as_mut() else {
                                continue;
                            };
                            if let Err(e) = writer.write_all(line.as_bytes()).await {
                                error!(error = %e, "Failed to write log entry");
                                break;
                            }
                            if let Err(e) = writer.flush().await {
                                error!(error = %e, "Failed to flush log");
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        if let Some((path, mut writer)) = current {
            writer.flush().await.ok();
            debug!(path = %path.display(), "RunLogger finished");
        }
    }

    /// Serialize an event as one line, or `None` if filtered by level.
    fn format_event(&self, event: &EngineEvent) -> Option<String> {
        let node_event = matches!(
            event,
            EngineEvent::NodeStart(_) | EngineEvent::NodeFinish(_) | EngineEvent::NodeError(_)
        );
        if node_event && self.level < 2 {
            return None;
        }

        let payload = event.payload();
        let entry = LogEntry {
            timestamp: payload.timestamp.to_rfc3339(),
            event: event.name(),
            execution_id: payload.execution_id.as_str(),
            workflow_id: &payload.workflow_id,
            node_id: payload.node_id.as_deref(),
            status: &payload.status,
        };
        serde_json::to_string(&entry).ok().map(|json| json + "\n")
    }
}

async fn open_append(path: &Path) -> std::io::Result<BufWriter<File>> {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use weft_core::event::EventPayload;
    use weft_core::types::ExecutionId;

    fn payload(node: Option<&str>) -> EventPayload {
        EventPayload::new(&ExecutionId::from_string("e1"), "wf", node, "running")
    }

    #[test]
    fn test_daily_file_name() {
        let logger = RunLogger::new(PathBuf::from("/logs"), 2);
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 23, 59, 0).unwrap();
        assert_eq!(logger.log_path(at), PathBuf::from("/logs/20260307.jsonl"));
    }

    #[test]
    fn test_level_filtering() {
        let summary = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(summary
            .format_event(&EngineEvent::ExecutionStart(payload(None)))
            .is_some());
        assert!(summary
            .format_event(&EngineEvent::NodeStart(payload(Some("n1"))))
            .is_none());

        let detailed = RunLogger::new(PathBuf::from("/tmp"), 2);
        let line = detailed
            .format_event(&EngineEvent::NodeStart(payload(Some("n1"))))
            .unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"event\":\"node:start\""));
        assert!(line.contains("\"node_id\":\"n1\""));
    }

    #[tokio::test]
    async fn test_writes_events_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(EventBus::new(16));
        let cancel = CancellationToken::new();
        let logger = RunLogger::new(dir.path().to_path_buf(), 2);

        let handle = tokio::spawn(logger.run(bus.clone(), cancel.clone()));
        // Give the logger a moment to subscribe.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let start = payload(None);
        let path = dir.path().join(format!("{}.jsonl", start.timestamp.format("%Y%m%d")));
        bus.publish(EngineEvent::ExecutionStart(start));
        bus.publish(EngineEvent::NodeFinish(payload(Some("n1"))));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("execution:start"));
        assert!(lines[1].contains("node:finish"));
    }
}
