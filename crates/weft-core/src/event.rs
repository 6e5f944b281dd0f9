use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::traits::EventSink;
use crate::types::ExecutionId;

/// Lifecycle notification pushed to external subscribers.
///
/// The engine never waits on or relies upon delivery of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "execution:start")]
    ExecutionStart(EventPayload),
    #[serde(rename = "node:start")]
    NodeStart(EventPayload),
    #[serde(rename = "node:finish")]
    NodeFinish(EventPayload),
    #[serde(rename = "node:error")]
    NodeError(EventPayload),
    #[serde(rename = "execution:finish")]
    ExecutionFinish(EventPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload {
    pub fn new(
        execution_id: &ExecutionId,
        workflow_id: &str,
        node_id: Option<&str>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.to_string(),
            node_id: node_id.map(str::to_string),
            status: status.into(),
            timestamp: Utc::now(),
        }
    }
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ExecutionStart(_) => "execution:start",
            Self::NodeStart(_) => "node:start",
            Self::NodeFinish(_) => "node:finish",
            Self::NodeError(_) => "node:error",
            Self::ExecutionFinish(_) => "execution:finish",
        }
    }

    pub fn payload(&self) -> &EventPayload {
        match self {
            Self::ExecutionStart(p)
            | Self::NodeStart(p)
            | Self::NodeFinish(p)
            | Self::NodeError(p)
            | Self::ExecutionFinish(p) => p,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: EngineEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_name() {
        let event = EngineEvent::NodeStart(EventPayload::new(
            &ExecutionId::from_string("e1"),
            "wf",
            Some("n1"),
            "running",
        ));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "node:start");
        assert_eq!(json["executionId"], "e1");
        assert_eq!(json["nodeId"], "n1");
        assert_eq!(event.name(), "node:start");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.emit(EngineEvent::ExecutionStart(EventPayload::new(
            &ExecutionId::new(),
            "wf",
            None,
            "running",
        )));

        let mut rx = bus.subscribe();
        bus.emit(EngineEvent::ExecutionFinish(EventPayload::new(
            &ExecutionId::from_string("e2"),
            "wf",
            None,
            "success",
        )));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.payload().execution_id.as_str(), "e2");
    }
}
