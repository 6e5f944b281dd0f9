use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use weft_core::alert::{AlertAction, AlertIncident, AlertRule};
use weft_core::error::{Result, WeftError};
use weft_core::event::EngineEvent;
use weft_core::traits::{EventSink, Notifier};

/// Keeps every emitted event in memory.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// One notification the `RecordingNotifier` received.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub rule_id: String,
    pub incident_id: String,
    pub at: DateTime<Utc>,
}

/// Records deliveries for one action kind; optionally fails every call.
pub struct RecordingNotifier {
    kind: String,
    fail: bool,
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingNotifier {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            fail: false,
            deliveries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(kind: &str) -> Self {
        Self {
            fail: true,
            ..Self::new(kind)
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn notify(
        &self,
        _action: &AlertAction,
        rule: &AlertRule,
        incident: &AlertIncident,
    ) -> BoxFuture<'_, Result<()>> {
        let delivery = Delivery {
            rule_id: rule.id.clone(),
            incident_id: incident.id.clone(),
            at: Utc::now(),
        };
        Box::pin(async move {
            if self.fail {
                return Err(WeftError::Notify {
                    channel: self.kind.clone(),
                    message: "delivery refused".to_string(),
                });
            }
            self.deliveries.lock().unwrap().push(delivery);
            Ok(())
        })
    }
}
