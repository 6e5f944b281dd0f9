use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;

use weft_core::alert::{AlertAction, AlertIncident, AlertRule};
use weft_core::error::{Result, WeftError};
use weft_core::traits::Notifier;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_default()
}

/// One-line human summary of an incident.
pub fn summary(rule: &AlertRule, incident: &AlertIncident) -> String {
    let name = if rule.name.is_empty() { &rule.id } else { &rule.name };
    format!(
        "[{}] {} ({}): {}",
        incident.severity.as_str(),
        name,
        rule.condition.kind(),
        incident.context
    )
}

async fn post_json(channel: &str, client: &reqwest::Client, url: &str, body: &impl Serialize) -> Result<()> {
    let notify_err = |message: String| WeftError::Notify {
        channel: channel.to_string(),
        message,
    };

    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| notify_err(format!("request failed: {}", e)))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(notify_err(format!("HTTP {}: {}", status, text)));
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WebhookBody<'a> {
    rule_id: &'a str,
    rule_name: &'a str,
    condition_type: &'a str,
    summary: String,
    incident: &'a AlertIncident,
}

/// POSTs the incident as JSON to the action's URL.
pub struct WebhookNotifier {
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        Self { http: client() }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for WebhookNotifier {
    fn kind(&self) -> &str {
        "webhook"
    }

    fn notify(
        &self,
        action: &AlertAction,
        rule: &AlertRule,
        incident: &AlertIncident,
    ) -> BoxFuture<'_, Result<()>> {
        let AlertAction::Webhook { url } = action else {
            let err = mismatch("webhook", action.kind());
            return Box::pin(async move { Err(err) });
        };
        let url = url.clone();
        let body = serde_json::to_value(WebhookBody {
            rule_id: &rule.id,
            rule_name: &rule.name,
            condition_type: rule.condition.kind(),
            summary: summary(rule, incident),
            incident,
        });
        Box::pin(async move { post_json("webhook", &self.http, &url, &body?).await })
    }
}

/// Posts a text message to a chat incoming-webhook (Slack-compatible body).
pub struct ChatNotifier {
    http: reqwest::Client,
}

impl ChatNotifier {
    pub fn new() -> Self {
        Self { http: client() }
    }
}

impl Default for ChatNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for ChatNotifier {
    fn kind(&self) -> &str {
        "chat"
    }

    fn notify(
        &self,
        action: &AlertAction,
        rule: &AlertRule,
        incident: &AlertIncident,
    ) -> BoxFuture<'_, Result<()>> {
        let AlertAction::Chat { channel, webhook_url } = action else {
            let err = mismatch("chat", action.kind());
            return Box::pin(async move { Err(err) });
        };
        let url = webhook_url.clone();
        let body: Value = serde_json::json!({
            "channel": channel,
            "text": summary(rule, incident),
        });
        Box::pin(async move { post_json("chat", &self.http, &url, &body).await })
    }
}

fn mismatch(expected: &str, got: &str) -> WeftError {
    WeftError::Notify {
        channel: expected.to_string(),
        message: format!("cannot deliver a '{}' action", got),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::Utc;
    use serde_json::json;
    use weft_core::alert::{AlertCondition, AlertSeverity, IncidentStatus};

    type Received = Arc<Mutex<Vec<Value>>>;

    async fn capture(State(received): State<Received>, Json(body): Json<Value>) -> StatusCode {
        received.lock().unwrap().push(body);
        StatusCode::OK
    }

    async fn reject() -> StatusCode {
        StatusCode::SERVICE_UNAVAILABLE
    }

    async fn serve() -> (String, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hook", post(capture))
            .route("/down", post(reject))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{}", addr), received)
    }

    fn rule() -> AlertRule {
        let mut rule = AlertRule::new(
            "r1",
            AlertCondition::FailureCount {
                window_minutes: 5,
                threshold: 3,
            },
        );
        rule.name = "Too many failures".into();
        rule
    }

    fn incident() -> AlertIncident {
        AlertIncident {
            id: "i1".into(),
            rule_id: "r1".into(),
            status: IncidentStatus::Active,
            severity: AlertSeverity::Critical,
            context: json!({"failures": 4}),
            action_results: vec![],
            triggered_at: Utc::now(),
            resolved_at: None,
        }
    }

    #[test]
    fn test_summary_line() {
        assert_eq!(
            summary(&rule(), &incident()),
            "[critical] Too many failures (failure_count): {\"failures\":4}"
        );
    }

    #[tokio::test]
    async fn test_webhook_posts_incident() {
        let (base, received) = serve().await;
        let action = AlertAction::Webhook {
            url: format!("{}/hook", base),
        };
        WebhookNotifier::new()
            .notify(&action, &rule(), &incident())
            .await
            .unwrap();

        let bodies = received.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        assert_eq!(bodies[0]["ruleId"], "r1");
        assert_eq!(bodies[0]["conditionType"], "failure_count");
        assert_eq!(bodies[0]["incident"]["id"], "i1");
    }

    #[tokio::test]
    async fn test_chat_posts_text() {
        let (base, received) = serve().await;
        let action = AlertAction::Chat {
            channel: "#ops".into(),
            webhook_url: format!("{}/hook", base),
        };
        ChatNotifier::new()
            .notify(&action, &rule(), &incident())
            .await
            .unwrap();

        let bodies = received.lock().unwrap().clone();
        assert_eq!(bodies[0]["channel"], "#ops");
        assert!(bodies[0]["text"].as_str().unwrap().starts_with("[critical]"));
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let (base, _) = serve().await;
        let action = AlertAction::Webhook {
            url: format!("{}/down", base),
        };
        let err = WebhookNotifier::new()
            .notify(&action, &rule(), &incident())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn test_wrong_action_kind_is_rejected() {
        let action = AlertAction::Email {
            to: vec!["ops@example.com".into()],
        };
        let err = WebhookNotifier::new()
            .notify(&action, &rule(), &incident())
            .await
            .unwrap_err();
        assert!(matches!(err, WeftError::Notify { .. }));
    }
}
