use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeHandler;
use weft_core::types::{HandlerContext, HandlerOutput};
use weft_core::workflow::{ActionConfig, NodeType};

const MAX_BODY_CHARS: usize = 64 * 1024;

/// Action handler for `http.request` nodes.
///
/// `params`: `url`, `method` (default POST), `headers`. The node's resolved
/// inputs are sent as the JSON body for every method except GET and HEAD.
/// Output is `{"status": u16, "body": ..}`, with the body parsed as JSON when
/// possible. Non-2xx responses fail the node.
pub struct HttpActionHandler {
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct HttpParams {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: HashMap<String, String>,
}

fn default_method() -> String {
    "POST".into()
}

impl HttpActionHandler {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

impl Default for HttpActionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeHandler for HttpActionHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Action
    }

    fn execute(&self, input: Value, ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move {
            let node_err = |message: String| WeftError::NodeExecution {
                node_id: ctx.node_id.clone(),
                message,
            };

            let config: ActionConfig = serde_json::from_value(ctx.config.clone())
                .map_err(|e| node_err(format!("invalid action config: {}", e)))?;
            if config.action != "http.request" {
                return Err(node_err(format!("unsupported action '{}'", config.action)));
            }
            let params: HttpParams = serde_json::from_value(config.params)
                .map_err(|e| node_err(format!("invalid http.request params: {}", e)))?;

            let method = params
                .method
                .to_uppercase()
                .parse::<reqwest::Method>()
                .map_err(|e| node_err(format!("invalid method: {}", e)))?;
            let sends_body = !matches!(method, reqwest::Method::GET | reqwest::Method::HEAD);

            let mut req = self.http.request(method.clone(), &params.url);
            for (k, v) in &params.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            if sends_body {
                req = req.json(&input);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| node_err(format!("request failed: {}", e)))?;
            let status = resp.status();
            let mut text = resp.text().await.unwrap_or_default();
            if let Some((idx, _)) = text.char_indices().nth(MAX_BODY_CHARS) {
                text.truncate(idx);
            }
            debug!(node_id = %ctx.node_id, method = %method, status = status.as_u16(), "HTTP action finished");

            if !status.is_success() {
                return Err(node_err(format!("HTTP {}: {}", status.as_u16(), text)));
            }
            let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
            Ok(HandlerOutput::new(json!({
                "status": status.as_u16(),
                "body": body,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use weft_core::types::ExecutionId;

    async fn serve() -> String {
        let app = Router::new()
            .route("/echo", post(|Json(body): Json<Value>| async move { Json(json!({"got": body})) }))
            .route("/plain", get(|| async { "pong" }))
            .route("/fail", post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{}", addr)
    }

    fn ctx(action: &str, params: Value) -> HandlerContext {
        HandlerContext {
            execution_id: ExecutionId::new(),
            workflow_id: "wf".into(),
            user_id: "u".into(),
            node_id: "call".into(),
            config: json!({"action": action, "params": params}),
            trigger_data: Value::Null,
            node_outputs: HashMap::new(),
            is_test: false,
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_posts_inputs_as_json() {
        let base = serve().await;
        let out = HttpActionHandler::new()
            .execute(
                json!({"email": "ada@example.com"}),
                ctx("http.request", json!({"url": format!("{}/echo", base)})),
            )
            .await
            .unwrap();
        assert_eq!(out.output["status"], 200);
        assert_eq!(out.output["body"]["got"]["email"], "ada@example.com");
    }

    #[tokio::test]
    async fn test_get_returns_text_body() {
        let base = serve().await;
        let out = HttpActionHandler::new()
            .execute(
                json!({}),
                ctx("http.request", json!({"url": format!("{}/plain", base), "method": "get"})),
            )
            .await
            .unwrap();
        assert_eq!(out.output["body"], "pong");
    }

    #[tokio::test]
    async fn test_error_status_fails_node() {
        let base = serve().await;
        let err = HttpActionHandler::new()
            .execute(json!({}), ctx("http.request", json!({"url": format!("{}/fail", base)})))
            .await
            .unwrap_err();
        match err {
            WeftError::NodeExecution { node_id, message } => {
                assert_eq!(node_id, "call");
                assert!(message.contains("502"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_is_rejected() {
        let err = HttpActionHandler::new()
            .execute(json!({}), ctx("email.send", json!({})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported action"));
    }
}
