use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weft_core::error::{Result, WeftError};
use weft_core::traits::NodeHandler;
use weft_core::types::{HandlerContext, HandlerOutput};
use weft_core::workflow::NodeType;

/// Returns its input unchanged.
pub struct EchoHandler {
    node_type: NodeType,
}

impl EchoHandler {
    pub fn action() -> Self {
        Self {
            node_type: NodeType::Action,
        }
    }

    pub fn agent() -> Self {
        Self {
            node_type: NodeType::Agent,
        }
    }
}

impl NodeHandler for EchoHandler {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn execute(&self, input: Value, _ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move { Ok(HandlerOutput::new(input)) })
    }
}

/// Always fails with the given message.
pub struct FailingHandler {
    node_type: NodeType,
    message: String,
}

impl FailingHandler {
    pub fn action(message: &str) -> Self {
        Self {
            node_type: NodeType::Action,
            message: message.to_string(),
        }
    }
}

impl NodeHandler for FailingHandler {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn execute(&self, _input: Value, ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move {
            Err(WeftError::NodeExecution {
                node_id: ctx.node_id,
                message: self.message.clone(),
            })
        })
    }
}

/// Fails the first `failures` calls, then echoes.
pub struct FlakyHandler {
    failures: usize,
    calls: Arc<AtomicUsize>,
}

impl FlakyHandler {
    pub fn action(failures: usize) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl NodeHandler for FlakyHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Action
    }

    fn execute(&self, input: Value, ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(WeftError::NodeExecution {
                    node_id: ctx.node_id,
                    message: format!("transient failure {}", call + 1),
                });
            }
            Ok(HandlerOutput::new(input))
        })
    }
}

/// Echoes after sleeping, for timeout tests.
pub struct SlowHandler {
    delay: Duration,
}

impl SlowHandler {
    pub fn action(delay: Duration) -> Self {
        Self { delay }
    }
}

impl NodeHandler for SlowHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Action
    }

    fn execute(&self, input: Value, _ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(HandlerOutput::new(input))
        })
    }
}

/// Echoes and reports a fixed token count and cost per call.
pub struct CostlyHandler {
    cost_usd: f64,
}

impl CostlyHandler {
    pub fn action(cost_usd: f64) -> Self {
        Self { cost_usd }
    }
}

impl NodeHandler for CostlyHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Action
    }

    fn execute(&self, input: Value, _ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async move { Ok(HandlerOutput::new(input).with_usage(100, self.cost_usd)) })
    }
}

/// Wraps another handler and counts invocations.
pub struct CountingHandler<H> {
    inner: H,
    calls: Arc<AtomicUsize>,
}

impl<H: NodeHandler> CountingHandler<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl<H: NodeHandler> NodeHandler for CountingHandler<H> {
    fn node_type(&self) -> NodeType {
        self.inner.node_type()
    }

    fn execute(&self, input: Value, ctx: HandlerContext) -> BoxFuture<'_, Result<HandlerOutput>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(input, ctx)
    }
}
