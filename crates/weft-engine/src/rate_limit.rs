use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Sliding-window limiter: at most `max` acquisitions in any `window`.
///
/// Shared by every worker of an engine, so the cap holds pool-wide.
pub struct RateLimiter {
    max: usize,
    window: Duration,
    granted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max: max.max(1),
            window,
            granted: Mutex::new(VecDeque::with_capacity(max)),
        }
    }

    /// Take a slot, or report how long until the oldest grant expires.
    async fn try_take(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut granted = self.granted.lock().await;
        while let Some(&oldest) = granted.front() {
            if now.duration_since(oldest) >= self.window {
                granted.pop_front();
            } else {
                break;
            }
        }
        if granted.len() < self.max {
            granted.push_back(now);
            return Ok(());
        }
        let oldest = granted.front().copied().unwrap_or(now);
        Err(self.window.saturating_sub(now.duration_since(oldest)))
    }

    /// Take a slot without waiting.
    pub async fn try_acquire(&self) -> bool {
        self.try_take().await.is_ok()
    }

    /// Wait until a slot is free, then take it.
    pub async fn acquire(&self) {
        loop {
            match self.try_take().await {
                Ok(()) => return,
                Err(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}
