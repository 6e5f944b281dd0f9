use std::time::Duration;

/// Delay before the next attempt: `min(2^attempt * base, cap)`.
///
/// `attempt` is the number of attempts already made. Overflow saturates to
/// the cap.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let ms = 2u64
        .checked_pow(attempt)
        .and_then(|factor| base_ms.checked_mul(factor))
        .unwrap_or(u64::MAX)
        .min(cap.as_millis() as u64);
    Duration::from_millis(ms)
}
