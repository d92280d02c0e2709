//! Exponential backoff shared by detection retries and job re-enqueueing.

use std::time::Duration;

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`,
/// capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}
