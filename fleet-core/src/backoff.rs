//! Exponential backoff shared by HTTP retries and socket reconnects.

use std::time::Duration;

/// `base × multiplier^exponent`, capped at `max` when given.
///
/// Saturates instead of overflowing for large exponents.
pub fn exponential_delay(
    base: Duration,
    multiplier: f64,
    exponent: u32,
    max: Option<Duration>,
) -> Duration {
    let factor = multiplier.max(1.0).powi(exponent.min(i32::MAX as u32) as i32);
    let millis = base.as_millis() as f64 * factor;
    let delay = if millis.is_finite() && millis < u64::MAX as f64 {
        Duration::from_millis(millis.round() as u64)
    } else {
        Duration::from_millis(u64::MAX)
    };
    match max {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

/// Delay before the Nth reconnect attempt (N starting at 1):
/// `min(base × 2^(N-1), max)`.
pub fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    exponential_delay(base, 2.0, attempt.saturating_sub(1), Some(max))
}

/// Spread `delay` by ±`factor` of itself. A factor of 0 returns the delay unchanged.
pub fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }
    let base = delay.as_secs_f64();
    let range = base * factor.min(1.0);
    let jitter = (rand::random::<f64>() * 2.0 - 1.0) * range;
    Duration::from_secs_f64((base + jitter).max(0.0))
}
