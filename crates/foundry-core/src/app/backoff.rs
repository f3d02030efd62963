//! Idle backoff: how long the worker waits before the next claim.

use std::time::Duration;

/// Wait between iterations.
///
/// A miss or a single failed iteration waits `base`. From the second
/// consecutive failure on, the wait doubles per further failure:
/// `base * multiplier^(errors - 1)`, never more than `max`.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    /// Poll interval.
    pub base: Duration,

    pub multiplier: f64,

    /// Upper bound.
    pub max: Duration,
}

impl IdleBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            multiplier: 2.0,
            max: max.max(base),
        }
    }

    /// `consecutive_errors` is 0 after a success or a miss.
    pub fn delay(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors < 2 {
            return self.base;
        }
        // Large exponents saturate to +inf and are clamped below.
        let exponent = consecutive_errors.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(secs)
    }
}
