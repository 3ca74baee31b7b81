use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with multiplicative jitter.
///
/// `delay(n) = min(max_delay, initial_delay * 2^(n-1)) * U(1 - jitter, 1 + jitter)`
///
/// The jitter is drawn uniformly so that many clients reconnecting after the
/// same outage spread out instead of arriving together. A `jitter_factor` of
/// zero makes the policy deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Fraction of the delay used as +/- jitter, clamped to [0, 1]
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            jitter_factor,
        }
    }

    /// Same policy without jitter
    pub fn deterministic(initial_delay: Duration, max_delay: Duration) -> Self {
        Self::new(initial_delay, max_delay, 0.0)
    }

    /// Delay to wait before retry number `attempt` (1-based; 0 is treated as 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }

        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Un-jittered delay for an attempt
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self.initial_delay.saturating_mul(1u32 << exponent);
        scaled.min(self.max_delay)
    }
}
