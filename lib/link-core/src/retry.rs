//! Retry policy for conflicting writes

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter and a bounded number of attempts
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Backoff before the first retry
    pub initial_backoff: Duration,
    /// Upper bound of a single backoff
    pub max_backoff: Duration,
    /// Spread each backoff by ±50%
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy retrying immediately, for tests
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// Backoff before retry number `retry_count` (zero based)
    pub fn backoff_duration(&self, retry_count: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as u64;
        let exponential = 2u64.saturating_pow(retry_count);
        let backoff_ms = base.saturating_mul(exponential).min(self.max_backoff.as_millis() as u64);
        if !self.jitter || backoff_ms == 0 {
            return Duration::from_millis(backoff_ms);
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((backoff_ms as f64 * factor) as u64)
    }
}
