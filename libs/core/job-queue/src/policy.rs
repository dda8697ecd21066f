//! Retry policy: exponential backoff keyed on the attempt counter.

use std::time::Duration;

/// Exponents above this would overflow any sane delay anyway.
const MAX_BACKOFF_EXPONENT: u32 = 20;

/// Retry policy for one job class.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base delay; the first retry waits `base * 2`.
    pub base_delay: Duration,
    /// Attempt ceiling. A job whose attempt counter reaches this is Failed.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Backoff before running `attempt` (the already-incremented counter).
    ///
    /// `base * 2^attempt`, so retries after failures on attempt 0, 1, 2
    /// wait `2b`, `4b`, `8b`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(MAX_BACKOFF_EXPONENT));
        Duration::from_millis((self.base_delay.as_millis() as u64).saturating_mul(factor))
    }
}
