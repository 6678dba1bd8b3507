//! Retry delays with linear or exponential backoff and a cap.

use std::time::Duration;

use serde::Deserialize;

/// Backoff curve for retry delays.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Constant delay: `base` on every attempt.
    Linear,
    /// Doubling delay: `base * 2^(attempt-1)`.
    #[default]
    Exponential,
}

/// Computed retry behaviour for one saga's dispatch loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first re-attempt.
    pub base_delay: Duration,
    /// Cap applied to every computed delay.
    pub max_delay: Duration,
    /// Attempts before giving up (including the initial one).
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay after a failed attempt (1-indexed).
    ///
    /// `min(max_delay, base * mul^(attempt-1))` with `mul` 1 for linear and
    /// 2 for exponential backoff. Overflow-safe for large attempt numbers.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(20);
        let delay_ms = match self.backoff {
            Backoff::Linear => base_ms,
            Backoff::Exponential => base_ms.saturating_mul(1u64 << exponent),
        };
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as u64))
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
