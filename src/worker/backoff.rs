//! Exponential backoff for queue redelivery.
//!
//! A `Retry` verdict hands the message back to the queue with a visibility
//! delay that grows with the delivery attempt number:
//!
//! - Default: 5s base, doubling, capped at 10 minutes
//!   (5s, 10s, 20s, 40s, 80s, 160s, 320s, 600s, 600s, ...)

use std::time::Duration;

/// Configuration for exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first redelivery.
    pub initial_delay: Duration,

    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0).
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub const DEFAULT: Self = Self {
        initial_delay: Duration::from_secs(5),
        max_delay: Duration::from_secs(600),
        backoff_multiplier: 2.0,
    };

    pub fn new(initial_delay: Duration, max_delay: Duration, backoff_multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Computes the delay after the given delivery attempt (1-indexed).
    ///
    /// The delay grows exponentially:
    /// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let multiplier = self.backoff_multiplier.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
