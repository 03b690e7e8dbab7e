//! Retry configuration for remote calls
//!
//! Exponential backoff capped at `max_delay`, plus random jitter.

use rand::Rng;
use std::time::Duration;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound of the exponential part
    pub max_delay: Duration,
    /// Upper bound of the random jitter added to every delay
    pub jitter_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_max: Duration::from_secs(1),
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed), without jitter
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs = self.initial_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Backoff plus a random jitter in `[0, jitter_max]`
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter_max.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff_for_attempt(attempt) + Duration::from_millis(jitter)
    }

    /// Check if another attempt is allowed after `attempt` attempts were made
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
