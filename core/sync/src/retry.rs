//! Exponential backoff for scheduled retry passes.
//!
//! Failed operations are retried by the next drain pass, never inside the
//! pass that failed them. When backoff is enabled the scheduler uses
//! [`Backoff`] to decide when that next pass happens on its own.

use std::time::Duration;

/// Delays for scheduled retry passes: doubling from `initial_delay` up to
/// `max_delay`, spread by up to 25% either way when `jitter` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryConfig {
    /// Delay before retry pass number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let growth = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self
            .initial_delay
            .saturating_mul(growth)
            .min(self.max_delay);

        if self.jitter {
            delay.mul_f64(0.75 + rand::random::<f64>() * 0.5)
        } else {
            delay
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

/// Backoff state across consecutive unsuccessful passes.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    streak: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, streak: 0 }
    }

    /// Delay before the next retry pass; grows with each call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.config.delay_for_attempt(self.streak);
        self.streak = self.streak.saturating_add(1);
        delay
    }

    /// Forget the failure streak after a clean pass.
    pub fn reset(&mut self) {
        self.streak = 0;
    }

    /// Number of consecutive passes that left failures behind.
    pub fn streak(&self) -> u32 {
        self.streak
    }
}
