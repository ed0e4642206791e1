//! Retry policy: how many attempts a post gets and how long to wait between them.

use std::time::Duration;

use crate::config::PublishingConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub base_delay: Duration,

    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PublishingConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PublishingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        }
    }

    /// Whether a post that has made `attempts` attempts may make another.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// `base_delay * 2^(attempts - 1)`, capped at `max_delay`.
    ///
    /// `attempts` counts attempts already made (1-indexed); 0 is treated as 1.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}
