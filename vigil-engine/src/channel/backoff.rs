//! Reconnect delay schedule.

use std::time::Duration;

use shared::config::ChannelConfig;

/// Exponential reconnect delay: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// Policy with an explicit first delay and ceiling.
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Policy from the channel configuration.
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.base_delay(), config.max_delay())
    }

    /// Delay before the retry that follows `attempt` failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(1_000), Duration::from_millis(30_000))
    }
}
