//! Backoff schedule for pending operations.
//!
//! Two independent ladders apply: handler errors back off from a short base,
//! unresolved dependencies (skips) back off from a longer one. Both double per
//! attempt and share a single cap.

use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry and skip behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Handler errors tolerated before an operation is marked failed.
    pub max_retries: u32,
    /// Dependency skips tolerated before an operation is marked failed.
    pub max_skips: u32,
    /// Delay after the first handler error.
    pub retry_base_delay: Duration,
    /// Delay after the first skip.
    pub skip_base_delay: Duration,
    /// Cap for both ladders.
    pub max_delay: Duration,
    /// Skip exponent stops growing here.
    pub skip_exponent_cap: u32,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            max_skips: 10,
            retry_base_delay: Duration::from_secs(10),
            skip_base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            skip_exponent_cap: 6,
        }
    }

    pub fn with_max_skips(mut self, max_skips: u32) -> Self {
        self.max_skips = max_skips;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    pub fn with_skip_base_delay(mut self, delay: Duration) -> Self {
        self.skip_base_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    fn doubled(&self, base: Duration, exponent: u32) -> Duration {
        base.saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// Delay after a handler error, given the retry count before the error.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        self.doubled(self.retry_base_delay, retry_count)
    }

    /// Delay after a skip, given the incremented skip count.
    pub fn skip_delay(&self, skip_count: u32) -> Duration {
        self.doubled(self.skip_base_delay, skip_count.min(self.skip_exponent_cap))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Convert for timestamp arithmetic.
pub(crate) fn to_chrono(delay: Duration) -> ChronoDuration {
    ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30 * 60))
}
