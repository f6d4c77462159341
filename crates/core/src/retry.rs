//! Linear backoff for unexpected disconnects.

use std::time::Duration;

/// Retry budget and backoff schedule for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next retry given how many retries have already run,
    /// or `None` when the budget is spent.
    pub fn delay_for(&self, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries {
            return None;
        }
        Some(self.base_delay * (retry_count + 1))
    }
}
