use std::time::Duration;

/// Failed attempts a task may be retried after before it is dead-lettered.
pub const MAX_RETRY_COUNT: u32 = 3;

/// Fixed delay between attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Retry policy for dispatch tasks.
/// Every retry waits the same interval; there is no backoff growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retry_count: u32,

    interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_retry_count: u32, interval: Duration) -> Self {
        Self {
            max_retry_count,
            interval,
        }
    }

    pub fn max_retry_count(&self) -> u32 {
        self.max_retry_count
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a task that has already been retried `retry_count` times and
    /// just failed again gets another attempt.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retry_count
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(MAX_RETRY_COUNT, RETRY_INTERVAL)
    }
}
