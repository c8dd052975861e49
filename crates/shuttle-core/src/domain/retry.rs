//! Retry policy: decides whether an abandoned task may be claimed again.

use serde::{Deserialize, Serialize};

/// Retry ceiling for tasks that keep failing.
///
/// Pure decision logic, no I/O. Once `retry_count` reaches `max_retries` the
/// task is no longer auto-claimable and needs an operator (ignore or reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn should_retry(&self, retry_count: u32) -> bool {
        should_retry(retry_count, self.max_retries)
    }

    /// Retries left before the ceiling.
    pub fn remaining(&self, retry_count: u32) -> u32 {
        self.max_retries.saturating_sub(retry_count)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// `ShouldRetry(retryCount, maxRetries)`.
pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
    retry_count < max_retries
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 3, true)]
    #[case(2, 3, true)]
    #[case(3, 3, false)]
    #[case(7, 3, false)]
    #[case(0, 0, false)]
    fn should_retry_below_ceiling_only(
        #[case] retry_count: u32,
        #[case] max_retries: u32,
        #[case] expected: bool,
    ) {
        assert_eq!(should_retry(retry_count, max_retries), expected);
        assert_eq!(RetryPolicy::new(max_retries).should_retry(retry_count), expected);
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let policy = RetryPolicy::new(2);
        assert_eq!(policy.remaining(0), 2);
        assert_eq!(policy.remaining(5), 0);
    }
}
