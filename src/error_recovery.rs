//! Retry policy for command exchanges.
//!
//! The protocol engine resends a command when an exchange fails for a transient
//! reason (timeout, corrupted or mismatched reply). How many times and how long
//! it waits in between is described by a [`RetryPolicy`].

use std::time::Duration;

use crate::transport::{DRAIN_TIMEOUT, MAX_DRAIN_FRAMES};

/// Defines a policy for retrying an exchange.
///
/// # Example
///
/// ```rust
/// use rust_cba::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_retries: 5,
///     timeout: Duration::from_millis(500),
///     backoff_delay: Duration::from_millis(20),
/// };
/// assert_eq!(policy.attempt_budget(), 6);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of resends after the first attempt.
    ///
    /// Set to 0 to disable retries.
    pub max_retries: u32,

    /// How long to wait for each reply.
    pub timeout: Duration,

    /// Constant delay before each resend.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three retries, one second per reply, 10ms between attempts.
    ///
    /// ```rust
    /// use rust_cba::error_recovery::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.max_retries, 3);
    /// assert_eq!(policy.timeout, Duration::from_millis(1000));
    /// ```
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_millis(1000),
            backoff_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Same policy with a different retry count.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Total attempts, including the first one.
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Upper bound on how long one command can block when every attempt times out.
    ///
    /// Counts one bounded drain of stale input per retry, plus one before the
    /// first attempt when the previous exchange failed.
    pub fn worst_case(&self) -> Duration {
        let drain = DRAIN_TIMEOUT * MAX_DRAIN_FRAMES as u32;
        self.timeout * self.attempt_budget()
            + self.backoff_delay * self.max_retries
            + drain * self.attempt_budget()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_counts_first_attempt() {
        assert_eq!(RetryPolicy::default().attempt_budget(), 4);
        assert_eq!(RetryPolicy::default().with_max_retries(0).attempt_budget(), 1);
        assert_eq!(
            RetryPolicy::default().with_max_retries(u32::MAX).attempt_budget(),
            u32::MAX
        );
    }

    #[test]
    fn worst_case_adds_timeouts_backoff_and_drains() {
        let policy = RetryPolicy {
            max_retries: 2,
            timeout: Duration::from_millis(100),
            backoff_delay: Duration::from_millis(5),
        };
        // 3 x 100ms replies, 2 x 5ms backoff, 3 drains of 8 x 5ms
        assert_eq!(policy.worst_case(), Duration::from_millis(430));

        let single = RetryPolicy::default().with_max_retries(0);
        assert_eq!(single.worst_case(), Duration::from_millis(1040));
    }
}
