//! Retry policy for request/reply tasks.
//!
//! The default policy retries forever with no delay beyond the socket's
//! receive window; callers that want bounded patience either apply a deadline
//! to the returned [`Reply`](crate::reply::Reply) or hand in a policy with
//! `max_attempts` set.

use std::time::Duration;

/// How a request task retries failed sends and empty receive windows.
///
/// # Example
///
/// ```rust
/// use wharf_core::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::bounded(5)
///     .with_backoff(Duration::from_millis(100), Duration::from_secs(1));
///
/// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_for(3), Duration::from_millis(400));
/// assert_eq!(policy.delay_for(9), Duration::from_secs(1));
/// assert!(policy.is_exhausted(5));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts tolerated before the task is rejected (`None` = unbounded)
    max_attempts: Option<u32>,
    /// Delay before the first send retry
    backoff: Duration,
    /// Cap for the doubling delay
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Retry forever, no delay between send attempts.
    pub const fn unbounded() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Give up after `attempts` failed attempts.
    pub const fn bounded(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
            backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Space send retries with an exponential backoff starting at `initial`.
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Maximum failed attempts, if bounded.
    #[inline]
    #[must_use]
    pub const fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based).
    ///
    /// Doubles with every attempt, capped at the maximum. A maximum below the
    /// initial backoff keeps the delay fixed at the initial value.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.backoff.is_zero() || attempt == 0 {
            return Duration::ZERO;
        }
        if self.max_backoff <= self.backoff {
            return self.backoff;
        }
        let shift = (attempt - 1).min(16);
        let delay = self.backoff.saturating_mul(1_u32 << shift);
        delay.min(self.max_backoff)
    }

    /// Whether `attempts` failed attempts use up the policy.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}
