//! Dial retry with exponential backoff.
//!
//! A failed dial attempt sleeps `retry_base × 2^attempt` before trying again.
//! After `max_retried` retries the dial fails permanently.

use crate::options::DialOptions;
use std::time::Duration;

/// Retry state tracker for one dial phase.
///
/// # Example
///
/// ```rust
/// use rivet_core::backoff::DialBackoff;
/// use rivet_core::options::DialOptions;
/// use std::time::Duration;
///
/// let options = DialOptions::default()
///     .with_retry_base(Duration::from_millis(100))
///     .with_max_retried(2);
///
/// let mut backoff = DialBackoff::new(&options);
///
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
/// assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
///
/// // Retries exhausted: the third failure is final
/// assert_eq!(backoff.next_delay(), None);
/// assert_eq!(backoff.attempts(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct DialBackoff {
    /// Delay after the first failure
    base_interval: Duration,
    /// Number of retries allowed after the first attempt
    max_retried: u32,
    /// Failed attempts so far
    failures: u32,
}

impl DialBackoff {
    /// Create a retry tracker from dial options.
    pub const fn new(options: &DialOptions) -> Self {
        Self {
            base_interval: options.retry_base,
            max_retried: options.max_retried,
            failures: 0,
        }
    }

    /// Record a failed attempt and get the delay before the next one.
    ///
    /// Returns `None` once `max_retried` retries have been used, meaning the
    /// dial must fail permanently.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let attempt = self.failures;
        self.failures += 1;

        if attempt >= self.max_retried {
            return None;
        }

        Some(self.base_interval * (1_u32 << attempt.min(16)))
    }

    /// Total number of failed attempts recorded.
    #[inline]
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.failures
    }

    /// Get the base retry interval.
    #[inline]
    #[must_use]
    pub const fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Get the retry cap.
    #[inline]
    #[must_use]
    pub const fn max_retried(&self) -> u32 {
        self.max_retried
    }

    /// Upper bound of the total time spent sleeping before giving up.
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_retried)
            .map(|attempt| self.base_interval * (1_u32 << attempt.min(16)))
            .sum()
    }
}
