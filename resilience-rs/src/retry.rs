//! # Retry Policy
//!
//! Exponential backoff on top of [`backoff::ExponentialBackoff`]. A
//! [`Backoff`] hands out the delay before each retry and returns `None` once
//! the retry budget is spent. It never sleeps itself, so callers decide how to
//! wait.

use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;

/// Growth factor between consecutive delays
const MULTIPLIER: f64 = 2.0;

/// Retry configuration.
///
/// `max_retries` counts retries, not attempts: a value of 3 allows one initial
/// call plus three retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Upper bound on physical calls under this policy
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Starts a fresh backoff sequence
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.clone())
    }

    fn schedule(&self) -> ExponentialBackoff {
        // Deterministic doubling; the retry count bounds the sequence, not elapsed time
        ExponentialBackoff {
            current_interval: self.base_delay,
            initial_interval: self.base_delay,
            randomization_factor: 0.0,
            multiplier: MULTIPLIER,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// Backoff progression for one logical call
#[derive(Debug)]
pub struct Backoff {
    schedule: ExponentialBackoff,
    max_retries: u32,
    retries: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            schedule: policy.schedule(),
            max_retries: policy.max_retries,
            retries: 0,
        }
    }

    /// Consumes one retry and returns the delay to wait before it, or `None`
    /// when no retries remain.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        let delay = self.schedule.next_backoff()?;
        self.retries += 1;
        Some(delay)
    }

    /// Retries consumed so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Returns true if another retry is permitted
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_delays() {
        let mut backoff = RetryPolicy::default().backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.retries(), 3);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let mut backoff = RetryPolicy {
            max_retries: 8,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
        .backoff();

        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_no_retry_policy() {
        let policy = RetryPolicy::no_retry();
        let mut backoff = policy.backoff();

        assert_eq!(policy.max_attempts(), 1);
        assert!(!backoff.can_retry());
        assert_eq!(backoff.next_delay(), None);
    }
}
