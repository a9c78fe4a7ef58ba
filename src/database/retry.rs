//! Bounded exponential backoff with equal jitter.

use crate::config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^retry)`; `retry` is zero-based
    pub fn exponential_cap(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Half the capped exponential plus a uniform random share of the other half
    pub fn delay_for(&self, retry: u32) -> Duration {
        let cap = self.exponential_cap(retry).as_millis() as u64;
        let half = cap / 2;
        Duration::from_millis(half + fastrand::u64(0..=cap - half))
    }

    /// Number of attempts (first try plus retries) allowed for a call
    pub fn attempts(&self, retries_override: Option<u32>, no_retry: bool) -> u32 {
        if no_retry {
            1
        } else {
            retries_override.unwrap_or(self.max_retries).saturating_add(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from(&RetryConfig::default())
    }

    #[test]
    fn test_exponential_cap_doubles_until_max() {
        let policy = policy();
        assert_eq!(policy.exponential_cap(0), Duration::from_millis(100));
        assert_eq!(policy.exponential_cap(1), Duration::from_millis(200));
        assert_eq!(policy.exponential_cap(5), Duration::from_millis(3200));
        assert_eq!(policy.exponential_cap(6), Duration::from_millis(5000));
        assert_eq!(policy.exponential_cap(40), Duration::from_millis(5000));
    }

    #[test]
    fn test_attempts_saturate_at_u32_max() {
        assert_eq!(policy().attempts(Some(u32::MAX), false), u32::MAX);
        assert_eq!(policy().attempts(Some(u32::MAX), true), 1);
    }

    #[test]
    fn test_attempts() {
        let policy = policy();
        assert_eq!(policy.attempts(None, false), 4);
        assert_eq!(policy.attempts(Some(1), false), 2);
        assert_eq!(policy.attempts(Some(5), true), 1);
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_max(
            base in 1u64..1_000,
            extra in 0u64..10_000,
            retry in 0u32..64,
        ) {
            let policy = RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(base),
                max_delay: Duration::from_millis(base + extra),
            };
            let delay = policy.delay_for(retry);
            prop_assert!(delay <= policy.max_delay);
            prop_assert!(delay >= policy.exponential_cap(retry) / 2);
        }

        #[test]
        fn prop_expected_delay_non_decreasing(retry in 0u32..63) {
            // E[delay] = 3/4 of the cap, so monotonic caps imply monotonic expectation
            let policy = policy();
            prop_assert!(policy.exponential_cap(retry) <= policy.exponential_cap(retry + 1));
        }
    }
}
