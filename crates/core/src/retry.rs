//! Retry policy and backoff math.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exponential backoff: `base * 2^attempts`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Base delay
    pub base: Duration,
    /// Maximum delay cap
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// No delay at all; useful in tests.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Delay before the next attempt, given the attempts made so far.
    pub fn delay(&self, attempts: u32) -> Duration {
        match 1u32.checked_shl(attempts) {
            Some(factor) => self.base.saturating_mul(factor).min(self.max),
            None => self.max,
        }
    }

    /// Earliest time the job may be claimed again.
    pub fn next_attempt_time(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay =
            chrono::Duration::from_std(self.delay(attempts)).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Queue-wide retry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed when enqueue does not say otherwise
    pub max_attempts: u32,
    /// Delay schedule between attempts
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn exponential(max_attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::new(base, max),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let b = backoff();
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(2), Duration::from_millis(400));
        assert_eq!(b.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_is_capped() {
        let b = backoff();
        assert_eq!(b.delay(10), Duration::from_secs(10));
        assert_eq!(b.delay(31), Duration::from_secs(10));
        assert_eq!(b.delay(32), Duration::from_secs(10));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn next_attempt_time_adds_delay() {
        let now = Utc::now();
        let at = backoff().next_attempt_time(2, now);
        assert_eq!(at - now, chrono::Duration::milliseconds(400));
    }

    #[test]
    fn immediate_backoff_is_now() {
        let now = Utc::now();
        assert_eq!(Backoff::immediate().next_attempt_time(7, now), now);
    }

    #[test]
    fn huge_cap_does_not_overflow() {
        let b = Backoff::new(Duration::from_secs(u64::MAX / 4), Duration::MAX);
        let at = b.next_attempt_time(40, Utc::now());
        assert_eq!(at, DateTime::<Utc>::MAX_UTC);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn delay_is_monotonic_and_bounded(
            base_ms in 0u64..10_000,
            max_ms in 0u64..600_000,
            attempts in 0u32..64,
        ) {
            let b = Backoff::new(Duration::from_millis(base_ms), Duration::from_millis(max_ms));
            let d = b.delay(attempts);
            prop_assert!(d <= b.max);
            prop_assert!(b.delay(attempts + 1) >= d);
        }
    }
}
