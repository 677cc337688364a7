//! Exponential backoff with error-proportional jitter
//!
//! `backoff(n) = min(max, 100ms * 2^min(n, 20) + random(0..=100ms * n))`

use rand::Rng;
use std::time::Duration;

/// Base step of the exponential growth in milliseconds
pub const BASE_DELAY_MS: u64 = 100;
/// Exponent ceiling; 100ms * 2^20 is already beyond the default one-day cap
pub const MAX_EXPONENT: u32 = 20;

/// Backoff generator capped at a configurable maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    max: Duration,
}

impl Backoff {
    pub fn new(max: Duration) -> Self {
        Self { max }
    }

    /// Configured cap
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay after `error_count` consecutive errors, with random jitter
    pub fn delay_for(&self, error_count: u32) -> Duration {
        let jitter_bound = max_jitter_ms(error_count);
        let jitter = rand::thread_rng().gen_range(0..=jitter_bound);
        self.delay_with_jitter(error_count, jitter)
    }

    /// Delay for a given jitter value (pure function)
    ///
    /// Jitter above `100ms * error_count` is clamped so the result stays within
    /// the documented envelope.
    pub fn delay_with_jitter(&self, error_count: u32, jitter_ms: u64) -> Duration {
        let exponent = error_count.min(MAX_EXPONENT);
        let base = BASE_DELAY_MS.saturating_mul(1u64 << exponent);
        let jitter = jitter_ms.min(max_jitter_ms(error_count));
        let delay = Duration::from_millis(base.saturating_add(jitter));
        delay.min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(86_400_000))
    }
}

fn max_jitter_ms(error_count: u32) -> u64 {
    BASE_DELAY_MS.saturating_mul(u64::from(error_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_errors_grow_exponentially() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_with_jitter(0, 0), Duration::from_millis(100));
        assert_eq!(backoff.delay_with_jitter(1, 0), Duration::from_millis(200));
        assert_eq!(backoff.delay_with_jitter(2, 0), Duration::from_millis(400));
        assert_eq!(backoff.delay_with_jitter(3, 0), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_is_bounded_by_error_count() {
        let backoff = Backoff::default();
        // 3 errors allow at most 300ms of jitter
        assert_eq!(backoff.delay_with_jitter(3, 10_000), Duration::from_millis(1100));
        // no jitter without errors
        assert_eq!(backoff.delay_with_jitter(0, 50), Duration::from_millis(100));
    }

    #[test]
    fn test_cap_applies() {
        let backoff = Backoff::new(Duration::from_secs(5));
        assert_eq!(backoff.delay_with_jitter(10, 0), Duration::from_secs(5));
        assert_eq!(backoff.delay_for(1_000), Duration::from_secs(5));
    }

    #[test]
    fn test_default_cap_is_one_day() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(u32::MAX), Duration::from_secs(86_400));
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_cap(count in 0u32..10_000, cap_ms in 1u64..200_000_000) {
            let backoff = Backoff::new(Duration::from_millis(cap_ms));
            prop_assert!(backoff.delay_for(count) <= Duration::from_millis(cap_ms));
        }

        #[test]
        fn backoff_is_non_decreasing(count in 0u32..64, jitter_a in any::<u64>(), jitter_b in any::<u64>()) {
            // Holds for any jitter draw as long as the cap is below 100ms * 2^20
            let backoff = Backoff::default();
            let current = backoff.delay_with_jitter(count, jitter_a);
            let next = backoff.delay_with_jitter(count + 1, jitter_b);
            prop_assert!(next >= current, "backoff({}) = {:?} > backoff({}) = {:?}", count, current, count + 1, next);
        }

        #[test]
        fn random_backoff_stays_in_envelope(count in 0u32..20) {
            let backoff = Backoff::default();
            let delay = backoff.delay_for(count).as_millis() as u64;
            let base = 100u64 << count;
            prop_assert!(delay >= base.min(86_400_000));
            prop_assert!(delay <= (base + 100 * u64::from(count)).min(86_400_000));
        }
    }
}
