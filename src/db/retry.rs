//! Retry budgets and jittered backoff for conflicting transactions.

use rand::Rng;
use std::time::Duration;

/// Attempt budget for request-serving paths.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Attempt budget for long-running batch imports.
pub const BULK_MAX_ATTEMPTS: u32 = 50;

const BASE_SLEEP_MS: u64 = 10;
const DEFAULT_JITTER_MS: u64 = 20;
const BULK_SPREAD_MS: u64 = 250;
const BULK_EXPONENTIAL_CAP_MS: u64 = 3000;

/// Named retry profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryProfile {
    /// 3 attempts, 10-30ms between them.
    #[default]
    Default,
    /// 50 attempts, capped exponential spread up to ~3.26s.
    Bulk,
}

/// What to do after a retryable failure of attempt `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Stop,
    Sleep(Duration),
}

impl RetryProfile {
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::Default => DEFAULT_MAX_ATTEMPTS,
            Self::Bulk => BULK_MAX_ATTEMPTS,
        }
    }

    /// Decide after `attempt` attempts (1-based) have failed with a conflict.
    pub fn next(&self, attempt: u32) -> RetryDecision {
        self.next_with(attempt, &mut rand::thread_rng())
    }

    /// Same as [`next`](Self::next) with an explicit random source.
    pub fn next_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> RetryDecision {
        if attempt >= self.max_attempts() {
            return RetryDecision::Stop;
        }

        let sleep_ms = match self {
            Self::Default => BASE_SLEEP_MS + rng.gen_range(0..=DEFAULT_JITTER_MS),
            Self::Bulk => {
                let exponential = 1u64
                    .checked_shl(attempt)
                    .unwrap_or(u64::MAX)
                    .min(BULK_EXPONENTIAL_CAP_MS);
                let spread = (BULK_SPREAD_MS + exponential) as f64;
                BASE_SLEEP_MS + (rng.r#gen::<f64>() * spread) as u64
            }
        };

        RetryDecision::Sleep(Duration::from_millis(sleep_ms))
    }
}

impl std::fmt::Display for RetryProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Bulk => write!(f, "bulk"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleep_ms(decision: RetryDecision) -> u64 {
        match decision {
            RetryDecision::Sleep(d) => d.as_millis() as u64,
            RetryDecision::Stop => panic!("expected sleep"),
        }
    }

    #[test]
    fn test_default_profile_budget() {
        let profile = RetryProfile::Default;
        assert!(matches!(profile.next(1), RetryDecision::Sleep(_)));
        assert!(matches!(profile.next(2), RetryDecision::Sleep(_)));
        assert_eq!(profile.next(3), RetryDecision::Stop);
        assert_eq!(profile.next(10), RetryDecision::Stop);
    }

    #[test]
    fn test_default_profile_sleep_range() {
        for _ in 0..200 {
            let ms = sleep_ms(RetryProfile::Default.next(1));
            assert!((10..=30).contains(&ms), "sleep {}ms out of range", ms);
        }
    }

    #[test]
    fn test_bulk_profile_budget() {
        let profile = RetryProfile::Bulk;
        assert!(matches!(profile.next(49), RetryDecision::Sleep(_)));
        assert_eq!(profile.next(50), RetryDecision::Stop);
    }

    #[test]
    fn test_bulk_profile_sleep_is_capped() {
        for attempt in [1, 5, 11, 12, 20, 40, 49] {
            for _ in 0..50 {
                let ms = sleep_ms(RetryProfile::Bulk.next(attempt));
                assert!(ms >= 10);
                assert!(ms <= 10 + 250 + 3000, "attempt {} slept {}ms", attempt, ms);
            }
        }
    }

    #[test]
    fn test_bulk_profile_upper_bound_grows() {
        // With an rng pinned near 1.0 the sleep tracks the exponential term.
        struct Max;
        impl rand::RngCore for Max {
            fn next_u32(&mut self) -> u32 {
                u32::MAX
            }
            fn next_u64(&mut self) -> u64 {
                u64::MAX
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(0xff);
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
                dest.fill(0xff);
                Ok(())
            }
        }

        let early = sleep_ms(RetryProfile::Bulk.next_with(2, &mut Max));
        let late = sleep_ms(RetryProfile::Bulk.next_with(30, &mut Max));
        assert!(early < 300);
        assert!(late >= 3200);
    }

    #[test]
    fn test_max_attempts() {
        assert_eq!(RetryProfile::default().max_attempts(), 3);
        assert_eq!(RetryProfile::Bulk.max_attempts(), 50);
    }
}
