//! Bounded retry delays with jitter.
//!
//! Delays come from a fixed table indexed by attempt number; attempts past
//! the end reuse the last entry. Jitter adds a uniform random fraction on
//! top of the base so a fleet of clients retrying the same outage does not
//! thunder back in lockstep.

use std::time::Duration;

use thiserror::Error;

use crate::env::Environment;

/// Default delay table, in milliseconds.
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 5] = [1000, 2000, 5000, 10_000, 20_000];

/// Default jitter factor: up to 15% on top of the base delay.
pub const DEFAULT_RETRY_JITTER: f64 = 0.15;

/// Invalid backoff configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackoffError {
    /// The delay table was empty.
    #[error("backoff delay table must not be empty")]
    EmptyDelays,

    /// A delay entry was zero.
    #[error("backoff delay at index {index} must be positive")]
    ZeroDelay {
        /// Index of the offending entry.
        index: usize,
    },

    /// Jitter factor outside `[0, 1]`.
    #[error("jitter factor {jitter} must be within [0, 1]")]
    JitterOutOfRange {
        /// The rejected factor.
        jitter: f64,
    },
}

/// Table-driven backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryBackoff {
    delays_ms: Vec<u64>,
    jitter: f64,
}

impl RetryBackoff {
    /// Policy from an explicit delay table and jitter factor.
    ///
    /// # Errors
    ///
    /// Rejects empty tables, zero delays, and jitter outside `[0, 1]`.
    /// A non-ascending table is legal but suspicious, so it only warns.
    pub fn new(delays_ms: Vec<u64>, jitter: f64) -> Result<Self, BackoffError> {
        if delays_ms.is_empty() {
            return Err(BackoffError::EmptyDelays);
        }
        if let Some(index) = delays_ms.iter().position(|&d| d == 0) {
            return Err(BackoffError::ZeroDelay { index });
        }
        if !jitter.is_finite() || !(0.0..=1.0).contains(&jitter) {
            return Err(BackoffError::JitterOutOfRange { jitter });
        }

        if delays_ms.windows(2).any(|pair| pair[1] < pair[0]) {
            tracing::warn!(?delays_ms, "backoff delay table is not ascending");
        }

        Ok(Self { delays_ms, jitter })
    }

    /// Number of entries in the delay table.
    pub fn len(&self) -> usize {
        self.delays_ms.len()
    }

    /// Whether the table is empty. Never true for a constructed policy.
    pub fn is_empty(&self) -> bool {
        self.delays_ms.is_empty()
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// The result lands in `[base, base * (1 + jitter))` where `base` is the
    /// table entry for the attempt, clamped to the last entry for attempts
    /// past the end.
    pub fn delay_for<E: Environment>(&self, attempt: u32, env: &E) -> Duration {
        let index = (attempt as usize).min(self.delays_ms.len() - 1);
        let base = self.delays_ms[index];

        let jitter_range = (base as f64 * self.jitter) as u64;
        let extra = if jitter_range == 0 { 0 } else { env.random_u64() % jitter_range };

        Duration::from_millis(base + extra)
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        let Ok(policy) = Self::new(DEFAULT_RETRY_DELAYS_MS.to_vec(), DEFAULT_RETRY_JITTER) else {
            unreachable!("default backoff table is valid");
        };
        policy
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::env::test_utils::MockEnv;

    #[test]
    fn rejects_empty_table() {
        assert_eq!(RetryBackoff::new(vec![], 0.1), Err(BackoffError::EmptyDelays));
    }

    #[test]
    fn rejects_zero_delay() {
        assert_eq!(
            RetryBackoff::new(vec![1000, 0, 3000], 0.1),
            Err(BackoffError::ZeroDelay { index: 1 })
        );
    }

    #[test]
    fn rejects_bad_jitter() {
        assert!(matches!(
            RetryBackoff::new(vec![1000], 1.5),
            Err(BackoffError::JitterOutOfRange { .. })
        ));
        assert!(matches!(
            RetryBackoff::new(vec![1000], -0.1),
            Err(BackoffError::JitterOutOfRange { .. })
        ));
        assert!(matches!(
            RetryBackoff::new(vec![1000], f64::NAN),
            Err(BackoffError::JitterOutOfRange { .. })
        ));
    }

    #[test]
    fn non_ascending_table_is_accepted() {
        assert!(RetryBackoff::new(vec![5000, 1000], 0.1).is_ok());
    }

    #[test]
    fn zero_jitter_returns_exact_base() {
        let policy = RetryBackoff::new(vec![1000, 2000], 0.0).unwrap();
        let env = MockEnv::new();

        assert_eq!(policy.delay_for(0, &env), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1, &env), Duration::from_millis(2000));
    }

    #[test]
    fn attempts_past_table_end_clamp_to_last_entry() {
        let policy = RetryBackoff::new(vec![1000, 2000], 0.0).unwrap();
        let env = MockEnv::new();

        assert_eq!(policy.delay_for(2, &env), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(500, &env), Duration::from_millis(2000));
    }

    #[test]
    fn prop_delay_stays_within_jitter_band() {
        let delays = vec![1000, 2000, 5000, 10_000, 20_000, 30_000];

        proptest!(|(attempt in 0u32..100, seed in any::<u64>())| {
            let policy = RetryBackoff::new(delays.clone(), 0.25).unwrap();
            let env = MockEnv::with_seed(seed);

            let index = (attempt as usize).min(delays.len() - 1);
            let base = delays[index];
            let delay = policy.delay_for(attempt, &env).as_millis() as u64;

            prop_assert!(delay >= base, "delay {delay} below base {base}");
            prop_assert!(
                delay < base + base / 4,
                "delay {delay} at or above jitter ceiling for base {base}"
            );
        });
    }

    #[test]
    fn first_attempt_band_with_quarter_jitter() {
        let policy =
            RetryBackoff::new(vec![1000, 2000, 5000, 10_000, 20_000, 30_000], 0.25).unwrap();

        for seed in 0..64 {
            let env = MockEnv::with_seed(seed);
            let delay = policy.delay_for(0, &env).as_millis();
            assert!((1000..1250).contains(&delay), "attempt 0 gave {delay}ms");
        }
    }

    #[test]
    fn clamped_attempt_band_with_quarter_jitter() {
        let policy =
            RetryBackoff::new(vec![1000, 2000, 5000, 10_000, 20_000, 30_000], 0.25).unwrap();

        for seed in 0..64 {
            let env = MockEnv::with_seed(seed);
            for attempt in [5, 50] {
                let delay = policy.delay_for(attempt, &env).as_millis();
                assert!((30_000..37_500).contains(&delay), "attempt {attempt} gave {delay}ms");
            }
        }
    }

    #[test]
    fn default_policy_matches_documented_table() {
        let policy = RetryBackoff::default();
        let env = MockEnv::new();

        assert_eq!(policy.len(), DEFAULT_RETRY_DELAYS_MS.len());
        // Smallest possible delay is the first table entry.
        assert!(policy.delay_for(0, &env) >= Duration::from_millis(DEFAULT_RETRY_DELAYS_MS[0]));
    }
}
