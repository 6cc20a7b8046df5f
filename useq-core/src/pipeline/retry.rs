use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use chrono::{DateTime, Utc};

use super::config::RetryConfig;
use crate::types::ids::RunId;

/// What to do with a run after a transient stage failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once `not_before` has passed.
    Retry {
        attempt: u16,
        delay_ms: u64,
        not_before: DateTime<Utc>,
    },
    /// Attempts exhausted.
    Exhausted { attempts: u16 },
}

/// Exponential backoff with deterministic jitter keyed on run and attempt.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// `failed_attempts` counts the failure just observed.
    pub fn decide(
        &self,
        run_id: &RunId,
        failed_attempts: u16,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if failed_attempts >= self.config.max_attempts {
            return RetryDecision::Exhausted {
                attempts: failed_attempts,
            };
        }
        let delay_ms = self.compute_delay_ms(run_id, failed_attempts);
        let not_before = now
            + chrono::Duration::milliseconds(
                i64::try_from(delay_ms).unwrap_or(i64::MAX),
            );
        RetryDecision::Retry {
            attempt: failed_attempts,
            delay_ms,
            not_before,
        }
    }

    pub fn compute_delay_ms(&self, run_id: &RunId, attempt: u16) -> u64 {
        let anchor = self.base_delay_ms(attempt);
        self.jittered_delay_for_anchor(anchor, run_id, attempt)
    }

    fn base_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 {
            return 0;
        }

        let exp = (attempt.saturating_sub(1)) as i32;
        let scaled = (self.config.backoff_base_ms as f64) * 2f64.powi(exp);
        let capped = scaled.min(self.config.backoff_max_ms as f64);
        capped.max(0.0) as u64
    }

    fn jittered_delay_for_anchor(
        &self,
        anchor_ms: u64,
        run_id: &RunId,
        attempt: u16,
    ) -> u64 {
        if anchor_ms == 0 {
            return 0;
        }

        let jitter_ratio = f64::from(self.config.jitter_ratio.max(0.0));
        let jitter_span = ((anchor_ms as f64) * jitter_ratio)
            .max(self.config.jitter_min_ms as f64)
            .min(self.config.backoff_max_ms as f64);

        let lower = 0f64.max(anchor_ms as f64 - jitter_span);
        let upper =
            (anchor_ms as f64 + jitter_span).min(self.config.backoff_max_ms as f64);
        if upper <= lower {
            return lower.round() as u64;
        }

        let unit = deterministic_unit(run_id, attempt);
        let jittered = lower + (upper - lower) * unit;
        jittered.round() as u64
    }
}

fn deterministic_unit(run_id: &RunId, attempt: u16) -> f64 {
    let mut hasher = DefaultHasher::default();
    run_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let bits = hasher.finish();
    (bits as f64) / (u64::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            backoff_base_ms: 60_000,
            backoff_max_ms: 3_600_000,
            jitter_ratio: 0.1,
            jitter_min_ms: 1_000,
        })
    }

    #[test]
    fn delays_grow_exponentially_within_jitter() {
        let policy = policy();
        let run = RunId::new("R1").unwrap();
        let first = policy.compute_delay_ms(&run, 1);
        let second = policy.compute_delay_ms(&run, 2);
        assert!((54_000..=66_000).contains(&first), "first={first}");
        assert!((108_000..=132_000).contains(&second), "second={second}");
    }

    #[test]
    fn jitter_is_deterministic() {
        let policy = policy();
        let run = RunId::new("R1").unwrap();
        assert_eq!(
            policy.compute_delay_ms(&run, 2),
            policy.compute_delay_ms(&run, 2)
        );
    }

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = policy();
        let run = RunId::new("R1").unwrap();
        assert!(policy.compute_delay_ms(&run, 30) <= 3_600_000);
    }

    #[test]
    fn exhaustion_after_max_attempts() {
        let policy = policy();
        let run = RunId::new("R1").unwrap();
        let now = Utc::now();
        assert!(matches!(
            policy.decide(&run, 2, now),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert_eq!(
            policy.decide(&run, 3, now),
            RetryDecision::Exhausted { attempts: 3 }
        );
    }
}
