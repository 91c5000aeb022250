//! Retry policy evaluation.
//!
//! Retries are data: the engine stores the attempt count and the next
//! eligible time on the step, and asks the policy what to do after each
//! failed attempt.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

/// Retry configuration for a step kind or a single activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt, in milliseconds.
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    /// Growth factor applied per attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound on any backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Error classes that fail the step immediately.
    #[serde(default)]
    pub non_retryable: BTreeSet<String>,

    /// Scale each backoff by a uniform factor in [0.5, 1.5).
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            non_retryable: BTreeSet::new(),
            jitter: false,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    1000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    300_000 // 5 minutes
}

/// Outcome of evaluating a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after the delay.
    Retry { delay: Duration },
    /// The error class is non-retryable.
    NonRetryable,
    /// All attempts are used up.
    Exhausted,
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Fixed-delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_attempts,
            base_backoff_ms: ms,
            multiplier: 1.0,
            max_backoff_ms: ms,
            ..Default::default()
        }
    }

    /// Mark an error class as non-retryable.
    pub fn with_non_retryable(mut self, class: impl Into<String>) -> Self {
        self.non_retryable.insert(class.into());
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Check the policy is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(KeelError::Config(
                "retry max_attempts must be at least 1".into(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(KeelError::Config(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(KeelError::Config(
                "retry base_backoff_ms exceeds max_backoff_ms".into(),
            ));
        }
        Ok(())
    }

    /// Deterministic backoff after the given (1-based) attempt:
    /// `min(base * multiplier^(attempt-1), cap)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let cap = self.max_backoff_ms as f64;
        let raw = self.base_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(raw.min(cap) as u64)
    }

    /// Backoff with jitter applied when enabled, still bounded by the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if !self.jitter {
            return backoff;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = backoff.as_millis() as f64 * factor;
        Duration::from_millis(jittered.min(self.max_backoff_ms as f64) as u64)
    }

    /// Whether an error class may be retried at all.
    pub fn is_retryable(&self, class: &str) -> bool {
        !self.non_retryable.contains(class)
    }

    /// Decide what to do after `attempts` committed attempts ended in an
    /// error of class `class`.
    pub fn evaluate(&self, attempts: u32, class: &str) -> RetryDecision {
        if !self.is_retryable(class) {
            RetryDecision::NonRetryable
        } else if attempts >= self.max_attempts {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.delay_for(attempts),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), policy.backoff(1));
    }

    #[test]
    fn test_max_backoff_cap() {
        let policy = RetryPolicy {
            max_backoff_ms: 10_000,
            ..Default::default()
        };
        assert_eq!(policy.backoff(10), Duration::from_secs(10));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let policies = [
            RetryPolicy::default(),
            RetryPolicy {
                base_backoff_ms: 7,
                multiplier: 1.3,
                max_backoff_ms: 5_000,
                ..Default::default()
            },
            RetryPolicy {
                base_backoff_ms: 250,
                multiplier: 10.0,
                max_backoff_ms: 60_000,
                ..Default::default()
            },
            RetryPolicy::fixed(5, Duration::from_millis(300)),
        ];

        for policy in &policies {
            let cap = Duration::from_millis(policy.max_backoff_ms);
            let mut previous = Duration::ZERO;
            for attempt in 1..=200 {
                let current = policy.backoff(attempt);
                assert!(current >= previous, "backoff decreased at attempt {}", attempt);
                assert!(current <= cap, "backoff exceeded cap at attempt {}", attempt);
                previous = current;
            }
        }
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy {
            base_backoff_ms: 1000,
            max_backoff_ms: 1200,
            ..Default::default()
        }
        .with_jitter(true);

        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_evaluate_decisions() {
        let policy = RetryPolicy::default().with_non_retryable("validation");

        assert_eq!(
            policy.evaluate(1, "network"),
            RetryDecision::Retry {
                delay: Duration::from_secs(1)
            }
        );
        assert_eq!(policy.evaluate(3, "network"), RetryDecision::Exhausted);
        assert_eq!(
            policy.evaluate(1, "validation"),
            RetryDecision::NonRetryable
        );
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            multiplier: 0.5,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_parse_policy() {
        let toml = r#"
            max_attempts = 5
            base_backoff_ms = 200
            non_retryable = ["validation", "card_declined"]
        "#;
        let policy: RetryPolicy = toml::from_str(toml).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.multiplier, 2.0);
        assert!(!policy.is_retryable("card_declined"));
    }
}
