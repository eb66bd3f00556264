//! Bounded retry with linear backoff for protection-critical gateway calls.
//!
//! | Retried | Not retried |
//! |---------|-------------|
//! | Connection errors | Order rejected |
//! | Timeouts | Order not found |
//! | Rate limiting | Insufficient margin |
//! | Unknown errors | |
//!
//! # Example
//!
//! ```rust,ignore
//! use position_engine::gateway::RetryPolicy;
//!
//! let policy = RetryPolicy::default(); // 3 attempts, 500ms, 1000ms between them
//! let id = policy.run("place_stop", || gateway.place_order(req.clone())).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::GatewayError;

/// Error categories for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient failure.
    Retryable,
    /// Permanent failure.
    NonRetryable,
    /// Rate limited; retried with the same schedule.
    RateLimited,
}

/// Retry policy for protection-critical gateway calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff step; the n-th retry waits `n * step` (default: 500ms).
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    /// Cap on a single wait (default: 5s).
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Jitter factor for randomization (default: 0.0).
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_step_ms: default_backoff_step_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_factor: 0.0,
        }
    }
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_backoff_step_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    5_000
}

impl RetryPolicy {
    /// Policy with no waiting between attempts.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_step_ms: 0,
            max_backoff_ms: 0,
            jitter_factor: 0.0,
        }
    }

    /// Single attempt, no retries.
    #[must_use]
    pub const fn none() -> Self {
        Self::immediate(1)
    }

    /// Backoff schedule for this policy.
    #[must_use]
    pub fn backoff(&self) -> LinearBackoff {
        LinearBackoff::new(self)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut backoff = self.backoff();
        loop {
            let attempt = backoff.current_attempt() + 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.category() == ErrorCategory::NonRetryable => {
                    tracing::warn!(operation, attempt, error = %e, "Gateway call failed permanently");
                    return Err(e);
                }
                Err(e) => match backoff.next_backoff() {
                    Some(delay) => {
                        tracing::warn!(
                            operation,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Gateway call failed, retrying"
                        );
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    None => {
                        tracing::error!(operation, attempts = attempt, error = %e, "Gateway retries exhausted");
                        return Err(e);
                    }
                },
            }
        }
    }
}

/// Linear backoff with optional jitter.
#[derive(Debug)]
pub struct LinearBackoff {
    current_attempt: u32,
    max_retries: u32,
    step_ms: u64,
    max_backoff_ms: u64,
    jitter_factor: f64,
}

impl LinearBackoff {
    /// Create a backoff schedule from a retry policy.
    #[must_use]
    pub const fn new(policy: &RetryPolicy) -> Self {
        Self {
            current_attempt: 0,
            max_retries: policy.max_attempts.saturating_sub(1),
            step_ms: policy.backoff_step_ms,
            max_backoff_ms: policy.max_backoff_ms,
            jitter_factor: policy.jitter_factor,
        }
    }

    /// Delay before the next retry, or `None` when retries are exhausted.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_retries {
            return None;
        }
        self.current_attempt += 1;

        let base_ms = self
            .step_ms
            .saturating_mul(u64::from(self.current_attempt))
            .min(self.max_backoff_ms);
        Some(Duration::from_millis(self.apply_jitter(base_ms)))
    }

    fn apply_jitter(&self, backoff_ms: u64) -> u64 {
        if self.jitter_factor <= 0.0 || backoff_ms == 0 {
            return backoff_ms;
        }
        let mut rng = rand::rng();
        let jitter_range = backoff_ms as f64 * self.jitter_factor;
        let min = (backoff_ms as f64 - jitter_range).max(0.0);
        let max = backoff_ms as f64 + jitter_range;
        rng.random_range(min..=max) as u64
    }

    /// Retries consumed so far.
    #[must_use]
    pub const fn current_attempt(&self) -> u32 {
        self.current_attempt
    }

    /// Whether another retry is available.
    #[must_use]
    pub const fn has_remaining_attempts(&self) -> bool {
        self.current_attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_policy_is_three_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_step_ms, 500);
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 4,
            backoff_step_ms: 200,
            max_backoff_ms: 10_000,
            jitter_factor: 0.0,
        };
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(600)));
        assert_eq!(backoff.next_backoff(), None);
        assert!(!backoff.has_remaining_attempts());
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff_step_ms: 1_000,
            max_backoff_ms: 1_500,
            jitter_factor: 0.0,
        };
        let mut backoff = policy.backoff();
        backoff.next_backoff();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff_step_ms: 1_000,
            max_backoff_ms: 10_000,
            jitter_factor: 0.2,
        };
        let delay = policy.backoff().next_backoff().unwrap().as_millis();
        assert!((800..=1200).contains(&delay));
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::immediate(3)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GatewayError::Timeout)
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::RateLimited)
            })
            .await;
        assert_eq!(result, Err(GatewayError::RateLimited));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::immediate(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GatewayError::InsufficientMargin)
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
