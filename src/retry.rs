// src/retry.rs

//! # Retry Policy
//!
//! Exponential backoff with jitter as a plain value, so the schedule can be tested
//! without running the operation it guards. [`retry_with_backoff`] drives any
//! fallible async operation under a policy and a cancellation token.

use crate::config::RetryConfig;
use futures::Future;
use rand::{thread_rng, Rng};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Fraction of the delay that may be added or removed at random, in [0, 1].
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy for transaction resubmission. The first submission is not counted,
    /// so the total number of attempts is one more than the retry budget.
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_retry_attempts + 1,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            backoff_factor: cfg.backoff_factor,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            jitter: cfg.jitter,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// Deterministic part of the delay before retry number `retry` (1-based).
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay before retry number `retry`, jittered and capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 && nominal > 0.0 {
            let range = nominal * jitter;
            nominal + thread_rng().gen_range(-range..=range)
        } else {
            nominal
        };
        let capped = jittered.clamp(0.0, self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether another attempt is allowed after `attempts_made` attempts.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum RetryError<E> {
    #[error("operation cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("non-retryable error: {0}")]
    Permanent(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled { .. } => None,
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Permanent(e) => Some(e),
        }
    }
}

/// Runs `op` until it succeeds, `is_retryable` rejects an error, the policy runs
/// out of attempts, or `cancel` fires.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    is_retryable: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
            result = op(attempt) => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) => {
                debug!(attempt, error = %e, "Operation failed with a non-retryable error");
                return Err(RetryError::Permanent(e));
            }
            Err(e) if !policy.allows(attempt) => {
                warn!(attempt, error = %e, "Retry budget exhausted");
                return Err(RetryError::Exhausted { attempts: attempt, last: e });
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                debug!(
                    attempt,
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "Operation failed, retrying with backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(500),
            jitter: 0.0,
        }
    }

    #[test]
    fn nominal_delay_grows_geometrically_and_is_capped() {
        let p = policy();
        assert_eq!(p.nominal_delay(1), Duration::from_millis(100));
        assert_eq!(p.nominal_delay(2), Duration::from_millis(200));
        assert_eq!(p.nominal_delay(3), Duration::from_millis(400));
        assert_eq!(p.nominal_delay(4), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_band_and_cap() {
        let p = RetryPolicy {
            jitter: 0.5,
            ..policy()
        };
        for _ in 0..200 {
            let d = p.delay_for(2).as_millis();
            assert!((100..=300).contains(&d), "delay {d} outside jitter band");
            assert!(p.delay_for(10) <= p.max_delay);
        }
    }

    #[test]
    fn from_config_counts_the_initial_submission() {
        let cfg = RetryConfig::default();
        let p = RetryPolicy::from_config(&cfg);
        assert_eq!(p.max_attempts, cfg.max_retry_attempts + 1);
        assert!(p.allows(cfg.max_retry_attempts));
        assert!(!p.allows(cfg.max_retry_attempts + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let c = calls.clone();
        let result: Result<u32, RetryError<String>> =
            retry_with_backoff(&policy(), &cancel, |_| true, move |attempt| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(format!("attempt {attempt} failed"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts() {
        let cancel = CancellationToken::new();
        let result: Result<(), RetryError<String>> =
            retry_with_backoff(&policy(), &cancel, |_| true, |_| async {
                Err("down".to_string())
            })
            .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 4, .. })));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), RetryError<String>> = retry_with_backoff(
            &policy(),
            &cancel,
            |e: &String| e != "fatal",
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), RetryError<String>> =
            retry_with_backoff(&policy(), &cancel, |_| true, |_| async { Ok(()) }).await;
        assert_eq!(result, Err(RetryError::Cancelled { attempts: 0 }));
    }
}
