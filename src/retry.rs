//! Retry logic with exponential backoff
//!
//! A fetch is a bounded state machine: `ATTEMPT(n)` ends in success, in
//! `RETRY(n + 1)` while `n <= max_retries` and the error is transient, or in a
//! terminal failure. [`next_step`] is the transition function and
//! [`backoff_delay`] is a pure function of the attempt number, so both can be
//! tested without sleeping. [`run_with_retry`] drives the machine.
//!
//! # Example
//!
//! ```no_run
//! use harvest_dl::retry::{IsRetryable, RetryOutcome, run_with_retry};
//! use harvest_dl::config::RetryConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let outcome = run_with_retry(&config, &cancel, |_attempt| async {
//!     Ok::<_, MyError>(())
//! })
//! .await;
//! assert!(matches!(outcome, RetryOutcome::Success { .. }));
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::FetchError;
use crate::types::FailureKind;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, 5xx, connection resets, 429) return `true`.
/// Permanent failures (other 4xx, oversize, disallowed content) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// Server-provided delay hint that overrides the computed backoff
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout(_)
            | FetchError::Connection(_)
            | FetchError::ServerError { .. }
            | FetchError::RateLimited { .. } => true,
            FetchError::ClientError { .. }
            | FetchError::TooLarge { .. }
            | FetchError::DisallowedContent(_)
            | FetchError::InvalidUrl(_)
            | FetchError::Storage(_)
            | FetchError::Cancelled => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Transition out of a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    /// Wait `delay`, then run attempt `next_attempt`
    Retry {
        /// 1-based number of the next attempt
        next_attempt: u32,
        /// How long to wait first
        delay: Duration,
    },
    /// Stop retrying
    GiveUp(FailureKind),
}

/// Terminal result of [`run_with_retry`]
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// An attempt succeeded
    Success {
        /// Value returned by the successful attempt
        value: T,
        /// Attempts made, including the successful one
        attempts: u32,
    },
    /// All attempts failed, or the first permanent error was hit
    Failed {
        /// Error from the last attempt
        error: E,
        /// Attempts made
        attempts: u32,
        /// Permanent, or transient with retries exhausted
        kind: FailureKind,
    },
    /// Cancellation was observed while waiting to retry
    Cancelled {
        /// Error from the last attempt
        error: E,
        /// Attempts made
        attempts: u32,
    },
}

/// Backoff before the retry that follows failed attempt `attempt` (1-based)
///
/// `initial_delay * backoff_multiplier^(attempt - 1)`, capped at `max_delay`.
#[must_use]
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }
    Duration::from_secs_f64(secs)
}

/// Decide what happens after attempt `attempt` (1-based) failed with `error`
#[must_use]
pub fn next_step<E: IsRetryable>(config: &RetryConfig, attempt: u32, error: &E) -> RetryStep {
    if !error.is_retryable() {
        return RetryStep::GiveUp(FailureKind::Permanent);
    }
    if attempt > config.max_retries {
        return RetryStep::GiveUp(FailureKind::TransientExhausted);
    }
    let delay = match error.retry_after() {
        Some(hint) => hint.min(config.max_delay),
        None => backoff_delay(config, attempt),
    };
    RetryStep::Retry {
        next_attempt: attempt + 1,
        delay,
    }
}

/// Execute an async operation under the retry state machine
///
/// The operation receives the 1-based attempt number. Cancellation is only
/// observed between attempts, so an attempt in progress always completes.
pub async fn run_with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return RetryOutcome::Success {
                    value,
                    attempts: attempt,
                };
            }
            Err(e) => e,
        };

        match next_step(config, attempt, &error) {
            RetryStep::Retry {
                next_attempt,
                delay,
            } => {
                let delay = if config.jitter {
                    add_jitter(delay).min(config.max_delay)
                } else {
                    delay
                };

                tracing::warn!(
                    error = %error,
                    attempt,
                    max_attempts = config.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(attempts = attempt, "Retry abandoned due to cancellation");
                        return RetryOutcome::Cancelled { error, attempts: attempt };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt = next_attempt;
            }
            RetryStep::GiveUp(kind) => {
                match kind {
                    FailureKind::TransientExhausted => tracing::error!(
                        error = %error,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    ),
                    FailureKind::Permanent => tracing::error!(
                        error = %error,
                        "Operation failed with non-retryable error"
                    ),
                }
                return RetryOutcome::Failed {
                    error,
                    attempts: attempt,
                    kind,
                };
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// The jittered delay lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(10), "capped");
        assert_eq!(backoff_delay(&config, 500), Duration::from_secs(10));
    }

    #[test]
    fn permanent_errors_give_up_immediately() {
        let config = RetryConfig::default();
        let step = next_step(&config, 1, &FetchError::ClientError { status: 404 });
        assert_eq!(step, RetryStep::GiveUp(FailureKind::Permanent));

        let step = next_step(
            &config,
            1,
            &FetchError::TooLarge {
                limit: 1,
                size: 2,
            },
        );
        assert_eq!(step, RetryStep::GiveUp(FailureKind::Permanent));
    }

    #[test]
    fn transient_errors_retry_until_max_retries() {
        let config = RetryConfig::default();
        let err = FetchError::ServerError { status: 503 };

        for attempt in 1..=config.max_retries {
            assert!(
                matches!(next_step(&config, attempt, &err), RetryStep::Retry { next_attempt, .. } if next_attempt == attempt + 1),
                "attempt {attempt} should be retried"
            );
        }
        assert_eq!(
            next_step(&config, config.max_retries + 1, &err),
            RetryStep::GiveUp(FailureKind::TransientExhausted)
        );
    }

    #[test]
    fn retry_after_hint_overrides_backoff_but_is_capped() {
        let config = RetryConfig::default();
        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        };
        assert_eq!(
            next_step(&config, 1, &err),
            RetryStep::Retry {
                next_attempt: 2,
                delay: Duration::from_secs(7)
            }
        );

        let err = FetchError::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
        };
        assert_eq!(
            next_step(&config, 1, &err),
            RetryStep::Retry {
                next_attempt: 2,
                delay: config.max_delay
            }
        );

        let err = FetchError::RateLimited { retry_after: None };
        assert_eq!(
            next_step(&config, 2, &err),
            RetryStep::Retry {
                next_attempt: 3,
                delay: backoff_delay(&config, 2)
            }
        );
    }

    #[tokio::test]
    async fn always_transient_is_attempted_max_retries_plus_one_times() {
        let config = fast_config(3);
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let outcome = run_with_retry(&config, &cancel, |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FetchError::Timeout("slow".into()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match outcome {
            RetryOutcome::Failed { attempts, kind, .. } => {
                assert_eq!(attempts, 4);
                assert_eq!(kind, FailureKind::TransientExhausted);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let config = fast_config(3);
        let cancel = CancellationToken::new();

        let outcome = run_with_retry(&config, &cancel, |attempt| async move {
            if attempt < 3 {
                Err(FetchError::ServerError { status: 502 })
            } else {
                Ok(attempt)
            }
        })
        .await;

        match outcome {
            RetryOutcome::Success { value, attempts } => {
                assert_eq!(value, 3);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_error_is_attempted_once() {
        let config = fast_config(3);
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let outcome = run_with_retry(&config, &cancel, |_| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FetchError::ClientError { status: 403 })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome,
            RetryOutcome::Failed {
                attempts: 1,
                kind: FailureKind::Permanent,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_retrying_after_current_attempt() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.0,
            jitter: false,
        };
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let token = cancel.clone();
        let outcome = run_with_retry(&config, &cancel, |_| {
            let calls = calls.clone();
            let token = token.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                token.cancel();
                Err::<(), _>(FetchError::Connection("reset".into()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, RetryOutcome::Cancelled { attempts: 1, .. }));
    }

    #[test]
    fn jitter_stays_within_one_extra_delay() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let jittered = add_jitter(base);
            assert!(jittered >= base);
            assert!(jittered <= base * 2);
        }
    }
}
