//! Bounded retry with a fixed delay.
//!
//! Used for store writes and for buffer appends. `max_retries` counts the
//! retries after the first attempt, so an operation is tried at most
//! `max_retries + 1` times.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Total attempts allowed.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// How a retried operation ended.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded on attempt `attempts`.
    Succeeded {
        /// Returned value.
        value: T,
        /// Attempts used, starting at 1.
        attempts: u32,
    },
    /// Every allowed attempt failed, or the error was not retryable.
    Failed {
        /// Last error seen.
        error: E,
        /// Attempts used.
        attempts: u32,
    },
    /// Cancellation arrived while waiting to retry.
    Cancelled {
        /// Last error seen.
        error: E,
        /// Attempts used.
        attempts: u32,
    },
}

/// Run `op` under `policy`.
///
/// `retryable` decides whether an error is worth another attempt. Waits
/// between attempts end early on cancellation; an attempt that has already
/// started always runs to completion.
pub async fn retry_with<T, E, F, Fut>(
    policy: RetryPolicy,
    cancel: &CancellationToken,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                };
            }
            Err(error) => {
                if attempt >= policy.max_attempts() || !retryable(&error) {
                    return RetryOutcome::Failed {
                        error,
                        attempts: attempt,
                    };
                }

                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts(),
                    delay_ms = policy.delay.as_millis(),
                    error = %error,
                    "Attempt failed, retrying"
                );

                tokio::select! {
                    () = cancel.cancelled() => {
                        return RetryOutcome::Cancelled { error, attempts: attempt };
                    }
                    () = tokio::time::sleep(policy.delay) => {}
                }

                attempt += 1;
            }
        }
    }
}
