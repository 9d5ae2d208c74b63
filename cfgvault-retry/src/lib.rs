//! Bounded retry for cfgvault capture attempts
//!
//! Retries are an explicit loop over attempt numbers. Whether a failure may be
//! retried is decided solely by [`RetryableError::is_transient`] on the returned
//! error. A retry is never itself retried: the loop runs at most twice, whatever
//! the policy asks for.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::future::BoxFuture;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Hard ceiling on configurable retries. A failed retry is final.
pub const MAX_ALLOWED_RETRIES: u32 = 1;

/// Policy construction errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RetryError {
    #[error("max_retries {requested} exceeds the allowed ceiling of {ceiling}")]
    TooManyRetries { requested: u32, ceiling: u32 },
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// How many times to retry and how long to wait between attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Build a policy, rejecting retry counts above [`MAX_ALLOWED_RETRIES`].
    pub fn new(max_retries: u32, delay: Duration) -> Result<Self, RetryError> {
        if max_retries > MAX_ALLOWED_RETRIES {
            return Err(RetryError::TooManyRetries {
                requested: max_retries,
                ceiling: MAX_ALLOWED_RETRIES,
            });
        }
        Ok(Self { max_retries, delay })
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.delay)
            .with_randomization_factor(0.0)
            .with_multiplier(2.0)
            .with_max_interval(self.delay.saturating_mul(4))
            .with_max_elapsed_time(None)
            .build()
    }
}

impl Default for RetryPolicy {
    /// One retry, no delay.
    fn default() -> Self {
        Self {
            max_retries: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Result of a bounded run: the final result plus how many attempts were made
#[derive(Debug)]
pub struct BoundedOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl<T, E> BoundedOutcome<T, E> {
    /// Retries consumed, i.e. attempts beyond the first.
    pub fn retries_used(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `f` for attempt numbers `0..=policy.max_retries()` (never past
/// [`MAX_ALLOWED_RETRIES`]), stopping at the first success or at the first
/// permanent error.
///
/// `f` receives the zero-based attempt number. Each call must be a fresh,
/// independent try; nothing is carried between calls by this function.
pub async fn run_bounded<'a, F, T, E>(
    op_name: &str,
    policy: &RetryPolicy,
    mut f: F,
) -> BoundedOutcome<T, E>
where
    F: FnMut(u32) -> BoxFuture<'a, Result<T, E>>,
    E: RetryableError + Display,
{
    let mut backoff = policy.backoff();
    let last_attempt = policy.max_retries.min(MAX_ALLOWED_RETRIES);
    let mut attempt: u32 = 0;

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        match f(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        op_name,
                        attempt + 1
                    );
                }
                return BoundedOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                };
            }
            Err(err) if err.is_permanent() => {
                warn!(
                    "Operation '{}' failed permanently on attempt {}: {}",
                    op_name, attempt, err
                );
                return BoundedOutcome {
                    result: Err(err),
                    attempts: attempt + 1,
                };
            }
            Err(err) => {
                if attempt >= last_attempt {
                    warn!(
                        "Operation '{}' failed on attempt {}, retries exhausted: {}",
                        op_name, attempt, err
                    );
                    return BoundedOutcome {
                        result: Err(err),
                        attempts: attempt + 1,
                    };
                }

                warn!(
                    "Operation '{}' failed on attempt {}, retrying: {}",
                    op_name, attempt, err
                );
                attempt += 1;

                let wait = backoff.next_backoff().unwrap_or(policy.delay);
                if !wait.is_zero() {
                    #[cfg(feature = "async-rt")]
                    tokio::time::sleep(wait).await;

                    #[cfg(not(feature = "async-rt"))]
                    std::thread::sleep(wait);
                }
            }
        }
    }
}
