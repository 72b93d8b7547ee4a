//! Bounded retries with exponential backoff and jitter.
//!
//! The retried operation is passed explicitly to [`RetryPolicy::run`]; the
//! policy itself is a plain value so one configuration can drive every
//! persist worker.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Parameters for [`RetryPolicy::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` means no retry.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Upper bound of the uniform random delay added to every backoff.
    pub jitter_max: Duration,
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },

    /// Cancellation fired before the first attempt (`last` is `None`), while
    /// an attempt that then failed was running, or during a backoff sleep.
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, last: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, jitter_max: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter_max,
        }
    }

    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Deterministic part of the delay after failed attempt `attempt`
    /// (1-based): `base_delay * 2^(attempt-1)`, saturating.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Backoff plus a uniform random jitter in `[0, jitter_max]`.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        self.backoff(attempt).saturating_add(self.jitter())
    }

    fn jitter(&self) -> Duration {
        let max = u64::try_from(self.jitter_max.as_nanos()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(rand::rng().random_range(0..=max))
    }

    /// Run `action` until it succeeds, attempts run out, or `cancel` fires
    /// during a backoff sleep.
    ///
    /// `action` receives the 1-based attempt number. On success returns the
    /// value together with the number of attempts used. Delays between
    /// attempts never shrink: each one is at least `backoff(attempt)` and at
    /// least the previous delay.
    ///
    /// A call already in progress is never interrupted; cancellation is
    /// observed before the first attempt, after every failed attempt, and
    /// while sleeping.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut action: F,
    ) -> std::result::Result<(T, u32), RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled {
                attempts: 0,
                last: None,
            });
        }

        let max_attempts = self.max_attempts.max(1);
        let mut previous_delay = Duration::ZERO;
        let mut attempt = 1;

        loop {
            let err = match action(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(err) => err,
            };

            // A failure seen after cancellation is a cancellation, even on
            // the last attempt.
            if cancel.is_cancelled() {
                debug!(tag = "retry", attempt, "attempt failed after cancellation");
                return Err(RetryError::Cancelled {
                    attempts: attempt,
                    last: Some(err),
                });
            }

            if attempt >= max_attempts {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.delay_with_jitter(attempt).max(previous_delay);
            previous_delay = delay;
            warn!(
                tag = "retry",
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "attempt failed, backing off"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(tag = "retry", attempt, "backoff interrupted by cancellation");
                    return Err(RetryError::Cancelled {
                        attempts: attempt,
                        last: Some(err),
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
