//! Per-part retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransferError;
use crate::error::ClassifiedError;

/// Why a part gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    /// Pause or cancel interrupted the part. Not a failure.
    Aborted,
    /// A non-retryable error stopped the part early.
    Fatal {
        part_index: usize,
        attempts: u32,
        error: ClassifiedError,
    },
    /// Every attempt failed with a retryable error.
    Exhausted {
        part_index: usize,
        attempts: u32,
        last_error: ClassifiedError,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Aborted => 0,
            RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn error(&self) -> ClassifiedError {
        match self {
            RetryError::Aborted => ClassifiedError::Aborted,
            RetryError::Fatal { error, .. } => error.clone(),
            RetryError::Exhausted { last_error, .. } => last_error.clone(),
        }
    }
}

impl From<RetryError> for TransferError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Aborted => TransferError::Aborted,
            RetryError::Fatal {
                part_index,
                attempts,
                error,
            } => TransferError::PartFailed {
                part_index,
                attempts,
                error,
            },
            RetryError::Exhausted {
                part_index,
                attempts,
                last_error,
            } => TransferError::RetryExhausted {
                part_index,
                attempts,
                last_error,
            },
        }
    }
}

/// Bounded retry with exponential backoff.
///
/// Attempt `n` (1-based) that fails retryably waits
/// `base * 2^(n-1)` plus jitter drawn from `[0, min(max_jitter, delay/10))`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_jitter: Duration::from_secs(1),
        }
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before the attempt after `attempt`, without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    /// Upper bound (exclusive) of the jitter added to `delay`.
    pub fn jitter_bound(&self, delay: Duration) -> Duration {
        self.max_jitter.min(delay / 10)
    }

    /// Backoff with jitter applied.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        let bound_ms = self.jitter_bound(delay).as_millis() as u64;
        let jitter_ms = if bound_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..bound_ms)
        };
        delay + Duration::from_millis(jitter_ms)
    }

    /// Runs `attempt_fn` until it succeeds, fails fatally, runs out of
    /// attempts, or `cancel` fires.
    ///
    /// Returns the value and the number of attempts it took.
    pub async fn execute<T, F, Fut>(
        &self,
        part_index: usize,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<(T, u32), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Aborted);
            }
            attempt += 1;

            let error = match attempt_fn().await {
                Ok(value) => return Ok((value, attempt)),
                Err(ClassifiedError::Aborted) => return Err(RetryError::Aborted),
                Err(e) => e,
            };

            if !error.is_retryable() {
                debug!(part = part_index, attempt, error = %error, "part failed permanently");
                return Err(RetryError::Fatal {
                    part_index,
                    attempts: attempt,
                    error,
                });
            }
            if attempt >= self.max_attempts {
                warn!(
                    part = part_index,
                    attempts = attempt,
                    error = %error,
                    "part retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    part_index,
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.backoff(attempt);
            warn!(
                part = part_index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "part attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RetryError::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
