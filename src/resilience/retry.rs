//! Bounded exponential backoff for transient failures.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Default number of retries after the first attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default delay multiplier between retries
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Upper bound on any single backoff delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Classifies an error as worth retrying
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// Passed to each attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl RetryContext {
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// Terminal outcome of a retried operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Non-transient error, surfaced immediately
    Fatal(E),
    /// Transient errors persisted through every attempt
    Exhausted { attempts: u32, last: E },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal(e) => write!(f, "{e}"),
            Self::Exhausted { attempts, last } => {
                write!(f, "retries exhausted after {attempts} attempts: {last}")
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl RetryPolicy {
    /// Total attempts, including the first
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay slept before retry number `retry` (1-based)
    ///
    /// `retry_delay * backoff_factor^(retry - 1)`, capped at five minutes.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.retry_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= MAX_RETRY_DELAY.as_secs_f64() {
            return MAX_RETRY_DELAY;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run `op` until it succeeds, fails non-transiently, or exhausts the budget
    ///
    /// Returns the value together with the context of the attempt that produced it.
    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        mut op: F,
    ) -> std::result::Result<(T, RetryContext), RetryError<E>>
    where
        F: FnMut(RetryContext) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 1;

        loop {
            let ctx = RetryContext { attempt, max_attempts };
            match op(ctx).await {
                Ok(value) => return Ok((value, ctx)),
                Err(e) if !e.is_transient() => return Err(RetryError::Fatal(e)),
                Err(e) if ctx.is_last() => {
                    warn!(operation, attempts = attempt, error = %e, "retries exhausted");
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.delay_for_retry(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
