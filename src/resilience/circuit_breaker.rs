//! Circuit breaker for the SQL generator.
//!
//! Stops calling a failing generator until it is likely healthy again. State changes happen
//! under one mutex that is never held across an await, so exactly one HALF_OPEN trial call
//! is in flight at a time. The OPEN → HALF_OPEN transition is evaluated lazily on the next
//! call attempt; there is no background timer.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{QueryError, Result};

/// Default consecutive failures before the breaker opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time the breaker stays open before allowing a trial call
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: DEFAULT_FAILURE_THRESHOLD, cooldown: DEFAULT_COOLDOWN }
    }
}

/// Snapshot of the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub since_last_transition: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    last_transition: Instant,
    trial_in_flight: bool,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        if self.state != to {
            info!(from = %self.state, to = %to, "circuit breaker transition");
        }
        self.state = to;
        self.last_transition = Instant::now();
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

/// Admission ticket for one guarded call
///
/// Report the outcome with [`CallGuard::success`] or [`CallGuard::failure`]. A guard dropped
/// without an outcome (the call was cancelled) frees the HALF_OPEN trial slot without
/// counting as a failure.
#[derive(Debug)]
#[must_use = "report the call outcome with success() or failure()"]
pub struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallGuard<'_> {
    /// Whether this call is the single HALF_OPEN trial
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    /// Record a failed call
    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_abandon(self.trial);
        }
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                last_transition: Instant::now(),
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The critical sections never panic midway; a poisoned lock still holds valid state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask for admission of one call
    ///
    /// Fails with [`QueryError::CircuitOpen`] while open, and for every caller other than the
    /// single trial while half-open.
    pub fn try_acquire(&self) -> Result<CallGuard<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                if inner.last_transition.elapsed() < self.config.cooldown {
                    return Err(QueryError::CircuitOpen);
                }
                inner.transition(CircuitState::HalfOpen);
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(QueryError::CircuitOpen);
                }
                inner.trial_in_flight = true;
                true
            }
        };
        Ok(CallGuard { breaker: self, trial, settled: false })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.failures = 0;
                inner.transition(CircuitState::Closed);
            }
            CircuitState::Closed => inner.failures = 0,
            // Late outcome of a call admitted before the breaker tripped.
            _ => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                warn!("trial call failed, reopening circuit");
                inner.transition(CircuitState::Open);
            }
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_add(1);
                if inner.failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.failures,
                        threshold = self.config.failure_threshold,
                        cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "failure threshold reached, opening circuit"
                    );
                    inner.transition(CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn on_abandon(&self, trial: bool) {
        let mut inner = self.lock();
        if trial && inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    /// Stored state (an elapsed cooldown is only observed by the next call attempt)
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitBreakerState {
        let inner = self.lock();
        CircuitBreakerState {
            state: inner.state,
            failure_count: inner.failures,
            since_last_transition: inner.last_transition.elapsed(),
            failure_threshold: self.config.failure_threshold,
            cooldown: self.config.cooldown,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
