//! Per-category concurrency caps.
//!
//! Each category is an independent counting semaphore. Acquisition waits (FIFO) until a
//! permit frees or the acquisition timeout elapses. The returned [`Permit`] releases its
//! slot when dropped, so release happens exactly once on success, failure, or cancellation.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{QueryError, Result};

/// Default number of concurrent statement executions
pub const DEFAULT_QUERY_PERMITS: usize = 10;

/// Default number of concurrent generator calls
pub const DEFAULT_GENERATOR_PERMITS: usize = 5;

/// Default time a caller waits for a permit
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Permit category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermitCategory {
    /// Database statement execution
    Query,
    /// Calls to the SQL generator
    Generator,
}

impl PermitCategory {
    /// Get the category name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Generator => "generator",
        }
    }
}

impl fmt::Display for PermitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacities and acquisition timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub query_permits: usize,
    pub generator_permits: usize,
    pub acquire_timeout: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            query_permits: DEFAULT_QUERY_PERMITS,
            generator_permits: DEFAULT_GENERATOR_PERMITS,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }
}

/// Point-in-time view of one category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterState {
    pub category: PermitCategory,
    pub capacity: usize,
    pub available: usize,
    pub waiting: usize,
}

#[derive(Debug)]
struct Lane {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    waiting: AtomicUsize,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(capacity)), capacity, waiting: AtomicUsize::new(0) }
    }
}

/// Decrements the waiter count even if the acquiring future is dropped
struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scoped permit; the slot is returned when this value is dropped
#[derive(Debug)]
#[must_use = "dropping a permit releases it immediately"]
pub struct Permit {
    category: PermitCategory,
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    /// Category this permit was taken from
    #[must_use]
    pub const fn category(&self) -> PermitCategory {
        self.category
    }
}

/// Two independent concurrency caps
#[derive(Debug)]
pub struct RateLimiter {
    query: Lane,
    generator: Lane,
    acquire_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter with the given capacities
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            query: Lane::new(config.query_permits),
            generator: Lane::new(config.generator_permits),
            acquire_timeout: config.acquire_timeout,
        }
    }

    const fn lane(&self, category: PermitCategory) -> &Lane {
        match category {
            PermitCategory::Query => &self.query,
            PermitCategory::Generator => &self.generator,
        }
    }

    /// Acquire a permit, waiting at most the configured acquisition timeout
    pub async fn acquire(&self, category: PermitCategory) -> Result<Permit> {
        self.acquire_within(category, self.acquire_timeout).await
    }

    /// Acquire a permit, waiting at most `timeout`
    pub async fn acquire_within(&self, category: PermitCategory, timeout: Duration) -> Result<Permit> {
        let lane = self.lane(category);
        let started = Instant::now();

        lane.waiting.fetch_add(1, Ordering::SeqCst);
        let _waiting = WaitingGuard(&lane.waiting);

        let exceeded = || QueryError::RateLimitExceeded {
            category,
            waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        match tokio::time::timeout(timeout, lane.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => {
                debug!(category = %category, waited_ms = started.elapsed().as_millis() as u64, "permit acquired");
                Ok(Permit { category, _permit: permit })
            }
            // The semaphores are never closed; treat it like an exhausted lane.
            Ok(Err(_)) | Err(_) => Err(exceeded()),
        }
    }

    /// Snapshot of a category
    #[must_use]
    pub fn state(&self, category: PermitCategory) -> RateLimiterState {
        let lane = self.lane(category);
        RateLimiterState {
            category,
            capacity: lane.capacity,
            available: lane.semaphore.available_permits(),
            waiting: lane.waiting.load(Ordering::SeqCst),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
