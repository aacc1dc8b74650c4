//! Resilience Primitives
//!
//! Independently constructible, stateful guards composed by the orchestrator:
//! - [`RateLimiter`] - two independent concurrency caps (query execution, generator calls)
//! - [`CircuitBreaker`] - fail-fast guard around the SQL generator
//! - [`RetryPolicy`] - bounded exponential backoff around transient database errors
//!
//! None of them wrap the pipeline implicitly. Each is unit-tested through failure
//! injection in isolation.

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CallGuard, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitState,
};
pub use rate_limiter::{Permit, PermitCategory, RateLimiter, RateLimiterConfig, RateLimiterState};
pub use retry::{RetryContext, RetryError, RetryPolicy, Transient};
