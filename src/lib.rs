//! querygate - Natural-Language Query Gateway
//!
//! querygate answers natural-language questions against relational databases for AI agents.
//! An external generator turns the question into SQL; every candidate is parsed and gated by
//! a structural policy engine before it touches a database, and the run is wrapped in rate
//! limiting, circuit breaking and retries.
//!
//! # Core Principles
//! - Agent-first, machine-only interface (JSON-only output, one response per request)
//! - Nothing executes without a validation verdict
//! - Least privilege by default (read-only transactions, row caps, time limits)
//! - Structural validation on the SQL AST, never on text
//!
//! # Module Organization
//! - [`error`] - Error taxonomy with stable kinds
//! - [`output`] - JSON response contract
//! - [`policy`] - Security policy resolution
//! - [`validator`] - SQL policy engine
//! - [`engine`] - Connection pools and sessions per database engine
//! - [`resilience`] - Rate limiter, circuit breaker, retry policy
//! - [`executor`] - Validated SQL execution
//! - [`router`] - Database name resolution
//! - [`generator`] - SQL generator interface and HTTP client
//! - [`result_validator`] - Result sanity checks
//! - [`telemetry`] - Stage spans and metrics
//! - [`orchestrator`] - The request pipeline
//! - [`config`] - Configuration file loading
//! - [`mcp`] - MCP server exposing the `query` tool

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod generator;
pub mod mcp;
pub mod orchestrator;
pub mod output;
pub mod policy;
pub mod resilience;
pub mod result_validator;
pub mod router;
pub mod telemetry;
pub mod validator;

// Re-export commonly used types for convenience
pub use config::Settings;
pub use engine::{ConnectionConfig, ConnectionPool, DatabaseType, DbError, DbErrorKind, Session};
pub use error::{ExecutionFailure, QueryError, Result};
pub use generator::{GeneratedSql, GenerationRequest, GeneratorError, HttpGenerator, SqlGenerator};
pub use orchestrator::{OrchestratorConfig, QueryOrchestrator, QueryRequest};
pub use output::{ErrorDetail, QueryResponse, ResponseStatus};
pub use policy::{PolicySettings, SecurityPolicy};
pub use resilience::{CircuitBreaker, RateLimiter, RetryPolicy};
pub use router::DatabaseRouter;
pub use telemetry::Telemetry;
pub use validator::{SqlValidator, Verdict, ViolationKind};
