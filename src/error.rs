//! Error Handling Infrastructure
//!
//! This module defines the error taxonomy of the query pipeline.
//! All errors are structured and map to stable error kinds for JSON output.
//!
//! # Error Categories
//! - `RateLimitExceeded`: no permit became available within the acquisition timeout
//! - `CircuitOpen`: the generator circuit breaker is refusing calls
//! - `GenerationFailed`: the SQL generator failed after bounded retries
//! - `ValidationRejected`: the policy engine rejected the candidate SQL
//! - `UnknownDatabase`: the request named a database that is not configured
//! - `ExecutionError`: the database rejected the statement or retries were exhausted
//! - `ResultValidationFailed`: the result failed sanity checks after bounded regeneration
//! - `InvalidRequest`: malformed input
//! - `ConfigError`: invalid settings (startup only)
//!
//! Transient database failures never appear here: they are `DbError`s absorbed by the
//! retry policy and only surface wrapped in [`ExecutionFailure::RetriesExhausted`].

use thiserror::Error;

use crate::resilience::PermitCategory;
use crate::validator::ViolationKind;

/// Main error type for pipeline operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// No permit of the given category could be acquired in time
    #[error("Rate limit exceeded: no {category} permit available within {waited_ms}ms")]
    RateLimitExceeded { category: PermitCategory, waited_ms: u64 },

    /// The generator circuit breaker is open
    #[error("Circuit open: SQL generation is temporarily unavailable")]
    CircuitOpen,

    /// SQL generation failed
    #[error("SQL generation failed: {0}")]
    GenerationFailed(String),

    /// Candidate SQL violated the security policy
    #[error("Validation rejected ({kind}): {detail}")]
    ValidationRejected { kind: ViolationKind, detail: String },

    /// Requested database is not configured
    #[error("Unknown database '{name}'. Available databases: {available:?}")]
    UnknownDatabase { name: String, available: Vec<String> },

    /// Statement execution failed
    #[error("Execution failed: {0}")]
    ExecutionError(ExecutionFailure),

    /// Returned result failed validation
    #[error("Result validation failed: {0}")]
    ResultValidationFailed(String),

    /// Invalid input or missing required parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error (file not found, invalid JSON, invalid policy, etc.)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Terminal execution failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionFailure {
    /// Non-transient database error, detail already sanitized
    #[error("{0}")]
    NonTransient(String),

    /// Transient failures persisted past the retry budget
    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl QueryError {
    /// Stable error kind for JSON output
    ///
    /// Kinds are stable and suitable for programmatic handling by agents.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "RateLimitExceeded",
            Self::CircuitOpen => "CircuitOpen",
            Self::GenerationFailed(_) => "GenerationFailed",
            Self::ValidationRejected { .. } => "ValidationRejected",
            Self::UnknownDatabase { .. } => "UnknownDatabase",
            Self::ExecutionError(_) => "ExecutionError",
            Self::ResultValidationFailed(_) => "ResultValidationFailed",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::ConfigError(_) => "ConfigError",
        }
    }

    /// Whether the caller may retry the same request later
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(self, Self::RateLimitExceeded { .. } | Self::CircuitOpen)
    }

    /// Get human-readable error message (agent-appropriate, no credentials)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Create a generation failure
    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self::GenerationFailed(message.into())
    }

    /// Create a validation rejection
    pub fn validation_rejected(kind: ViolationKind, detail: impl Into<String>) -> Self {
        Self::ValidationRejected { kind, detail: detail.into() }
    }

    /// Create a non-transient execution error
    pub fn non_transient(detail: impl Into<String>) -> Self {
        Self::ExecutionError(ExecutionFailure::NonTransient(detail.into()))
    }

    /// Create a retries-exhausted execution error
    pub fn retries_exhausted(attempts: u32, last_error: impl Into<String>) -> Self {
        Self::ExecutionError(ExecutionFailure::RetriesExhausted {
            attempts,
            last_error: last_error.into(),
        })
    }

    /// Create a result validation failure
    pub fn result_validation_failed(message: impl Into<String>) -> Self {
        Self::ResultValidationFailed(message.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let limited =
            QueryError::RateLimitExceeded { category: PermitCategory::Query, waited_ms: 10 };
        assert_eq!(limited.kind(), "RateLimitExceeded");
        assert_eq!(QueryError::CircuitOpen.kind(), "CircuitOpen");
        assert_eq!(QueryError::generation_failed("x").kind(), "GenerationFailed");
        assert_eq!(
            QueryError::validation_rejected(ViolationKind::BlockedTable, "x").kind(),
            "ValidationRejected"
        );
        assert_eq!(QueryError::non_transient("x").kind(), "ExecutionError");
        assert_eq!(QueryError::retries_exhausted(4, "x").kind(), "ExecutionError");
        assert_eq!(QueryError::result_validation_failed("x").kind(), "ResultValidationFailed");
        assert_eq!(QueryError::invalid_request("x").kind(), "InvalidRequest");
        assert_eq!(QueryError::config_error("x").kind(), "ConfigError");
    }

    #[test]
    fn test_retriable_errors() {
        assert!(QueryError::CircuitOpen.is_retriable());
        assert!(QueryError::RateLimitExceeded { category: PermitCategory::Generator, waited_ms: 1 }
            .is_retriable());
        assert!(!QueryError::generation_failed("x").is_retriable());
        assert!(!QueryError::retries_exhausted(4, "deadlock").is_retriable());
    }

    #[test]
    fn test_error_messages() {
        let err = QueryError::validation_rejected(ViolationKind::BlockedTable, "table 'secrets'");
        assert!(err.message().contains("BlockedTable"));
        assert!(err.message().contains("secrets"));

        let err = QueryError::retries_exhausted(4, "connection reset");
        assert!(err.message().contains("retries exhausted after 4 attempts"));
        assert!(err.message().contains("connection reset"));

        let err = QueryError::UnknownDatabase {
            name: "analytics".to_string(),
            available: vec!["default".to_string()],
        };
        assert!(err.message().contains("analytics"));
        assert!(err.message().contains("default"));
    }
}
