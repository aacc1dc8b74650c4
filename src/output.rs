//! JSON Output Types
//!
//! This module defines the structured JSON output of the gateway.
//! Every request ends in exactly one [`QueryResponse`], whatever happened.
//!
//! # Output Contract
//! - Complete: `{"status": "COMPLETE", "sql_used": "...", "rows": [...], "row_count": 5,
//!   "truncated": false, "tokens_used": 120, "warnings": []}`
//! - Failed: `{"status": "FAILED", "sql_used": null, "rows": [], "row_count": 0,
//!   "truncated": false, "tokens_used": 0, "error": {"kind": "...", "message": "...",
//!   "stage": "...", "retriable": false}, "warnings": []}`
//!
//! `tokens_used` is always present (0 when the generator reported nothing), `error` only
//! on failure. Output is stable and suitable for programmatic parsing by agents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueryError;
use crate::validator::Verdict;

/// Terminal status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Complete,
    Failed,
}

/// Response to one `query` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: ResponseStatus,

    /// SQL that was executed (or last attempted), after row-cap rewriting
    pub sql_used: Option<String>,

    /// Rows as objects keyed by column name
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,

    #[serde(default)]
    pub row_count: usize,

    /// The row cap was reached
    #[serde(default)]
    pub truncated: bool,

    /// Generator token usage across every attempt of this request
    #[serde(default)]
    pub tokens_used: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Error information structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error kind (e.g., "ValidationRejected", "CircuitOpen")
    pub kind: String,

    /// Human-readable error message (agent-appropriate, no sensitive data)
    pub message: String,

    /// Pipeline stage that failed
    pub stage: String,

    /// Whether the same request may succeed later
    pub retriable: bool,
}

impl ErrorDetail {
    #[must_use]
    pub fn from_error(err: &QueryError, stage: impl Into<String>) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.message(),
            stage: stage.into(),
            retriable: err.is_retriable(),
        }
    }
}

impl QueryResponse {
    /// Create a successful response
    #[must_use]
    pub fn complete(
        sql_used: String,
        rows: Vec<Map<String, Value>>,
        truncated: bool,
        tokens_used: u64,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            status: ResponseStatus::Complete,
            sql_used: Some(sql_used),
            row_count: rows.len(),
            rows,
            truncated,
            tokens_used,
            error: None,
            warnings,
        }
    }

    /// Create a failed response
    #[must_use]
    pub fn failed(
        err: &QueryError,
        stage: impl Into<String>,
        sql_used: Option<String>,
        tokens_used: u64,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            status: ResponseStatus::Failed,
            sql_used,
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
            tokens_used,
            error: Some(ErrorDetail::from_error(err, stage)),
            warnings,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == ResponseStatus::Complete
    }
}

/// Output of `querygate check`: a verdict without execution
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub database: String,
    pub engine: String,
    pub verdict: Verdict,
}
