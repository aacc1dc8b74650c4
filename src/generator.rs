//! SQL Generator Interface
//!
//! The natural-language-to-SQL model lives outside this crate. The pipeline talks to it
//! through [`SqlGenerator`]; [`HttpGenerator`] is the stock implementation, POSTing a
//! [`GenerationRequest`] as JSON to a configured endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::DatabaseType;
use crate::error::{QueryError, Result};

/// Input sent to the generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub natural_language: String,
    /// Rendered schema of the target database
    pub schema_context: String,
    /// Target engine, so the generator can pick the SQL dialect
    pub engine: DatabaseType,
    /// Reasons the previous attempt was rejected, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prior_violations: Vec<String>,
}

/// Model details reported by the generator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Candidate SQL returned by the generator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedSql {
    pub sql: String,
    #[serde(default)]
    pub model_metadata: ModelMetadata,
    #[serde(default)]
    pub tokens_used: u64,
    /// Generation attempt that produced this SQL (1-based), set by the caller
    #[serde(skip)]
    pub attempt: u32,
}

/// Generator failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("generator unreachable: {0}")]
    Transport(String),

    #[error("generator returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("generator response invalid: {0}")]
    InvalidResponse(String),

    #[error("generator returned no SQL")]
    Empty,
}

/// Produces candidate SQL from natural language
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> std::result::Result<GeneratedSql, GeneratorError>;
}

/// Longest response body quoted in an error
const MAX_BODY_DETAIL: usize = 200;

/// Generator reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: reqwest::Url,
}

impl HttpGenerator {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| QueryError::config_error(format!("Invalid generator endpoint '{endpoint}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("querygate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| QueryError::config_error(format!("Could not build HTTP client: {e}")))?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl SqlGenerator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> std::result::Result<GeneratedSql, GeneratorError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| GeneratorError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GeneratorError::Status {
                status: status.as_u16(),
                body: body.chars().take(MAX_BODY_DETAIL).collect(),
            });
        }

        let generated: GeneratedSql = response
            .json()
            .await
            .map_err(|e| GeneratorError::InvalidResponse(e.to_string()))?;
        if generated.sql.trim().is_empty() {
            return Err(GeneratorError::Empty);
        }
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = GenerationRequest {
            natural_language: "top 5 users".to_string(),
            schema_context: "users(id integer)".to_string(),
            engine: DatabaseType::Postgres,
            prior_violations: vec![],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({
                "natural_language": "top 5 users",
                "schema_context": "users(id integer)",
                "engine": "postgres"
            })
        );

        let retry = GenerationRequest {
            prior_violations: vec!["BlockedTable: table 'secrets' is blocked".to_string()],
            ..request
        };
        let value = serde_json::to_value(&retry).unwrap();
        assert_eq!(value["prior_violations"][0], "BlockedTable: table 'secrets' is blocked");
    }

    #[test]
    fn test_response_defaults() {
        let generated: GeneratedSql = serde_json::from_value(json!({ "sql": "SELECT 1" })).unwrap();
        assert_eq!(generated.tokens_used, 0);
        assert_eq!(generated.model_metadata, ModelMetadata::default());
        assert_eq!(generated.attempt, 0);

        let generated: GeneratedSql = serde_json::from_value(json!({
            "sql": "SELECT 1",
            "model_metadata": { "model": "sql-coder" },
            "tokens_used": 42
        }))
        .unwrap();
        assert_eq!(generated.tokens_used, 42);
        assert_eq!(generated.model_metadata.model.as_deref(), Some("sql-coder"));
    }

    #[test]
    fn test_invalid_endpoint() {
        let err = HttpGenerator::new("not a url", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.kind(), "ConfigError");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        // Port 9 (discard) on localhost is closed in test environments.
        let generator = HttpGenerator::new("http://127.0.0.1:9/generate", Duration::from_secs(2)).unwrap();
        let request = GenerationRequest {
            natural_language: "anything".to_string(),
            schema_context: String::new(),
            engine: DatabaseType::SQLite,
            prior_violations: vec![],
        };
        let err = generator.generate(&request).await.unwrap_err();
        assert!(matches!(err, GeneratorError::Transport(_)));
    }
}
