//! Configuration Management
//!
//! This module loads the gateway settings from a single JSON file.
//!
//! # Configuration Location
//! Resolution precedence:
//! 1. Explicit `--config` path (highest priority)
//! 2. `QUERYGATE_CONFIG` environment variable
//! 3. `<config_dir>/querygate/config.json` (e.g. `~/.config/querygate/config.json`)
//!
//! # Named Databases
//! Databases are stored as named entries (e.g., "default", "analytics").
//! Requests reference a database by name; absent names resolve to `default_database`.
//! Each entry may override any field of the global `security` policy.
//!
//! Every field has a default. Settings are validated once, at startup.
//!
//! Example:
//! ```json
//! {
//!   "default_database": "main",
//!   "databases": {
//!     "main": {
//!       "engine": "postgres",
//!       "host": "localhost",
//!       "port": 5432,
//!       "user": "gateway",
//!       "password_env": "MAIN_DB_PASSWORD",
//!       "database": "shop",
//!       "policy": { "blocked_columns": ["users.ssn"] }
//!     }
//!   },
//!   "security": { "max_rows": 500, "blocked_tables": ["secrets"] },
//!   "generator": { "endpoint": "http://localhost:8080/generate" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::ConnectionConfig;
use crate::error::{QueryError, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::policy::{PolicySettings, SecurityPolicy};
use crate::resilience::{
    rate_limiter, retry, CircuitBreakerConfig, RateLimiterConfig, RetryPolicy,
};

/// Environment variable naming the settings file
pub const CONFIG_ENV: &str = "QUERYGATE_CONFIG";

/// Gateway settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Database used when a request names none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_database: Option<String>,

    /// Named databases
    pub databases: BTreeMap<String, DatabaseSettings>,

    /// Global security policy; databases may override individual fields
    pub security: PolicySettings,

    pub rate_limits: RateLimitSettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub orchestrator: OrchestratorConfig,
    pub generator: GeneratorSettings,
}

/// One configured database
///
/// Like `ConnectionConfig` but supports an environment variable reference
/// for the password and per-database policy overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// Connection configuration
    #[serde(flatten)]
    pub connection: ConnectionConfig,

    /// Environment variable name for password (if not storing password directly)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Policy fields overriding the global `security` section
    #[serde(default)]
    pub policy: PolicySettings,
}

impl DatabaseSettings {
    /// Resolve environment variables and return a `ConnectionConfig`
    pub fn resolve(&self) -> Result<ConnectionConfig> {
        let mut config = self.connection.clone();

        if let Some(env_var) = &self.password_env {
            match std::env::var(env_var) {
                Ok(password) => config.password = Some(password),
                Err(_) => {
                    return Err(QueryError::config_error(format!(
                        "Environment variable {env_var} not found for password"
                    )));
                }
            }
        }

        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Concurrent statement executions
    pub query: usize,
    /// Concurrent generator calls
    pub generator: usize,
    pub acquire_timeout_secs: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            query: rate_limiter::DEFAULT_QUERY_PERMITS,
            generator: rate_limiter::DEFAULT_GENERATOR_PERMITS,
            acquire_timeout_secs: rate_limiter::DEFAULT_ACQUIRE_TIMEOUT.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: f64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            cooldown_secs: defaults.cooldown.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub retry_delay_secs: f64,
    pub backoff_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: retry::DEFAULT_MAX_RETRIES,
            retry_delay_secs: retry::DEFAULT_RETRY_DELAY.as_secs_f64(),
            backoff_factor: retry::DEFAULT_BACKOFF_FACTOR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// HTTP endpoint receiving generation requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub timeout_secs: f64,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self { endpoint: None, timeout_secs: 30.0 }
    }
}

fn seconds(field: &str, secs: f64) -> Result<Duration> {
    match Duration::try_from_secs_f64(secs) {
        Ok(d) if !d.is_zero() => Ok(d),
        _ => Err(QueryError::config_error(format!("{field} must be a positive number of seconds"))),
    }
}

/// Get path to the default settings file (`<config_dir>/querygate/config.json`)
pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| QueryError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("querygate").join("config.json"))
}

/// Resolve the settings path by precedence
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => default_config_path(),
    }
}

impl Settings {
    /// Load and validate settings from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            QueryError::config_error(format!("Could not read config file {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }

    /// Parse and validate settings from a JSON string
    pub fn from_json(contents: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(contents)
            .map_err(|e| QueryError::config_error(format!("Invalid config file format: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every cross-field constraint once
    pub fn validate(&self) -> Result<()> {
        if self.databases.is_empty() {
            return Err(QueryError::config_error("No databases configured"));
        }
        self.default_database_name()?;

        if self.rate_limits.query == 0 || self.rate_limits.generator == 0 {
            return Err(QueryError::config_error("Rate limit capacities must be at least 1"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(QueryError::config_error("circuit_breaker.failure_threshold must be at least 1"));
        }
        if !(self.retry.backoff_factor.is_finite() && self.retry.backoff_factor >= 1.0) {
            return Err(QueryError::config_error("retry.backoff_factor must be at least 1.0"));
        }
        if !(self.retry.retry_delay_secs.is_finite() && self.retry.retry_delay_secs >= 0.0) {
            return Err(QueryError::config_error("retry.retry_delay_secs must not be negative"));
        }
        self.rate_limiter_config()?;
        self.circuit_breaker_config()?;
        seconds("generator.timeout_secs", self.generator.timeout_secs)?;

        let global = self.security_policy()?;
        for (name, database) in &self.databases {
            global.with_overrides(&database.policy).map_err(|e| match e {
                QueryError::ConfigError(detail) => {
                    QueryError::config_error(format!("Database '{name}': {detail}"))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Name of the database used when a request names none
    ///
    /// With a single database configured, it is the default.
    pub fn default_database_name(&self) -> Result<&str> {
        match &self.default_database {
            Some(name) if self.databases.contains_key(name) => Ok(name),
            Some(name) => Err(QueryError::config_error(format!(
                "default_database '{name}' is not configured. Available databases: {:?}",
                self.databases.keys().collect::<Vec<_>>()
            ))),
            None if self.databases.len() == 1 => {
                Ok(self.databases.keys().next().map_or("", String::as_str))
            }
            None => Err(QueryError::config_error(
                "default_database must be set when several databases are configured",
            )),
        }
    }

    /// Global policy
    pub fn security_policy(&self) -> Result<SecurityPolicy> {
        SecurityPolicy::build(&self.security)
    }

    pub fn rate_limiter_config(&self) -> Result<RateLimiterConfig> {
        Ok(RateLimiterConfig {
            query_permits: self.rate_limits.query,
            generator_permits: self.rate_limits.generator,
            acquire_timeout: seconds("rate_limits.acquire_timeout_secs", self.rate_limits.acquire_timeout_secs)?,
        })
    }

    pub fn circuit_breaker_config(&self) -> Result<CircuitBreakerConfig> {
        Ok(CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            cooldown: seconds("circuit_breaker.cooldown_secs", self.circuit_breaker.cooldown_secs)?,
        })
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            retry_delay: Duration::try_from_secs_f64(self.retry.retry_delay_secs).unwrap_or_default(),
            backoff_factor: self.retry.backoff_factor,
        }
    }

    pub fn generator_timeout(&self) -> Result<Duration> {
        seconds("generator.timeout_secs", self.generator.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DatabaseType;
    use pretty_assertions::assert_eq;

    const SQLITE_ONLY: &str = r#"{ "databases": { "local": { "engine": "sqlite", "file": "/tmp/app.db" } } }"#;

    #[test]
    fn test_defaults_apply() {
        let settings = Settings::from_json(SQLITE_ONLY).unwrap();

        assert_eq!(settings.default_database_name().unwrap(), "local");
        let limits = settings.rate_limiter_config().unwrap();
        assert_eq!(limits.query_permits, 10);
        assert_eq!(limits.generator_permits, 5);
        assert_eq!(limits.acquire_timeout, Duration::from_secs(30));

        let breaker = settings.circuit_breaker_config().unwrap();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.cooldown, Duration::from_secs(60));

        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.orchestrator, OrchestratorConfig::default());
        assert_eq!(settings.security_policy().unwrap(), SecurityPolicy::default());
    }

    #[test]
    fn test_full_settings() {
        let json = r#"{
            "default_database": "main",
            "databases": {
                "main": {
                    "engine": "postgres",
                    "host": "localhost",
                    "port": 5432,
                    "user": "gateway",
                    "password": "pw",
                    "database": "shop",
                    "pool_size": 4,
                    "policy": { "blocked_columns": ["users.ssn"] }
                },
                "local": { "engine": "sqlite", "file": "/tmp/app.db" }
            },
            "security": { "max_rows": 500, "blocked_tables": ["secrets"] },
            "rate_limits": { "query": 2, "generator": 1, "acquire_timeout_secs": 0.5 },
            "circuit_breaker": { "failure_threshold": 3, "cooldown_secs": 10 },
            "retry": { "max_retries": 1, "retry_delay_secs": 0.25, "backoff_factor": 3.0 },
            "orchestrator": { "generation_retries": 0, "regenerate_on_violation": false },
            "generator": { "endpoint": "http://localhost:8080/generate", "timeout_secs": 5 }
        }"#;
        let settings = Settings::from_json(json).unwrap();

        let main = &settings.databases["main"];
        assert_eq!(main.connection.engine, DatabaseType::Postgres);
        assert_eq!(main.connection.pool_size, 4);
        assert_eq!(main.policy.blocked_columns, Some(vec!["users.ssn".to_string()]));
        assert_eq!(settings.databases["local"].connection.pool_size, crate::engine::DEFAULT_POOL_SIZE);

        assert_eq!(settings.rate_limiter_config().unwrap().acquire_timeout, Duration::from_millis(500));
        assert_eq!(settings.retry_policy().retry_delay, Duration::from_millis(250));
        assert_eq!(settings.orchestrator.generation_retries, 0);
        assert!(!settings.orchestrator.regenerate_on_violation);
        assert_eq!(settings.orchestrator.result_regenerations, 1);
        assert_eq!(settings.generator_timeout().unwrap(), Duration::from_secs(5));
        assert_eq!(settings.security_policy().unwrap().max_rows, 500);
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            (r#"{}"#, "No databases configured"),
            (
                r#"{ "default_database": "nope", "databases": { "local": { "engine": "sqlite", "file": "a.db" } } }"#,
                "default_database 'nope' is not configured",
            ),
            (
                r#"{ "databases": { "a": { "engine": "sqlite", "file": "a.db" }, "b": { "engine": "sqlite", "file": "b.db" } } }"#,
                "default_database must be set",
            ),
            (
                r#"{ "databases": { "a": { "engine": "sqlite", "file": "a.db" } }, "rate_limits": { "query": 0 } }"#,
                "Rate limit capacities",
            ),
            (
                r#"{ "databases": { "a": { "engine": "sqlite", "file": "a.db" } }, "retry": { "backoff_factor": 0.5 } }"#,
                "backoff_factor",
            ),
            (
                r#"{ "databases": { "a": { "engine": "sqlite", "file": "a.db" } }, "circuit_breaker": { "cooldown_secs": -1 } }"#,
                "cooldown_secs",
            ),
            (
                r#"{ "databases": { "a": { "engine": "sqlite", "file": "a.db", "policy": { "max_rows": 0 } } } }"#,
                "Database 'a'",
            ),
        ];

        for (json, expected) in cases {
            let err = Settings::from_json(json).unwrap_err();
            assert_eq!(err.kind(), "ConfigError");
            assert!(err.message().contains(expected), "{json}: {}", err.message());
        }
    }

    #[test]
    fn test_unknown_policy_field_rejected() {
        let json = r#"{ "databases": { "a": { "engine": "sqlite", "file": "a.db" } }, "security": { "max_row": 5 } }"#;
        let err = Settings::from_json(json).unwrap_err();
        assert!(err.message().contains("Invalid config file format"));
    }

    #[test]
    fn test_database_resolve_env_var() {
        std::env::set_var("QUERYGATE_TEST_PASSWORD", "secret");

        let database = DatabaseSettings {
            connection: ConnectionConfig {
                password: None,
                ..ConnectionConfig::postgres(
                    "localhost".to_string(),
                    5432,
                    "user".to_string(),
                    String::new(),
                    "db".to_string(),
                )
            },
            password_env: Some("QUERYGATE_TEST_PASSWORD".to_string()),
            policy: PolicySettings::default(),
        };

        let resolved = database.resolve().unwrap();
        assert_eq!(resolved.password, Some("secret".to_string()));

        std::env::remove_var("QUERYGATE_TEST_PASSWORD");
    }

    #[test]
    fn test_database_resolve_missing_env_var() {
        let database = DatabaseSettings {
            connection: ConnectionConfig::sqlite(PathBuf::from("a.db")),
            password_env: Some("QUERYGATE_NONEXISTENT_VAR".to_string()),
            policy: PolicySettings::default(),
        };

        let err = database.resolve().unwrap_err();
        assert!(err.message().contains("Environment variable QUERYGATE_NONEXISTENT_VAR not found"));
    }

    #[test]
    fn test_explicit_path_wins() {
        let explicit = Path::new("/etc/querygate.json");
        assert_eq!(resolve_config_path(Some(explicit)).unwrap(), explicit.to_path_buf());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Settings::load(Path::new("/nonexistent/querygate/config.json")).unwrap_err();
        assert!(err.message().contains("Could not read config file"));
    }

    #[test]
    fn test_password_not_serialized() {
        let json = r#"{ "databases": { "main": { "engine": "mysql", "host": "h", "user": "u", "password": "hunter2", "database": "d" } } }"#;
        let settings = Settings::from_json(json).unwrap();
        let out = serde_json::to_string(&settings).unwrap();
        assert!(!out.contains("hunter2"));
    }
}
