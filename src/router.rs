//! Database Router
//!
//! Resolves the database a request names (or the default) to its long-lived target.
//! Targets are built once at startup and never mutated; the router only hands out
//! shared references.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Settings;
use crate::engine::{open_pool, ConnectionPool, DatabaseType, SchemaContext};
use crate::error::{QueryError, Result};
use crate::executor::SqlExecutor;
use crate::policy::SecurityPolicy;
use crate::resilience::RetryPolicy;
use crate::validator::SqlValidator;

/// Everything needed to serve requests against one database
#[derive(Debug)]
pub struct DatabaseTarget {
    pub name: String,
    pub engine: DatabaseType,
    /// Effective policy: the global policy with this database's overrides applied
    pub policy: Arc<SecurityPolicy>,
    pub validator: SqlValidator,
    pub executor: SqlExecutor,
    /// Schema description for the generator, blocked tables and columns removed
    pub schema: SchemaContext,
}

impl DatabaseTarget {
    pub fn new(
        name: impl Into<String>,
        pool: Arc<dyn ConnectionPool>,
        policy: SecurityPolicy,
        retry: RetryPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        let engine = pool.engine();
        let policy = Arc::new(policy);
        let validator = SqlValidator::new(policy.clone(), engine);
        let executor = SqlExecutor::new(pool, validator.clone(), retry, acquire_timeout);
        Self {
            name: name.into(),
            engine,
            policy,
            validator,
            executor,
            schema: SchemaContext::default(),
        }
    }

    #[must_use]
    pub fn with_schema(mut self, schema: SchemaContext) -> Self {
        self.schema = schema.filtered(&self.policy);
        self
    }
}

/// Immutable name → target map
#[derive(Debug, Clone)]
pub struct DatabaseRouter {
    targets: Arc<HashMap<String, Arc<DatabaseTarget>>>,
    default: String,
}

impl DatabaseRouter {
    /// Build a router; `default` must name one of the targets
    pub fn new(targets: Vec<DatabaseTarget>, default: &str) -> Result<Self> {
        let mut map = HashMap::with_capacity(targets.len());
        for target in targets {
            let name = target.name.clone();
            if map.insert(name.clone(), Arc::new(target)).is_some() {
                return Err(QueryError::config_error(format!("Database '{name}' configured twice")));
            }
        }
        if !map.contains_key(default) {
            return Err(QueryError::config_error(format!(
                "Default database '{default}' is not configured"
            )));
        }
        Ok(Self { targets: Arc::new(map), default: default.to_string() })
    }

    /// Open every configured database and describe its schema
    ///
    /// A database whose schema cannot be described still serves requests, with an empty
    /// schema context.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let global = settings.security_policy()?;
        let retry = settings.retry_policy();
        let acquire_timeout = settings.rate_limiter_config()?.acquire_timeout;

        let mut targets = Vec::with_capacity(settings.databases.len());
        for (name, database) in &settings.databases {
            let config = database.resolve()?;
            let policy = global.with_overrides(&database.policy)?;
            let pool = open_pool(&config, &policy).await.map_err(|e| {
                QueryError::config_error(format!("Database '{name}': {}", e.sanitized()))
            })?;

            let schema = match pool.describe_schema().await {
                Ok(schema) => schema,
                Err(e) => {
                    warn!(database = %name, error = %e.sanitized(), "schema description failed");
                    SchemaContext::default()
                }
            };

            let target = DatabaseTarget::new(name.clone(), pool, policy, retry, acquire_timeout)
                .with_schema(schema);
            info!(
                database = %name,
                engine = %target.engine,
                tables = target.schema.tables.len(),
                "database ready"
            );
            targets.push(target);
        }

        Self::new(targets, settings.default_database_name()?)
    }

    /// Resolve a database name, `None` meaning the default
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<DatabaseTarget>> {
        let name = name.filter(|n| !n.is_empty()).unwrap_or(&self.default);
        self.targets.get(name).cloned().ok_or_else(|| QueryError::UnknownDatabase {
            name: name.to_string(),
            available: self.names(),
        })
    }

    /// Configured names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.keys().cloned().collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn default_name(&self) -> &str {
        &self.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use crate::engine::{DbError, DbErrorKind, DbResult, Session};

    #[derive(Debug)]
    struct UnreachablePool(DatabaseType);

    #[async_trait]
    impl ConnectionPool for UnreachablePool {
        fn engine(&self) -> DatabaseType {
            self.0
        }

        async fn acquire(&self, _timeout: Duration) -> DbResult<Box<dyn Session>> {
            Err(DbError::new(DbErrorKind::Connection, "unreachable"))
        }

        async fn describe_schema(&self) -> DbResult<SchemaContext> {
            Ok(SchemaContext::default())
        }
    }

    fn target(name: &str, engine: DatabaseType) -> DatabaseTarget {
        DatabaseTarget::new(
            name,
            Arc::new(UnreachablePool(engine)),
            SecurityPolicy::default(),
            RetryPolicy::default(),
            Duration::from_secs(1),
        )
    }

    fn router() -> DatabaseRouter {
        DatabaseRouter::new(
            vec![target("main", DatabaseType::Postgres), target("analytics", DatabaseType::MySQL)],
            "main",
        )
        .unwrap()
    }

    #[test]
    fn test_resolve_default_and_named() {
        let router = router();
        assert_eq!(router.resolve(None).unwrap().name, "main");
        assert_eq!(router.resolve(Some("")).unwrap().name, "main");

        let analytics = router.resolve(Some("analytics")).unwrap();
        assert_eq!(analytics.engine, DatabaseType::MySQL);
    }

    #[test]
    fn test_resolve_returns_shared_target() {
        let router = router();
        let a = router.resolve(Some("main")).unwrap();
        let b = router.resolve(None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unknown_database_lists_names() {
        let err = router().resolve(Some("warehouse")).unwrap_err();
        assert_eq!(
            err,
            QueryError::UnknownDatabase {
                name: "warehouse".to_string(),
                available: vec!["analytics".to_string(), "main".to_string()],
            }
        );
    }

    #[test]
    fn test_invalid_router() {
        let err = DatabaseRouter::new(vec![target("main", DatabaseType::SQLite)], "other").unwrap_err();
        assert_eq!(err.kind(), "ConfigError");

        let err = DatabaseRouter::new(
            vec![target("main", DatabaseType::SQLite), target("main", DatabaseType::SQLite)],
            "main",
        )
        .unwrap_err();
        assert!(err.message().contains("configured twice"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_from_settings_filters_schema() {
        let path = std::env::temp_dir().join(format!("querygate_router_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE users (id INTEGER, name TEXT, ssn TEXT);
                 CREATE TABLE secrets (id INTEGER, value TEXT);",
            )
            .unwrap();
        }

        let json = serde_json::json!({
            "databases": {
                "local": {
                    "engine": "sqlite",
                    "file": path,
                    "policy": { "blocked_tables": ["secrets"], "blocked_columns": ["users.ssn"] }
                }
            }
        });
        let settings = Settings::from_json(&json.to_string()).unwrap();
        let router = DatabaseRouter::from_settings(&settings).await.unwrap();

        let local = router.resolve(None).unwrap();
        assert_eq!(local.engine, DatabaseType::SQLite);
        assert_eq!(local.schema.render(), "users(id INTEGER, name TEXT)");

        let _ = std::fs::remove_file(&path);
    }
}
