//! Database Engine Traits and Core Types
//!
//! This module defines the seam between the pipeline and the databases.
//! Each engine (`PostgreSQL`, `MySQL`, `SQLite`) provides a [`ConnectionPool`] handing out
//! scoped [`Session`]s.
//!
//! # Session Discipline
//! A session runs one [`StatementPlan`] at a time inside its own transaction
//! (read-only unless the policy allows writes), with the search path and role pinned
//! first. Releasing a session is dropping it. Dropping a session, or the future of an
//! in-flight `run`, cancels the statement at the connection level.
//!
//! # Engine Isolation
//! Each engine implementation is completely independent.
//! No shared SQL helpers or cross-engine abstractions beyond these traits.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::SecurityPolicy;
use crate::resilience::Transient;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

/// Default number of pooled connections per database
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Longest database error detail surfaced to callers
const MAX_ERROR_DETAIL: usize = 240;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// `PostgreSQL` database
    Postgres,
    /// `MySQL` database (includes `MariaDB`)
    MySQL,
    /// `SQLite` database
    SQLite,
}

impl DatabaseType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Connection configuration for database engines
///
/// This struct contains all parameters needed to open a pool.
/// Fields are engine-specific (e.g., `file` only applies to `SQLite`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database engine type
    pub engine: DatabaseType,

    /// Hostname (for postgres/mysql)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// Port number (for postgres/mysql)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Username (for postgres/mysql)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password (for postgres/mysql)
    /// WARNING: Sensitive data, do not log or include in error messages
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Database name (for postgres/mysql)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Database file path (for sqlite)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Maximum pooled connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

const fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl ConnectionConfig {
    /// Create a new `PostgreSQL` connection config
    #[must_use]
    pub const fn postgres(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: DatabaseType::Postgres,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            database: Some(database),
            file: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Create a new `MySQL` connection config
    #[must_use]
    pub const fn mysql(
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    ) -> Self {
        Self {
            engine: DatabaseType::MySQL,
            host: Some(host),
            port: Some(port),
            user: Some(user),
            password: Some(password),
            database: Some(database),
            file: None,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Create a new `SQLite` connection config
    #[must_use]
    pub const fn sqlite(file: PathBuf) -> Self {
        Self {
            engine: DatabaseType::SQLite,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            file: Some(file),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

/// Failure category of a database operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DbErrorKind {
    /// Connection refused, reset or lost
    Connection,
    /// Statement or acquisition timed out
    Timeout,
    Deadlock,
    Serialization,
    /// Too many connections, server shutting down or starting up
    Unavailable,
    Syntax,
    Permission,
    Constraint,
    /// Invalid configuration for this engine
    Config,
    Other,
}

impl DbErrorKind {
    /// Whether a retry is likely to succeed
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Deadlock | Self::Serialization | Self::Unavailable
        )
    }
}

/// Error raised by an engine adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DbError {
    pub kind: DbErrorKind,
    /// Engine error code (SQLSTATE, MySQL error number, SQLite result code)
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self { kind, code: None, message: message.into() }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Statement exceeded its execution time limit
    #[must_use]
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            DbErrorKind::Timeout,
            format!("statement exceeded execution time limit of {}ms", limit.as_millis()),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Config, message)
    }

    /// Detail safe to surface: first line only, bounded length, error code kept
    #[must_use]
    pub fn sanitized(&self) -> String {
        let first_line = self.message.lines().next().unwrap_or_default().trim();
        let mut detail: String = first_line.chars().take(MAX_ERROR_DETAIL).collect();
        if first_line.chars().count() > MAX_ERROR_DETAIL {
            detail.push_str("...");
        }
        match &self.code {
            Some(code) => format!("[{code}] {detail}"),
            None => detail,
        }
    }
}

impl Transient for DbError {
    fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Result type alias for engine operations
pub type DbResult<T> = std::result::Result<T, DbError>;

/// One statement to run in a fresh transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementPlan {
    pub sql: String,
    /// Open the transaction READ ONLY
    pub read_only: bool,
    /// Schemas pinned on the session, in order (engines without schemas ignore it)
    pub search_path: Vec<String>,
    /// Role assumed for the transaction
    pub role: Option<String>,
    /// Server-side statement timeout
    pub timeout: Duration,
    /// Stop fetching after this many rows
    pub max_rows: usize,
}

/// Result column descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
}

/// Rows fetched by one statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// The row cap stopped the fetch
    pub truncated: bool,
}

/// Schema description fed to the SQL generator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContext {
    pub tables: Vec<TableInfo>,
}

/// Table information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Table name
    pub name: String,

    /// Schema name (for engines that support schemas)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Table columns
    pub columns: Vec<ColumnInfo>,
}

/// Column information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,

    /// Column data type (engine-specific)
    pub data_type: String,

    /// Whether column allows NULL values
    pub nullable: bool,
}

impl SchemaContext {
    /// Drop blocked tables and blocked columns
    #[must_use]
    pub fn filtered(mut self, policy: &SecurityPolicy) -> Self {
        self.tables.retain(|t| !policy.is_table_blocked(&t.name));
        for table in &mut self.tables {
            let name = table.name.clone();
            table.columns.retain(|c| !policy.is_column_blocked(&name, &c.name));
        }
        self
    }

    /// Compact text rendering, one table per line
    #[must_use]
    pub fn render(&self) -> String {
        self.tables
            .iter()
            .map(|table| {
                let columns = table
                    .columns
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.data_type))
                    .collect::<Vec<_>>()
                    .join(", ");
                match &table.schema {
                    Some(schema) => format!("{schema}.{}({columns})", table.name),
                    None => format!("{}({columns})", table.name),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A pool of connections to one database
#[async_trait]
pub trait ConnectionPool: Send + Sync + fmt::Debug {
    fn engine(&self) -> DatabaseType;

    /// Check out a session, waiting at most `timeout`
    async fn acquire(&self, timeout: Duration) -> DbResult<Box<dyn Session>>;

    /// Describe tables and columns visible to the configured user
    async fn describe_schema(&self) -> DbResult<SchemaContext>;
}

/// A checked-out connection; dropping it returns the connection to its pool
#[async_trait]
pub trait Session: Send {
    /// Run one statement inside its own transaction
    async fn run(&mut self, plan: &StatementPlan) -> DbResult<RowSet>;
}

/// Open a pool for a configured database
pub async fn open_pool(
    config: &ConnectionConfig,
    policy: &SecurityPolicy,
) -> DbResult<std::sync::Arc<dyn ConnectionPool>> {
    match config.engine {
        #[cfg(feature = "postgres")]
        DatabaseType::Postgres => Ok(std::sync::Arc::new(postgres::PostgresPool::new(config)?)),
        #[cfg(feature = "mysql")]
        DatabaseType::MySQL => Ok(std::sync::Arc::new(mysql::MySqlPool::new(config)?)),
        #[cfg(feature = "sqlite")]
        DatabaseType::SQLite => {
            Ok(std::sync::Arc::new(sqlite::SqlitePool::new(config, !policy.allow_write)?))
        }
        #[allow(unreachable_patterns)]
        other => {
            let _ = policy;
            Err(DbError::config(format!("engine '{other}' is not enabled in this build")))
        }
    }
}

/// Convert a float to JSON, mapping NaN/Infinity to null
pub(crate) fn float_to_json(value: f64) -> serde_json::Value {
    serde_json::Number::from_f64(value).map_or(serde_json::Value::Null, serde_json::Value::Number)
}

/// Encode binary data as Base64 for JSON safety
pub(crate) fn bytes_to_json(bytes: &[u8]) -> serde_json::Value {
    use base64::Engine;
    serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
}
