//! `SQLite` Database Engine Implementation
//!
//! This module implements [`ConnectionPool`] for `SQLite` databases.
//!
//! # Features
//! - File-based connections (`/path/to/db.sqlite`)
//! - Schema description via `sqlite_master` and `pragma_table_info`
//! - Read-only connections (`SQLITE_OPEN_READ_ONLY` plus `PRAGMA query_only`) unless writes
//!   are allowed
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver); statements run on the blocking pool
//! - The "pool" is a semaphore bounding open connections; a connection is opened per session
//! - BLOB data is Base64-encoded for JSON safety
//! - A dropped `run` future interrupts the statement through the connection's interrupt handle
//! - Row limits enforced in application code
//! - No schema support (search path pinning is a no-op)

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, ErrorCode, InterruptHandle, OpenFlags, Row};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::engine::{
    bytes_to_json, float_to_json, ColumnDescriptor, ColumnInfo, ConnectionConfig, ConnectionPool,
    DatabaseType, DbError, DbErrorKind, DbResult, RowSet, SchemaContext, Session, StatementPlan,
    TableInfo,
};

/// `SQLite` connection pool
#[derive(Debug)]
pub struct SqlitePool {
    path: PathBuf,
    read_only: bool,
    slots: Arc<Semaphore>,
}

impl SqlitePool {
    /// Create a pool for the configured file
    ///
    /// With `read_only` set, connections are opened with `SQLITE_OPEN_READ_ONLY`.
    pub fn new(config: &ConnectionConfig, read_only: bool) -> DbResult<Self> {
        if config.engine != DatabaseType::SQLite {
            return Err(DbError::config(format!("Expected SQLite engine, got {}", config.engine)));
        }
        let path = config
            .file
            .clone()
            .ok_or_else(|| DbError::config("SQLite requires 'file' parameter"))?;

        Ok(Self { path, read_only, slots: Arc::new(Semaphore::new(config.pool_size.max(1))) })
    }

    async fn open(&self) -> DbResult<Connection> {
        let path = self.path.clone();
        let read_only = self.read_only;
        tokio::task::spawn_blocking(move || open_connection(&path, read_only))
            .await
            .map_err(|e| DbError::new(DbErrorKind::Other, format!("SQLite worker failed: {e}")))?
    }
}

#[async_trait]
impl ConnectionPool for SqlitePool {
    fn engine(&self) -> DatabaseType {
        DatabaseType::SQLite
    }

    async fn acquire(&self, timeout: Duration) -> DbResult<Box<dyn Session>> {
        let permit = tokio::time::timeout(timeout, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| {
                DbError::new(
                    DbErrorKind::Timeout,
                    format!("no SQLite connection available within {}ms", timeout.as_millis()),
                )
            })?
            .map_err(|_| DbError::new(DbErrorKind::Unavailable, "SQLite pool is closed"))?;

        let conn = self.open().await?;
        Ok(Box::new(SqliteSession { conn: Arc::new(Mutex::new(conn)), _slot: permit }))
    }

    async fn describe_schema(&self) -> DbResult<SchemaContext> {
        let conn = self.open().await?;
        tokio::task::spawn_blocking(move || describe(&conn))
            .await
            .map_err(|e| DbError::new(DbErrorKind::Other, format!("SQLite worker failed: {e}")))?
    }
}

/// Open `SQLite` connection with appropriate flags
fn open_connection(path: &std::path::Path, read_only: bool) -> DbResult<Connection> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };

    Connection::open_with_flags(path, flags).map_err(|e| {
        DbError::new(DbErrorKind::Connection, format!("Failed to open SQLite database: {e}"))
    })
}

fn describe(conn: &Connection) -> DbResult<SchemaContext> {
    let mut stmt = conn
        .prepare(
            "SELECT m.name, p.name, p.type, p.\"notnull\"
             FROM sqlite_master m
             JOIN pragma_table_info(m.name) p
             WHERE m.type IN ('table', 'view') AND m.name NOT LIKE 'sqlite_%'
             ORDER BY m.name, p.cid",
        )
        .map_err(classify)?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })
        .map_err(classify)?;

    let mut tables: Vec<TableInfo> = Vec::new();
    for row in rows {
        let (table, column, data_type, not_null) = row.map_err(classify)?;
        let column = ColumnInfo { name: column, data_type, nullable: not_null == 0 };
        match tables.last_mut() {
            Some(last) if last.name == table => last.columns.push(column),
            _ => tables.push(TableInfo { name: table, schema: None, columns: vec![column] }),
        }
    }

    Ok(SchemaContext { tables })
}

/// Scoped `SQLite` connection
struct SqliteSession {
    conn: Arc<Mutex<Connection>>,
    _slot: OwnedSemaphorePermit,
}

/// Interrupts the running statement unless disarmed
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.interrupt();
        }
    }
}

#[async_trait]
impl Session for SqliteSession {
    async fn run(&mut self, plan: &StatementPlan) -> DbResult<RowSet> {
        let conn = self.conn.clone();
        let plan = plan.clone();
        let handle = conn.lock().unwrap_or_else(PoisonError::into_inner).get_interrupt_handle();
        let guard = InterruptOnDrop(Some(handle));

        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            run_in_transaction(&conn, &plan)
        })
        .await;
        guard.disarm();

        result.map_err(|e| DbError::new(DbErrorKind::Other, format!("SQLite worker failed: {e}")))?
    }
}

fn run_in_transaction(conn: &Connection, plan: &StatementPlan) -> DbResult<RowSet> {
    conn.busy_timeout(plan.timeout).map_err(classify)?;
    conn.pragma_update(None, "query_only", plan.read_only).map_err(classify)?;
    conn.execute_batch("BEGIN").map_err(classify)?;

    let result = fetch(conn, plan);
    let end = if result.is_ok() && !plan.read_only { "COMMIT" } else { "ROLLBACK" };
    let ended = conn.execute_batch(end).map_err(classify);

    let rows = result?;
    ended?;
    Ok(rows)
}

fn fetch(conn: &Connection, plan: &StatementPlan) -> DbResult<RowSet> {
    let mut stmt = conn.prepare(&plan.sql).map_err(classify)?;
    let names: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();

    if names.is_empty() {
        stmt.execute([]).map_err(classify)?;
        return Ok(RowSet::default());
    }

    let mut rows = stmt.query([]).map_err(classify)?;
    let mut set = RowSet::default();
    let mut types: Vec<Option<&'static str>> = vec![None; names.len()];

    while set.rows.len() < plan.max_rows {
        let Some(row) = rows.next().map_err(classify)? else { break };
        set.rows.push(row_to_json(row, &mut types)?);
    }
    set.truncated = set.rows.len() >= plan.max_rows;

    set.columns = names
        .into_iter()
        .zip(types)
        .map(|(name, data_type)| ColumnDescriptor {
            name,
            data_type: data_type.unwrap_or("null").to_string(),
        })
        .collect();
    Ok(set)
}

/// Convert a `SQLite` row to JSON values, recording the storage class of each column
fn row_to_json(row: &Row, types: &mut [Option<&'static str>]) -> DbResult<Vec<serde_json::Value>> {
    let mut values = Vec::with_capacity(types.len());

    for (idx, seen) in types.iter_mut().enumerate() {
        let (value, storage) = match row.get_ref(idx).map_err(classify)? {
            ValueRef::Null => (serde_json::Value::Null, None),
            ValueRef::Integer(i) => (serde_json::Value::Number(i.into()), Some("integer")),
            ValueRef::Real(f) => (float_to_json(f), Some("real")),
            ValueRef::Text(s) => {
                (serde_json::Value::String(String::from_utf8_lossy(s).into_owned()), Some("text"))
            }
            ValueRef::Blob(b) => (bytes_to_json(b), Some("blob")),
        };
        if seen.is_none() {
            *seen = storage;
        }
        values.push(value);
    }

    Ok(values)
}

/// Map a `rusqlite` error to a classified [`DbError`]
fn classify(err: rusqlite::Error) -> DbError {
    let message = err.to_string();
    match &err {
        rusqlite::Error::SqliteFailure(failure, _) => {
            let kind = match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => DbErrorKind::Deadlock,
                ErrorCode::OperationInterrupted => DbErrorKind::Timeout,
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => DbErrorKind::Connection,
                ErrorCode::ReadOnly | ErrorCode::PermissionDenied | ErrorCode::AuthorizationForStatementDenied => {
                    DbErrorKind::Permission
                }
                ErrorCode::ConstraintViolation => DbErrorKind::Constraint,
                _ => DbErrorKind::Other,
            };
            DbError::new(kind, message).with_code(failure.extended_code.to_string())
        }
        _ => DbError::new(DbErrorKind::Other, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_db(name: &str, setup: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("querygate_{name}_{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let conn = Connection::open(&path).expect("Failed to create temp database");
        conn.execute_batch(setup).expect("Failed to set up temp database");
        path
    }

    fn plan(sql: &str, max_rows: usize) -> StatementPlan {
        StatementPlan {
            sql: sql.to_string(),
            read_only: true,
            search_path: vec![],
            role: None,
            timeout: Duration::from_secs(5),
            max_rows,
        }
    }

    #[test]
    fn test_missing_file_error() {
        let mut config = ConnectionConfig::sqlite(PathBuf::new());
        config.file = None;
        let err = SqlitePool::new(&config, true).unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Config);
        assert!(err.message.contains("SQLite requires 'file' parameter"));
    }

    #[tokio::test]
    async fn test_run_select_and_types() {
        let path = temp_db(
            "types",
            "CREATE TABLE t (i INTEGER, r REAL, s TEXT, b BLOB, n TEXT);
             INSERT INTO t VALUES (1, 2.5, 'hello', X'DEADBEEF', NULL);",
        );
        let pool = SqlitePool::new(&ConnectionConfig::sqlite(path.clone()), true).unwrap();
        let mut session = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let set = session.run(&plan("SELECT i, r, s, b, n FROM t", 10)).await.unwrap();
        assert_eq!(set.rows.len(), 1);
        assert!(!set.truncated);
        assert_eq!(
            set.rows[0],
            vec![
                serde_json::json!(1),
                serde_json::json!(2.5),
                serde_json::json!("hello"),
                serde_json::json!("3q2+7w=="),
                serde_json::Value::Null,
            ]
        );
        let types: Vec<&str> = set.columns.iter().map(|c| c.data_type.as_str()).collect();
        assert_eq!(types, vec!["integer", "real", "text", "blob", "null"]);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_row_cap_sets_truncated() {
        let path = temp_db(
            "cap",
            "CREATE TABLE t (i INTEGER); INSERT INTO t VALUES (1), (2), (3), (4);",
        );
        let pool = SqlitePool::new(&ConnectionConfig::sqlite(path.clone()), true).unwrap();
        let mut session = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let set = session.run(&plan("SELECT i FROM t", 2)).await.unwrap();
        assert_eq!(set.rows.len(), 2);
        assert!(set.truncated);

        let set = session.run(&plan("SELECT i FROM t", 4)).await.unwrap();
        assert_eq!(set.rows.len(), 4);
        assert!(set.truncated);

        let set = session.run(&plan("SELECT i FROM t", 5)).await.unwrap();
        assert_eq!(set.rows.len(), 4);
        assert!(!set.truncated);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_read_only_session_rejects_writes() {
        let path = temp_db("ro", "CREATE TABLE t (i INTEGER);");
        let pool = SqlitePool::new(&ConnectionConfig::sqlite(path.clone()), true).unwrap();
        let mut session = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let err = session.run(&plan("INSERT INTO t VALUES (1)", 10)).await.unwrap_err();
        assert!(!err.kind.is_transient());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_syntax_error_is_not_transient() {
        let path = temp_db("syntax", "CREATE TABLE t (i INTEGER);");
        let pool = SqlitePool::new(&ConnectionConfig::sqlite(path.clone()), true).unwrap();
        let mut session = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let err = session.run(&plan("SELECT nope FROM t", 10)).await.unwrap_err();
        assert!(!err.kind.is_transient());
        assert!(err.sanitized().contains("nope"));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_pool_exhausted() {
        let path = temp_db("exhausted", "CREATE TABLE t (i INTEGER);");
        let mut config = ConnectionConfig::sqlite(path.clone());
        config.pool_size = 1;
        let pool = SqlitePool::new(&config, true).unwrap();

        let _held = pool.acquire(Duration::from_secs(1)).await.unwrap();
        let err = pool.acquire(Duration::from_millis(20)).await.err().unwrap();
        assert_eq!(err.kind, DbErrorKind::Timeout);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_describe_schema() {
        let path = temp_db(
            "schema",
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT);
             CREATE TABLE orders (id INTEGER, user_id INTEGER);",
        );
        let pool = SqlitePool::new(&ConnectionConfig::sqlite(path.clone()), true).unwrap();
        let schema = pool.describe_schema().await.unwrap();

        let names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["orders", "users"]);
        let users = &schema.tables[1];
        assert_eq!(users.columns.len(), 3);
        assert_eq!(users.columns[1].name, "name");
        assert!(!users.columns[1].nullable);

        let _ = std::fs::remove_file(&path);
    }
}
