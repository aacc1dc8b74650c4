//! MySQL Database Engine Implementation
//!
//! This module implements [`ConnectionPool`] for MySQL databases (including MariaDB).
//!
//! # Features
//! - Pooled client-server connections via TCP
//! - Schema description via information_schema (current database only)
//! - Every statement runs inside `START TRANSACTION READ ONLY` unless writes are allowed
//! - `max_execution_time` pinned on the session before the transaction opens
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - Statements go through the binary protocol so values arrive typed
//! - The pool resets returned connections, so session settings never leak
//! - A dropped `run` future issues `KILL QUERY` from a sibling connection, and so does a
//!   fetch that reaches the row cap, instead of draining the remaining rows
//! - MySQL has no search path; the pinned schema list is ignored
//! - DECIMAL converted to JSON numbers, JSON columns kept as nested JSON
//! - ENUM and SET types converted to strings
//! - BLOB data is Base64-encoded for JSON safety

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Pool, PoolConstraints, PoolOpts, Row, Value};
use tracing::debug;

use crate::engine::{
    bytes_to_json, float_to_json, ColumnDescriptor, ColumnInfo, ConnectionConfig, ConnectionPool,
    DatabaseType, DbError, DbErrorKind, DbResult, RowSet, SchemaContext, Session, StatementPlan,
    TableInfo,
};

const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// MySQL connection pool
pub struct MySqlPool {
    pool: Pool,
}

impl fmt::Debug for MySqlPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlPool").finish_non_exhaustive()
    }
}

impl MySqlPool {
    /// Create a pool; connections are opened lazily
    pub fn new(config: &ConnectionConfig) -> DbResult<Self> {
        if config.engine != DatabaseType::MySQL {
            return Err(DbError::config(format!("Expected MySQL engine, got {}", config.engine)));
        }

        let constraints = PoolConstraints::new(0, config.pool_size.max(1))
            .ok_or_else(|| DbError::config("invalid MySQL pool size"))?;
        let opts = build_mysql_opts(config)?
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        Ok(Self { pool: Pool::new(opts) })
    }

    async fn get(&self, timeout: Duration) -> DbResult<Conn> {
        tokio::time::timeout(timeout, self.pool.get_conn())
            .await
            .map_err(|_| {
                DbError::new(
                    DbErrorKind::Timeout,
                    format!("no MySQL connection available within {}ms", timeout.as_millis()),
                )
            })?
            .map_err(|e| classify(&e))
    }
}

#[async_trait]
impl ConnectionPool for MySqlPool {
    fn engine(&self) -> DatabaseType {
        DatabaseType::MySQL
    }

    async fn acquire(&self, timeout: Duration) -> DbResult<Box<dyn Session>> {
        let conn = self.get(timeout).await?;
        Ok(Box::new(MySqlSession { conn, pool: self.pool.clone() }))
    }

    async fn describe_schema(&self) -> DbResult<SchemaContext> {
        let mut conn = self.get(DESCRIBE_TIMEOUT).await?;
        let rows: Vec<(String, String, String, String)> = conn
            .query(
                "SELECT table_name, column_name, data_type, is_nullable
                 FROM information_schema.columns
                 WHERE table_schema = DATABASE()
                 ORDER BY table_name, ordinal_position",
            )
            .await
            .map_err(|e| classify(&e))?;

        let mut tables: Vec<TableInfo> = Vec::new();
        for (table, column, data_type, nullable) in rows {
            let column = ColumnInfo { name: column, data_type, nullable: nullable == "YES" };
            match tables.last_mut() {
                Some(last) if last.name == table => last.columns.push(column),
                _ => tables.push(TableInfo { name: table, schema: None, columns: vec![column] }),
            }
        }

        Ok(SchemaContext { tables })
    }
}

/// Build MySQL connection options from ConnectionConfig
fn build_mysql_opts(config: &ConnectionConfig) -> DbResult<OptsBuilder> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| DbError::config("MySQL requires 'host' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| DbError::config("MySQL requires 'user' parameter"))?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| DbError::config("MySQL requires 'database' parameter"))?;

    let opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(config.port.unwrap_or(3306))
        .user(Some(user))
        .pass(config.password.as_ref())
        .db_name(Some(database));

    Ok(opts)
}

/// Scoped pooled connection
struct MySqlSession {
    conn: Conn,
    pool: Pool,
}

/// Kills the running statement from another connection unless disarmed
struct KillOnDrop {
    pool: Option<Pool>,
    connection_id: u32,
}

impl KillOnDrop {
    fn disarm(mut self) {
        self.pool = None;
    }
}

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else { return };
        let id = self.connection_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(kill_query(pool, id));
        }
    }
}

/// Interrupt the statement running on connection `id`; the connection stays open
async fn kill_query(pool: Pool, id: u32) {
    match pool.get_conn().await {
        Ok(mut conn) => {
            if let Err(e) = conn.query_drop(format!("KILL QUERY {id}")).await {
                debug!(connection_id = id, error = %e, "KILL QUERY failed");
            }
        }
        Err(e) => debug!(connection_id = id, error = %e, "no connection for KILL QUERY"),
    }
}

#[async_trait]
impl Session for MySqlSession {
    async fn run(&mut self, plan: &StatementPlan) -> DbResult<RowSet> {
        let guard = KillOnDrop { pool: Some(self.pool.clone()), connection_id: self.conn.id() };
        let result = run_in_transaction(&mut self.conn, &self.pool, plan).await;
        guard.disarm();
        result
    }
}

async fn run_in_transaction(conn: &mut Conn, pool: &Pool, plan: &StatementPlan) -> DbResult<RowSet> {
    conn.query_drop(format!("SET SESSION max_execution_time = {}", plan.timeout.as_millis()))
        .await
        .map_err(|e| classify(&e))?;
    if let Some(role) = &plan.role {
        conn.query_drop(format!("SET ROLE '{role}'")).await.map_err(|e| classify(&e))?;
    }

    let begin = if plan.read_only { "START TRANSACTION READ ONLY" } else { "START TRANSACTION" };
    conn.query_drop(begin).await.map_err(|e| classify(&e))?;

    let result = fetch(conn, pool, plan).await;

    let end = if result.is_ok() && !plan.read_only { "COMMIT" } else { "ROLLBACK" };
    let ended = conn.query_drop(end).await.map_err(|e| classify(&e));

    let rows = result?;
    ended?;
    Ok(rows)
}

async fn fetch(conn: &mut Conn, pool: &Pool, plan: &StatementPlan) -> DbResult<RowSet> {
    let connection_id = conn.id();
    let mut result = conn.exec_iter(plan.sql.as_str(), ()).await.map_err(|e| classify(&e))?;

    let columns: Vec<ColumnDescriptor> = result
        .columns_ref()
        .iter()
        .map(|c| ColumnDescriptor { name: c.name_str().to_string(), data_type: type_name(c.column_type()) })
        .collect();
    let kinds: Vec<ColumnType> = result.columns_ref().iter().map(|c| c.column_type()).collect();

    let mut rows = Vec::new();
    while rows.len() < plan.max_rows {
        match result.next().await.map_err(|e| classify(&e))? {
            Some(row) => rows.push(row_to_json(&row, &kinds)),
            None => break,
        }
    }
    let truncated = rows.len() >= plan.max_rows;
    if truncated {
        // The server would otherwise keep producing rows until the statement ends
        kill_query(pool.clone(), connection_id).await;
        if let Err(e) = result.drop_result().await {
            debug!(connection_id, error = %e, "capped statement interrupted");
        }
    } else {
        result.drop_result().await.map_err(|e| classify(&e))?;
    }

    Ok(RowSet { columns, rows, truncated })
}

/// `MYSQL_TYPE_NEWDECIMAL` -> `newdecimal`
fn type_name(kind: ColumnType) -> String {
    format!("{kind:?}").trim_start_matches("MYSQL_TYPE_").to_lowercase()
}

/// Map a MySQL error to a classified [`DbError`]
fn classify(err: &mysql_async::Error) -> DbError {
    match err {
        mysql_async::Error::Server(server) => {
            DbError::new(kind_for_server_code(server.code), server.message.clone())
                .with_code(server.code.to_string())
        }
        mysql_async::Error::Io(e) => {
            DbError::new(DbErrorKind::Connection, format!("MySQL connection failed: {e}"))
        }
        mysql_async::Error::Driver(e) => {
            DbError::new(DbErrorKind::Connection, format!("MySQL driver error: {e}"))
        }
        other => DbError::new(DbErrorKind::Other, other.to_string()),
    }
}

/// Classify a MySQL server error number
fn kind_for_server_code(code: u16) -> DbErrorKind {
    match code {
        1213 => DbErrorKind::Deadlock,
        1205 | 3024 => DbErrorKind::Timeout,
        1040 | 1053 => DbErrorKind::Unavailable,
        1044 | 1045 | 1142 | 1143 | 1227 | 1792 => DbErrorKind::Permission,
        1062 | 1451 | 1452 => DbErrorKind::Constraint,
        1054 | 1064 | 1146 | 1149 => DbErrorKind::Syntax,
        _ => DbErrorKind::Other,
    }
}

/// Convert a MySQL row to a JSON-safe `Vec`
fn row_to_json(row: &Row, kinds: &[ColumnType]) -> Vec<serde_json::Value> {
    (0..row.len())
        .map(|idx| {
            let kind = kinds.get(idx).copied().unwrap_or(ColumnType::MYSQL_TYPE_VAR_STRING);
            row.as_ref(idx).map_or(serde_json::Value::Null, |v| mysql_value_to_json(v, kind))
        })
        .collect()
}

/// Convert MySQL value to JSON value
fn mysql_value_to_json(value: &Value, kind: ColumnType) -> serde_json::Value {
    match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => match kind {
            ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map_or(serde_json::Value::Null, float_to_json)
            }
            ColumnType::MYSQL_TYPE_JSON => {
                serde_json::from_slice(bytes).unwrap_or_else(|_| bytes_to_json(bytes))
            }
            _ => match std::str::from_utf8(bytes) {
                Ok(s) => serde_json::Value::String(s.to_string()),
                Err(_) => bytes_to_json(bytes),
            },
        },

        Value::Int(i) => serde_json::Value::from(*i),

        Value::UInt(u) => serde_json::Value::from(*u),

        Value::Float(f) => float_to_json(f64::from(*f)),

        Value::Double(d) => float_to_json(*d),

        Value::Date(year, month, day, hour, minute, second, micro) => serde_json::Value::String(format!(
            "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
        )),

        Value::Time(is_negative, days, hours, minutes, seconds, microseconds) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            serde_json::Value::String(format!(
                "{sign}{total_hours}:{minutes:02}:{seconds:02}.{microseconds:06}"
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> ConnectionConfig {
        ConnectionConfig::mysql(
            "localhost".to_string(),
            3306,
            "root".to_string(),
            "password".to_string(),
            "test".to_string(),
        )
    }

    #[test]
    fn test_wrong_engine() {
        let mut wrong = config();
        wrong.engine = DatabaseType::Postgres;
        let err = MySqlPool::new(&wrong).unwrap_err();
        assert!(err.message.contains("Expected MySQL engine"));
    }

    #[test]
    fn test_missing_host() {
        let mut missing = config();
        missing.host = None;
        let err = build_mysql_opts(&missing).unwrap_err();
        assert!(err.message.contains("MySQL requires 'host' parameter"));
        assert_eq!(err.kind, DbErrorKind::Config);
    }

    #[test]
    fn test_server_code_classification() {
        assert_eq!(kind_for_server_code(1213), DbErrorKind::Deadlock);
        assert_eq!(kind_for_server_code(1205), DbErrorKind::Timeout);
        assert_eq!(kind_for_server_code(3024), DbErrorKind::Timeout);
        assert_eq!(kind_for_server_code(1040), DbErrorKind::Unavailable);
        assert_eq!(kind_for_server_code(1792), DbErrorKind::Permission);
        assert_eq!(kind_for_server_code(1064), DbErrorKind::Syntax);
        assert_eq!(kind_for_server_code(1062), DbErrorKind::Constraint);

        for code in [1213, 1205, 1040, 3024] {
            assert!(kind_for_server_code(code).is_transient(), "{code}");
        }
        assert!(!kind_for_server_code(1064).is_transient());
    }

    #[test]
    fn test_value_conversion() {
        let decimal = Value::Bytes(b"12.50".to_vec());
        assert_eq!(mysql_value_to_json(&decimal, ColumnType::MYSQL_TYPE_NEWDECIMAL), json!(12.5));

        let doc = Value::Bytes(br#"{"a":[1,2]}"#.to_vec());
        assert_eq!(mysql_value_to_json(&doc, ColumnType::MYSQL_TYPE_JSON), json!({"a": [1, 2]}));

        let text = Value::Bytes(b"hello".to_vec());
        assert_eq!(mysql_value_to_json(&text, ColumnType::MYSQL_TYPE_VAR_STRING), json!("hello"));

        let blob = Value::Bytes(vec![0xff, 0xfe]);
        assert_eq!(mysql_value_to_json(&blob, ColumnType::MYSQL_TYPE_BLOB), json!("//4="));

        assert_eq!(mysql_value_to_json(&Value::Double(f64::NAN), ColumnType::MYSQL_TYPE_DOUBLE), json!(null));
        assert_eq!(
            mysql_value_to_json(&Value::Date(2024, 1, 2, 3, 4, 5, 6), ColumnType::MYSQL_TYPE_DATETIME),
            json!("2024-01-02T03:04:05.000006")
        );
        assert_eq!(
            mysql_value_to_json(&Value::Time(true, 1, 2, 3, 4, 0), ColumnType::MYSQL_TYPE_TIME),
            json!("-26:03:04.000000")
        );
    }

    #[test]
    fn test_type_name() {
        assert_eq!(type_name(ColumnType::MYSQL_TYPE_NEWDECIMAL), "newdecimal");
        assert_eq!(type_name(ColumnType::MYSQL_TYPE_LONGLONG), "longlong");
    }

    // Integration tests require a running MySQL instance:
    // cargo test --features mysql -- --ignored

    #[tokio::test]
    #[ignore = "Requires running MySQL instance"]
    async fn test_run_capped_select() {
        let pool = MySqlPool::new(&config()).unwrap();
        let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let plan = StatementPlan {
            sql: "SELECT 1 AS n UNION ALL SELECT 2 UNION ALL SELECT 3".to_string(),
            read_only: true,
            search_path: vec![],
            role: None,
            timeout: Duration::from_secs(5),
            max_rows: 2,
        };
        let set = session.run(&plan).await.unwrap();
        assert_eq!(set.rows.len(), 2);
        assert!(set.truncated);
    }

    #[tokio::test]
    #[ignore = "Requires running MySQL instance"]
    async fn test_capped_select_is_interrupted() {
        let pool = MySqlPool::new(&config()).unwrap();
        let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let plan = StatementPlan {
            sql: "SELECT a.column_name AS n FROM information_schema.columns a CROSS JOIN information_schema.columns b"
                .to_string(),
            read_only: true,
            search_path: vec![],
            role: None,
            timeout: Duration::from_secs(30),
            max_rows: 3,
        };
        let started = std::time::Instant::now();
        let set = session.run(&plan).await.unwrap();
        assert_eq!(set.rows.len(), 3);
        assert!(set.truncated);
        assert!(started.elapsed() < Duration::from_secs(10));

        // The session is still usable after the interrupted statement
        let follow_up = StatementPlan { sql: "SELECT 1 AS n".to_string(), max_rows: 10, ..plan };
        let set = session.run(&follow_up).await.unwrap();
        assert_eq!(set.rows.len(), 1);
        assert!(!set.truncated);
    }
}
