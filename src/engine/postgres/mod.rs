//! `PostgreSQL` Database Engine Implementation
//!
//! This module implements [`ConnectionPool`] for `PostgreSQL` databases.
//!
//! # Features
//! - Pooled client-server connections via `deadpool-postgres`
//! - Schema description via `information_schema`
//! - Every statement runs in its own transaction (`BEGIN READ ONLY` unless writes are
//!   allowed) with `statement_timeout`, `search_path` and the readonly role pinned by
//!   `SET LOCAL`, so nothing outlives the transaction
//! - Rich type system support (JSON/JSONB, NUMERIC, timestamps, UUIDs, arrays)
//!
//! # Implementation Notes
//! - Uses `tokio-postgres` (async driver, requires tokio runtime)
//! - Rows are streamed and the fetch stops at the row cap
//! - A dropped `run` future cancels the backend query through the connection's cancel token
//! - Pooled connections are recycled with `ROLLBACK; RESET ALL`
//! - JSON/JSONB preserved as nested JSON
//! - BYTEA data is Base64-encoded for JSON safety
//! - NUMERIC converted to JSON numbers, NaN/Infinity to null

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod};
use futures_util::{pin_mut, TryStreamExt};
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{CancelToken, Client, Config, NoTls, Row};

use crate::engine::{
    bytes_to_json, float_to_json, ColumnDescriptor, ColumnInfo, ConnectionConfig, ConnectionPool,
    DatabaseType, DbError, DbErrorKind, DbResult, RowSet, SchemaContext, Session, StatementPlan,
    TableInfo,
};

/// Run on a pooled connection before it is handed out again
const RECYCLE_SQL: &str = "ROLLBACK; RESET ALL;";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `PostgreSQL` connection pool
pub struct PostgresPool {
    pool: Pool,
}

impl fmt::Debug for PostgresPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.pool.status();
        f.debug_struct("PostgresPool")
            .field("max_size", &status.max_size)
            .field("size", &status.size)
            .field("available", &status.available)
            .finish()
    }
}

impl PostgresPool {
    /// Create a pool; connections are opened lazily
    pub fn new(config: &ConnectionConfig) -> DbResult<Self> {
        if config.engine != DatabaseType::Postgres {
            return Err(DbError::config(format!(
                "Expected PostgreSQL engine, got {}",
                config.engine
            )));
        }

        let pg_config = build_pg_config(config)?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Custom(RECYCLE_SQL.to_string()) },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .build()
            .map_err(|e| DbError::config(format!("Failed to build PostgreSQL pool: {e}")))?;

        Ok(Self { pool })
    }

    async fn get(&self, timeout: Duration) -> DbResult<Object> {
        tokio::time::timeout(timeout, self.pool.get())
            .await
            .map_err(|_| {
                DbError::new(
                    DbErrorKind::Timeout,
                    format!("no PostgreSQL connection available within {}ms", timeout.as_millis()),
                )
            })?
            .map_err(pool_error)
    }
}

#[async_trait]
impl ConnectionPool for PostgresPool {
    fn engine(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn acquire(&self, timeout: Duration) -> DbResult<Box<dyn Session>> {
        let client = self.get(timeout).await?;
        Ok(Box::new(PostgresSession { client }))
    }

    async fn describe_schema(&self) -> DbResult<SchemaContext> {
        let client = self.get(CONNECT_TIMEOUT).await?;
        let rows = client
            .query(
                "SELECT c.table_schema, c.table_name, c.column_name, c.data_type, c.is_nullable
                 FROM information_schema.columns c
                 JOIN information_schema.tables t
                   ON t.table_schema = c.table_schema AND t.table_name = c.table_name
                 WHERE c.table_schema NOT IN ('pg_catalog', 'information_schema')
                 ORDER BY c.table_schema, c.table_name, c.ordinal_position",
                &[],
            )
            .await
            .map_err(|e| classify(&e))?;

        let mut tables: Vec<TableInfo> = Vec::new();
        for row in rows {
            let schema: String = row.get(0);
            let table: String = row.get(1);
            let column = ColumnInfo {
                name: row.get(2),
                data_type: row.get(3),
                nullable: row.get::<_, String>(4) == "YES",
            };
            match tables.last_mut() {
                Some(last) if last.name == table && last.schema.as_deref() == Some(schema.as_str()) => {
                    last.columns.push(column);
                }
                _ => tables.push(TableInfo { name: table, schema: Some(schema), columns: vec![column] }),
            }
        }

        Ok(SchemaContext { tables })
    }
}

/// Build `PostgreSQL` connection config from `ConnectionConfig`
fn build_pg_config(config: &ConnectionConfig) -> DbResult<Config> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| DbError::config("PostgreSQL requires 'host' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| DbError::config("PostgreSQL requires 'user' parameter"))?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| DbError::config("PostgreSQL requires 'database' parameter"))?;

    let mut pg_config = Config::new();
    pg_config
        .host(host)
        .port(config.port.unwrap_or(5432))
        .user(user)
        .dbname(database)
        .application_name("querygate")
        .connect_timeout(CONNECT_TIMEOUT);
    if let Some(password) = &config.password {
        pg_config.password(password);
    }

    Ok(pg_config)
}

/// Scoped pooled connection
struct PostgresSession {
    client: Object,
}

/// Cancels the backend query unless disarmed
struct CancelOnDrop(Option<CancelToken>);

impl CancelOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.0.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = token.cancel_query(NoTls).await;
                });
            }
        }
    }
}

#[async_trait]
impl Session for PostgresSession {
    async fn run(&mut self, plan: &StatementPlan) -> DbResult<RowSet> {
        let guard = CancelOnDrop(Some(self.client.cancel_token()));
        let result = run_in_transaction(&self.client, plan).await;
        guard.disarm();
        result
    }
}

async fn run_in_transaction(client: &Client, plan: &StatementPlan) -> DbResult<RowSet> {
    let begin = if plan.read_only { "BEGIN READ ONLY" } else { "BEGIN" };
    client.batch_execute(begin).await.map_err(|e| classify(&e))?;

    let result = async {
        client
            .batch_execute(&session_settings(plan))
            .await
            .map_err(|e| classify(&e))?;
        fetch(client, plan).await
    }
    .await;

    let end = if result.is_ok() && !plan.read_only { "COMMIT" } else { "ROLLBACK" };
    let ended = client.batch_execute(end).await.map_err(|e| classify(&e));

    let rows = result?;
    ended?;
    Ok(rows)
}

/// Transaction-scoped settings applied before the statement
fn session_settings(plan: &StatementPlan) -> String {
    let mut sql = format!("SET LOCAL statement_timeout = {};", plan.timeout.as_millis());
    if !plan.search_path.is_empty() {
        let path = plan.search_path.iter().map(|s| quote_ident(s)).collect::<Vec<_>>().join(", ");
        sql.push_str(&format!(" SET LOCAL search_path TO {path};"));
    }
    if let Some(role) = &plan.role {
        sql.push_str(&format!(" SET LOCAL ROLE {};", quote_ident(role)));
    }
    sql
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

async fn fetch(client: &Client, plan: &StatementPlan) -> DbResult<RowSet> {
    let stmt = client.prepare(&plan.sql).await.map_err(|e| classify(&e))?;
    let columns: Vec<ColumnDescriptor> = stmt
        .columns()
        .iter()
        .map(|c| ColumnDescriptor { name: c.name().to_string(), data_type: c.type_().name().to_string() })
        .collect();

    if columns.is_empty() {
        client.execute(&stmt, &[]).await.map_err(|e| classify(&e))?;
        return Ok(RowSet::default());
    }

    let stream = client
        .query_raw(&stmt, Vec::<String>::new())
        .await
        .map_err(|e| classify(&e))?;
    pin_mut!(stream);

    let mut rows = Vec::new();
    while rows.len() < plan.max_rows {
        match stream.try_next().await.map_err(|e| classify(&e))? {
            Some(row) => rows.push(row_to_json(&row)?),
            None => break,
        }
    }

    let truncated = rows.len() >= plan.max_rows;
    Ok(RowSet { columns, rows, truncated })
}

/// Map a `PostgreSQL` error to a classified [`DbError`]
fn classify(err: &tokio_postgres::Error) -> DbError {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        return DbError::new(kind_for_sqlstate(code), db.message()).with_code(code);
    }

    let io = std::error::Error::source(err).is_some_and(|s| s.is::<std::io::Error>());
    if err.is_closed() || io {
        DbError::new(DbErrorKind::Connection, format!("PostgreSQL connection failed: {err}"))
    } else {
        DbError::new(DbErrorKind::Other, err.to_string())
    }
}

fn pool_error(err: PoolError) -> DbError {
    match err {
        PoolError::Backend(e) => classify(&e),
        other => DbError::new(
            DbErrorKind::Connection,
            format!("Failed to get PostgreSQL connection: {other}"),
        ),
    }
}

/// Classify a SQLSTATE code
fn kind_for_sqlstate(code: &str) -> DbErrorKind {
    match code {
        "08000" | "08001" | "08003" | "08004" | "08006" => DbErrorKind::Connection,
        "40001" => DbErrorKind::Serialization,
        "40P01" => DbErrorKind::Deadlock,
        "53300" | "57P01" | "57P02" | "57P03" => DbErrorKind::Unavailable,
        "57014" => DbErrorKind::Timeout,
        "42501" | "25006" => DbErrorKind::Permission,
        c if c.starts_with("23") => DbErrorKind::Constraint,
        c if c.starts_with("42") => DbErrorKind::Syntax,
        _ => DbErrorKind::Other,
    }
}

/// NUMERIC decoded from the binary wire format
struct Numeric(Option<f64>);

impl<'a> FromSql<'a> for Numeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        decode_numeric(raw).map(Numeric).ok_or_else(|| "malformed NUMERIC value".into())
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// `None` for malformed input, `Some(None)` for NaN and infinities
fn decode_numeric(raw: &[u8]) -> Option<Option<f64>> {
    let word = |at: usize| raw.get(at..at + 2).map(|b| u16::from_be_bytes([b[0], b[1]]));

    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(2)? as i16);
    let sign = word(4)?;
    if sign != 0x0000 && sign != 0x4000 {
        return Some(None);
    }

    let mut value = 0f64;
    for i in 0..ndigits {
        let digit = f64::from(word(8 + 2 * i)?);
        value += digit * 10000f64.powi(weight - i32::try_from(i).ok()?);
    }
    if sign == 0x4000 {
        value = -value;
    }
    Some(Some(value))
}

fn read<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> DbResult<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        DbError::new(
            DbErrorKind::Other,
            format!("Failed to read column '{}': {e}", row.columns()[idx].name()),
        )
    })
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> DbResult<Vec<serde_json::Value>> {
    (0..row.len()).map(|idx| postgres_value_to_json(row, idx)).collect()
}

/// Convert `PostgreSQL` value to JSON value
fn postgres_value_to_json(row: &Row, idx: usize) -> DbResult<serde_json::Value> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
    use serde_json::Value;

    let col_type = row.columns()[idx].type_();

    let value = match *col_type {
        Type::BOOL => read::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => read::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => read::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => read::<i64>(row, idx)?.map(Value::from),
        Type::OID => read::<u32>(row, idx)?.map(Value::from),
        Type::FLOAT4 => read::<f32>(row, idx)?.map(|v| float_to_json(f64::from(v))),
        Type::FLOAT8 => read::<f64>(row, idx)?.map(float_to_json),
        Type::NUMERIC => read::<Numeric>(row, idx)?.map(|n| n.0.map_or(Value::Null, float_to_json)),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => {
            read::<String>(row, idx)?.map(Value::String)
        }
        Type::JSON | Type::JSONB => read::<Value>(row, idx)?,
        Type::BYTEA => read::<Vec<u8>>(row, idx)?.map(|v| bytes_to_json(&v)),
        Type::TIMESTAMP => read::<NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => read::<DateTime<Utc>>(row, idx)?.map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => read::<NaiveDate>(row, idx)?.map(|v| Value::String(v.format("%Y-%m-%d").to_string())),
        Type::TIME => read::<NaiveTime>(row, idx)?.map(|v| Value::String(v.format("%H:%M:%S%.f").to_string())),
        Type::UUID => read::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::INT4_ARRAY => read::<Vec<Option<i32>>>(row, idx)?.map(Value::from),
        Type::INT8_ARRAY => read::<Vec<Option<i64>>>(row, idx)?.map(Value::from),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => read::<Vec<Option<String>>>(row, idx)?.map(Value::from),
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(Value::String),
            Err(_) => Some(Value::String(format!("<unsupported type {}>", col_type.name()))),
        },
    };

    Ok(value.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::postgres(
            "localhost".to_string(),
            5432,
            "postgres".to_string(),
            "postgres".to_string(),
            "postgres".to_string(),
        )
    }

    #[test]
    fn test_missing_parameters() {
        let mut missing_host = config();
        missing_host.host = None;
        let err = build_pg_config(&missing_host).unwrap_err();
        assert!(err.message.contains("PostgreSQL requires 'host' parameter"));

        let mut missing_db = config();
        missing_db.database = None;
        let err = build_pg_config(&missing_db).unwrap_err();
        assert!(err.message.contains("PostgreSQL requires 'database' parameter"));
    }

    #[test]
    fn test_wrong_engine() {
        let mut wrong = config();
        wrong.engine = DatabaseType::MySQL;
        let err = PostgresPool::new(&wrong).unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Config);
    }

    #[test]
    fn test_sqlstate_classification() {
        for code in ["08000", "08003", "08006", "08001", "08004"] {
            assert_eq!(kind_for_sqlstate(code), DbErrorKind::Connection, "{code}");
        }
        assert_eq!(kind_for_sqlstate("40001"), DbErrorKind::Serialization);
        assert_eq!(kind_for_sqlstate("40P01"), DbErrorKind::Deadlock);
        for code in ["53300", "57P01", "57P02", "57P03"] {
            assert_eq!(kind_for_sqlstate(code), DbErrorKind::Unavailable, "{code}");
        }
        assert_eq!(kind_for_sqlstate("57014"), DbErrorKind::Timeout);
        assert_eq!(kind_for_sqlstate("42601"), DbErrorKind::Syntax);
        assert_eq!(kind_for_sqlstate("42P01"), DbErrorKind::Syntax);
        assert_eq!(kind_for_sqlstate("42501"), DbErrorKind::Permission);
        assert_eq!(kind_for_sqlstate("25006"), DbErrorKind::Permission);
        assert_eq!(kind_for_sqlstate("23505"), DbErrorKind::Constraint);
        assert!(kind_for_sqlstate("40001").is_transient());
        assert!(!kind_for_sqlstate("42601").is_transient());
    }

    #[test]
    fn test_session_settings() {
        let plan = StatementPlan {
            sql: "SELECT 1".to_string(),
            read_only: true,
            search_path: vec!["public".to_string(), "analytics".to_string()],
            role: Some("reader".to_string()),
            timeout: Duration::from_secs(30),
            max_rows: 10,
        };
        assert_eq!(
            session_settings(&plan),
            "SET LOCAL statement_timeout = 30000; SET LOCAL search_path TO \"public\", \"analytics\"; SET LOCAL ROLE \"reader\";"
        );
    }

    #[test]
    fn test_decode_numeric() {
        // 12.5: ndigits=2, weight=0, sign=+, dscale=1, digits [12, 5000]
        let raw = [0, 2, 0, 0, 0, 0, 0, 1, 0, 12, 0x13, 0x88];
        assert_eq!(decode_numeric(&raw), Some(Some(12.5)));

        // -10000: ndigits=1, weight=1, sign=-, digits [1]
        let raw = [0, 1, 0, 1, 0x40, 0, 0, 0, 0, 1];
        assert_eq!(decode_numeric(&raw), Some(Some(-10000.0)));

        // NaN
        let raw = [0, 0, 0, 0, 0xC0, 0, 0, 0];
        assert_eq!(decode_numeric(&raw), Some(None));

        assert_eq!(decode_numeric(&[0, 1]), None);
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_run_read_only_select() {
        let pool = PostgresPool::new(&config()).unwrap();
        let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let plan = StatementPlan {
            sql: "SELECT generate_series(1, 10) AS n".to_string(),
            read_only: true,
            search_path: vec!["public".to_string()],
            role: None,
            timeout: Duration::from_secs(5),
            max_rows: 3,
        };
        let set = session.run(&plan).await.unwrap();
        assert_eq!(set.rows.len(), 3);
        assert!(set.truncated);
        assert_eq!(set.columns[0].name, "n");
    }

    #[tokio::test]
    #[ignore = "Requires running PostgreSQL instance"]
    async fn test_read_only_transaction_rejects_writes() {
        let pool = PostgresPool::new(&config()).unwrap();
        let mut session = pool.acquire(Duration::from_secs(5)).await.unwrap();
        let plan = StatementPlan {
            sql: "CREATE TABLE querygate_should_not_exist (id INT)".to_string(),
            read_only: true,
            search_path: vec![],
            role: None,
            timeout: Duration::from_secs(5),
            max_rows: 1,
        };
        let err = session.run(&plan).await.unwrap_err();
        assert_eq!(err.kind, DbErrorKind::Permission);
        assert_eq!(err.code.as_deref(), Some("25006"));
    }
}
