//! SQL Executor
//!
//! Runs validated SQL against one database. Takes a [`Verdict`], never a bare string, so
//! nothing executes without having been validated first.
//!
//! # Per-Attempt Discipline
//! - A session is checked out from the pool and released by dropping it
//! - The statement runs in its own transaction (READ ONLY unless the policy allows writes)
//!   with the search path, role and statement timeout pinned
//! - The execution time limit is also enforced client-side; on expiry the run future is
//!   dropped, which cancels the statement at the connection level
//! - At most `row_cap` rows are fetched, whatever LIMIT the SQL carries
//!
//! Transient failures (connection loss, deadlock, serialization failure, timeouts) are
//! retried by the [`RetryPolicy`]; anything else surfaces immediately with a sanitized detail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::engine::{ColumnDescriptor, ConnectionPool, DbError, DbResult, RowSet, StatementPlan};
use crate::error::{QueryError, Result};
use crate::resilience::{RetryContext, RetryError, RetryPolicy};
use crate::validator::{SqlValidator, Verdict, ViolationKind};

/// Rows returned by one successful execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub columns: Vec<ColumnDescriptor>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    /// The row cap was reached
    pub truncated: bool,
    pub elapsed: Duration,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

impl ExecutionResult {
    /// Rows as JSON objects keyed by column name
    ///
    /// Duplicate column names get a numeric suffix (`id`, `id_2`) so no value is lost.
    #[must_use]
    pub fn records(&self) -> Vec<Map<String, Value>> {
        let keys = unique_keys(&self.columns);
        self.rows
            .iter()
            .map(|row| keys.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }
}

fn unique_keys(columns: &[ColumnDescriptor]) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    columns
        .iter()
        .map(|c| {
            let count = seen.entry(c.name.as_str()).or_insert(0);
            *count += 1;
            if *count == 1 {
                c.name.clone()
            } else {
                format!("{}_{count}", c.name)
            }
        })
        .collect()
}

/// Executes verdicts against one connection pool
#[derive(Debug, Clone)]
pub struct SqlExecutor {
    pool: Arc<dyn ConnectionPool>,
    validator: SqlValidator,
    retry: RetryPolicy,
    acquire_timeout: Duration,
}

impl SqlExecutor {
    #[must_use]
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        validator: SqlValidator,
        retry: RetryPolicy,
        acquire_timeout: Duration,
    ) -> Self {
        Self { pool, validator, retry, acquire_timeout }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Execute an allowed verdict
    pub async fn execute(&self, verdict: &Verdict) -> Result<ExecutionResult> {
        if !verdict.allowed {
            return Err(verdict
                .to_error()
                .unwrap_or_else(|| QueryError::invalid_request("verdict was not allowed")));
        }

        let policy = self.validator.policy();
        if !policy.allow_write && self.validator.requires_write(&verdict.sql) {
            return Err(QueryError::validation_rejected(
                ViolationKind::WriteNotAllowed,
                "statement would write under a read-only policy",
            ));
        }

        let plan = StatementPlan {
            sql: verdict.sql.clone(),
            read_only: !policy.allow_write,
            search_path: verdict.search_path.clone(),
            role: policy.readonly_role.clone(),
            timeout: policy.max_execution_time,
            max_rows: verdict.row_cap,
        };

        let started = Instant::now();
        let plan = &plan;
        let outcome = self
            .retry
            .run("sql_execution", |ctx| async move { self.attempt(plan, ctx).await })
            .await;

        match outcome {
            Ok((set, ctx)) => {
                let elapsed = started.elapsed();
                info!(
                    engine = %self.pool.engine(),
                    rows = set.rows.len(),
                    truncated = set.truncated,
                    attempts = ctx.attempt,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "statement executed"
                );
                Ok(ExecutionResult {
                    row_count: set.rows.len(),
                    truncated: set.truncated,
                    columns: set.columns,
                    rows: set.rows,
                    elapsed,
                    attempts: ctx.attempt,
                })
            }
            Err(RetryError::Fatal(e)) => Err(QueryError::non_transient(e.sanitized())),
            Err(RetryError::Exhausted { attempts, last }) => {
                Err(QueryError::retries_exhausted(attempts, last.sanitized()))
            }
        }
    }

    async fn attempt(&self, plan: &StatementPlan, ctx: RetryContext) -> DbResult<RowSet> {
        debug!(attempt = ctx.attempt, max_attempts = ctx.max_attempts, "executing statement");
        let mut session = self.pool.acquire(self.acquire_timeout).await?;
        match tokio::time::timeout(plan.timeout, session.run(plan)).await {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout(plan.timeout)),
        }
    }
}
