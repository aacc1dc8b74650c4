//! Structural SQL Policy Engine
//!
//! Decides whether a candidate SQL string may execute under a [`SecurityPolicy`], and
//! rewrites accepted queries so they carry an explicit row cap.
//!
//! # Validation Strategy
//! - The SQL is parsed with the dialect of the target engine; nothing is decided by
//!   text matching
//! - Exactly one statement is accepted
//! - Session and privilege statements (SET, GRANT, transaction control, PRAGMA) are
//!   always rejected: they could undo the session pin applied by the executor
//! - Rules run in a fixed order and the first failing rule rejects:
//!   1. write operations (looking through EXPLAIN, including `SELECT INTO` and row locks)
//!   2. blocked functions (scalar calls and table functions)
//!   3. blocked tables (any case, any qualification, CTE bodies and subqueries included)
//!   4. blocked columns (alias-aware; wildcards and whole-row references over guarded tables)
//!   5. EXPLAIN gating
//!
//! A rule lists every offending identifier it found, deduplicated, in order of appearance.
//! Validation is pure: the same SQL, policy and requested cap always yield the same verdict.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use serde::Serialize;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, ObjectName, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins, Value, Visit, Visitor,
};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

use crate::engine::DatabaseType;
use crate::error::QueryError;
use crate::policy::SecurityPolicy;

/// Category of a policy violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ViolationKind {
    ParseError,
    MultipleStatements,
    StatementNotAllowed,
    WriteNotAllowed,
    BlockedFunction,
    BlockedTable,
    BlockedColumn,
    ExplainNotAllowed,
}

impl ViolationKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ParseError => "ParseError",
            Self::MultipleStatements => "MultipleStatements",
            Self::StatementNotAllowed => "StatementNotAllowed",
            Self::WriteNotAllowed => "WriteNotAllowed",
            Self::BlockedFunction => "BlockedFunction",
            Self::BlockedTable => "BlockedTable",
            Self::BlockedColumn => "BlockedColumn",
            Self::ExplainNotAllowed => "ExplainNotAllowed",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level statement category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Query,
    Explain,
    Insert,
    Update,
    Delete,
    Merge,
    Copy,
    Truncate,
    Ddl,
    Other,
}

impl StatementKind {
    fn of(statement: &Statement) -> Self {
        match statement {
            Statement::Query(_) => Self::Query,
            Statement::Explain { .. } | Statement::ExplainTable { .. } => Self::Explain,
            Statement::Insert { .. } => Self::Insert,
            Statement::Update { .. } => Self::Update,
            Statement::Delete { .. } => Self::Delete,
            Statement::Merge { .. } => Self::Merge,
            Statement::Copy { .. } => Self::Copy,
            Statement::Truncate { .. } => Self::Truncate,
            Statement::CreateTable { .. }
            | Statement::CreateVirtualTable { .. }
            | Statement::CreateView { .. }
            | Statement::CreateIndex { .. }
            | Statement::CreateSchema { .. }
            | Statement::CreateDatabase { .. }
            | Statement::CreateSequence { .. }
            | Statement::CreateFunction { .. }
            | Statement::CreateRole { .. }
            | Statement::AlterTable { .. }
            | Statement::AlterIndex { .. }
            | Statement::AlterView { .. }
            | Statement::AlterRole { .. }
            | Statement::Drop { .. }
            | Statement::DropFunction { .. } => Self::Ddl,
            _ => Self::Other,
        }
    }

    const fn is_write(self) -> bool {
        matches!(
            self,
            Self::Insert
                | Self::Update
                | Self::Delete
                | Self::Merge
                | Self::Copy
                | Self::Truncate
                | Self::Ddl
        )
    }

    const fn keyword(self) -> &'static str {
        match self {
            Self::Query => "SELECT",
            Self::Explain => "EXPLAIN",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Merge => "MERGE",
            Self::Copy => "COPY",
            Self::Truncate => "TRUNCATE",
            Self::Ddl => "DDL",
            Self::Other => "OTHER",
        }
    }
}

/// A single policy violation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: ViolationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    pub message: String,
}

impl Violation {
    fn new(kind: ViolationKind, identifier: Option<String>, message: impl Into<String>) -> Self {
        Self { kind, identifier, message: message.into() }
    }

    /// Log-safe rendering; identifiers are redacted when the policy asks for it
    #[must_use]
    pub fn loggable(&self, policy: &SecurityPolicy) -> String {
        match &self.identifier {
            Some(identifier) => format!("{} ({})", self.kind, policy.loggable(identifier)),
            None => self.kind.to_string(),
        }
    }
}

/// Outcome of validating one SQL string
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub allowed: bool,
    pub violations: Vec<Violation>,
    /// SQL to execute: rewritten with the row cap when allowed, the input otherwise
    pub sql: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement_kind: Option<StatementKind>,
    /// Search path the executor pins on the session
    pub search_path: Vec<String>,
    /// Effective row cap for this request
    pub row_cap: usize,
}

impl Verdict {
    /// The rejection as a pipeline error, if any
    #[must_use]
    pub fn to_error(&self) -> Option<QueryError> {
        let first = self.violations.first()?;
        let detail = self.violations.iter().map(|v| v.message.as_str()).collect::<Vec<_>>().join("; ");
        Some(QueryError::validation_rejected(first.kind, detail))
    }

    /// Violation reasons, phrased for a regeneration attempt
    #[must_use]
    pub fn feedback(&self) -> Vec<String> {
        self.violations.iter().map(|v| format!("{}: {}", v.kind, v.message)).collect()
    }
}

/// Parses and gates SQL for one database
#[derive(Debug, Clone)]
pub struct SqlValidator {
    policy: Arc<SecurityPolicy>,
    engine: DatabaseType,
}

impl SqlValidator {
    #[must_use]
    pub const fn new(policy: Arc<SecurityPolicy>, engine: DatabaseType) -> Self {
        Self { policy, engine }
    }

    #[must_use]
    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    fn dialect(&self) -> Box<dyn Dialect> {
        match self.engine {
            DatabaseType::Postgres => Box::new(PostgreSqlDialect {}),
            DatabaseType::MySQL => Box::new(MySqlDialect {}),
            DatabaseType::SQLite => Box::new(SQLiteDialect {}),
        }
    }

    /// Validate `sql`, capping rows at `min(requested_max_rows, policy.max_rows)`
    #[must_use]
    pub fn validate(&self, sql: &str, requested_max_rows: Option<usize>) -> Verdict {
        let row_cap = self.policy.row_cap(requested_max_rows);
        let reject = |kind: Option<StatementKind>, violations: Vec<Violation>| Verdict {
            allowed: false,
            violations,
            sql: sql.to_string(),
            statement_kind: kind,
            search_path: self.policy.search_path.clone(),
            row_cap,
        };

        let statements = match Parser::parse_sql(self.dialect().as_ref(), sql) {
            Ok(statements) => statements,
            Err(e) => {
                let violation = Violation::new(ViolationKind::ParseError, None, e.to_string());
                return reject(None, vec![violation]);
            }
        };
        let statement = match statements.as_slice() {
            [statement] => statement,
            [] => {
                let violation = Violation::new(ViolationKind::ParseError, None, "no SQL statement found");
                return reject(None, vec![violation]);
            }
            more => {
                let violation = Violation::new(
                    ViolationKind::MultipleStatements,
                    None,
                    format!("expected exactly one statement, found {}", more.len()),
                );
                return reject(None, vec![violation]);
            }
        };

        let kind = StatementKind::of(statement);
        if kind == StatementKind::Other {
            let violation = Violation::new(
                ViolationKind::StatementNotAllowed,
                None,
                "only queries, EXPLAIN, DML and DDL statements may be executed",
            );
            return reject(Some(kind), vec![violation]);
        }

        let analysis = Analysis::of(statement);
        let rules: [fn(&Self, &Analysis) -> Vec<Violation>; 5] = [
            Self::check_writes,
            Self::check_functions,
            Self::check_tables,
            Self::check_columns,
            Self::check_explain,
        ];
        for rule in rules {
            let violations = rule(self, &analysis);
            if !violations.is_empty() {
                return reject(Some(kind), violations);
            }
        }

        Verdict {
            allowed: true,
            violations: Vec::new(),
            sql: apply_row_cap(statement, row_cap),
            statement_kind: Some(kind),
            search_path: self.policy.search_path.clone(),
            row_cap,
        }
    }

    /// Whether `sql` would write; unparsable or multi-statement input counts as a write
    #[must_use]
    pub fn requires_write(&self, sql: &str) -> bool {
        match Parser::parse_sql(self.dialect().as_ref(), sql) {
            Ok(statements) => match statements.as_slice() {
                [statement] => !write_operations(&Analysis::of(statement)).is_empty(),
                _ => true,
            },
            Err(_) => true,
        }
    }

    fn check_writes(&self, analysis: &Analysis) -> Vec<Violation> {
        if self.policy.allow_write {
            return Vec::new();
        }
        write_operations(analysis)
            .into_iter()
            .map(|op| {
                Violation::new(
                    ViolationKind::WriteNotAllowed,
                    Some(op.to_string()),
                    format!("{op} is not allowed: the policy is read-only"),
                )
            })
            .collect()
    }

    fn check_functions(&self, analysis: &Analysis) -> Vec<Violation> {
        let mut violations = Vec::new();
        for name in &analysis.functions {
            if self.policy.is_function_blocked(name) {
                push_unique(
                    &mut violations,
                    Violation::new(
                        ViolationKind::BlockedFunction,
                        Some(name.clone()),
                        format!("function '{name}' is blocked by policy"),
                    ),
                );
            }
        }
        violations
    }

    fn check_tables(&self, analysis: &Analysis) -> Vec<Violation> {
        let mut violations = Vec::new();
        for relation in &analysis.relations {
            let table = last_segment(relation);
            if self.policy.is_table_blocked(&table) {
                push_unique(
                    &mut violations,
                    Violation::new(
                        ViolationKind::BlockedTable,
                        Some(table),
                        format!("table '{relation}' is blocked by policy"),
                    ),
                );
            }
        }
        // `FROM ONLY secrets` parses as table `only` aliased `secrets`
        for alias in analysis.tables.iter().filter_map(|t| t.alias.as_deref()) {
            if self.policy.is_table_blocked(alias) {
                push_unique(
                    &mut violations,
                    Violation::new(
                        ViolationKind::BlockedTable,
                        Some(alias.to_string()),
                        format!("alias '{alias}' names a blocked table"),
                    ),
                );
            }
        }
        violations
    }

    fn check_columns(&self, analysis: &Analysis) -> Vec<Violation> {
        let policy = &self.policy;
        if !analysis.tables.iter().any(|t| policy.has_blocked_columns(&t.name)) {
            return Vec::new();
        }

        let mut violations = Vec::new();
        let blocked = |table: &str, column: &str| {
            Violation::new(
                ViolationKind::BlockedColumn,
                Some(format!("{table}.{column}")),
                format!("column '{table}.{column}' is blocked by policy"),
            )
        };
        let whole_row = |table: &str| {
            Violation::new(
                ViolationKind::BlockedColumn,
                Some(format!("{table}.*")),
                format!("table '{table}' has blocked columns and cannot be read as a whole row"),
            )
        };

        for column in &analysis.columns {
            match column {
                ColumnRef::Qualified { qualifier, column } => {
                    for table in resolve(&analysis.tables, qualifier) {
                        if policy.is_column_blocked(table, column) {
                            push_unique(&mut violations, blocked(table, column));
                        }
                    }
                }
                ColumnRef::Bare(name) => {
                    for table in &analysis.tables {
                        if policy.is_column_blocked(&table.name, name) {
                            push_unique(&mut violations, blocked(&table.name, name));
                        }
                        if table.answers_to(name) && policy.has_blocked_columns(&table.name) {
                            push_unique(&mut violations, whole_row(&table.name));
                        }
                    }
                }
            }
        }

        for row in &analysis.rows {
            let covered: Vec<&str> = match row {
                RowRef::Qualified(qualifier) => resolve(&analysis.tables, qualifier),
                RowRef::All => analysis.tables.iter().map(|t| t.name.as_str()).collect(),
            };
            for table in covered {
                if policy.has_blocked_columns(table) {
                    push_unique(&mut violations, whole_row(table));
                }
            }
        }

        for select in analysis.selects() {
            let from = from_tables(&select.from);
            for item in &select.projection {
                let covered: Vec<&TableRef> = match item {
                    SelectItem::Wildcard(_) => from.iter().collect(),
                    SelectItem::QualifiedWildcard(name, _) => {
                        let qualifier = last_segment(name);
                        from.iter().filter(|t| t.answers_to(&qualifier)).collect()
                    }
                    _ => Vec::new(),
                };
                for table in covered {
                    if policy.has_blocked_columns(&table.name) {
                        push_unique(&mut violations, whole_row(&table.name));
                    }
                }
            }
        }

        violations
    }

    fn check_explain(&self, analysis: &Analysis) -> Vec<Violation> {
        if analysis.kind != StatementKind::Explain || self.policy.allow_explain {
            return Vec::new();
        }
        vec![Violation::new(
            ViolationKind::ExplainNotAllowed,
            None,
            "EXPLAIN statements are disabled by policy",
        )]
    }
}

fn push_unique(violations: &mut Vec<Violation>, violation: Violation) {
    if !violations.iter().any(|v| v.kind == violation.kind && v.identifier == violation.identifier) {
        violations.push(violation);
    }
}

fn last_segment(name: &ObjectName) -> String {
    name.0.last().map(|ident| ident.value.to_lowercase()).unwrap_or_default()
}

/// Write operations found anywhere in the statement, in order of appearance
fn write_operations(analysis: &Analysis) -> Vec<&'static str> {
    let mut ops: Vec<&'static str> = Vec::new();
    let mut push = |op: &'static str| {
        if !ops.contains(&op) {
            ops.push(op);
        }
    };
    for kind in &analysis.statement_kinds {
        if kind.is_write() {
            push(kind.keyword());
        }
    }
    if analysis.queries().iter().any(|q| !q.locks.is_empty()) {
        push("SELECT ... FOR UPDATE/SHARE");
    }
    if analysis.selects().iter().any(|s| s.into.is_some()) {
        push("SELECT INTO");
    }
    ops
}

/// Rewrite a top-level query so it carries `LIMIT cap`
///
/// A missing LIMIT is injected, a larger or non-literal one is replaced, and a smaller
/// literal one is kept. Queries using FETCH are left alone; the executor caps them.
fn apply_row_cap(statement: &Statement, cap: usize) -> String {
    let mut statement = statement.clone();
    if let Statement::Query(query) = &mut statement {
        if query.fetch.is_none() {
            let keep = match &query.limit {
                Some(Expr::Value(Value::Number(n, _))) => n.parse::<usize>().is_ok_and(|n| n <= cap),
                _ => false,
            };
            if !keep {
                query.limit = Some(Expr::Value(Value::Number(cap.to_string(), false)));
            }
        }
    }
    statement.to_string()
}

/// A table in FROM/JOIN, with its alias
#[derive(Debug, Clone, PartialEq, Eq)]
struct TableRef {
    name: String,
    alias: Option<String>,
}

impl TableRef {
    fn answers_to(&self, qualifier: &str) -> bool {
        self.name == qualifier || self.alias.as_deref() == Some(qualifier)
    }
}

fn table_ref(factor: &TableFactor) -> Option<TableRef> {
    match factor {
        TableFactor::Table { name, alias, args: None, .. } => Some(TableRef {
            name: last_segment(name),
            alias: alias.as_ref().map(|a| a.name.value.to_lowercase()),
        }),
        _ => None,
    }
}

/// Tables a qualifier can refer to; an unknown qualifier is taken as a table name
fn resolve<'a>(tables: &'a [TableRef], qualifier: &'a str) -> Vec<&'a str> {
    let matched: Vec<&str> =
        tables.iter().filter(|t| t.answers_to(qualifier)).map(|t| t.name.as_str()).collect();
    if matched.is_empty() {
        vec![qualifier]
    } else {
        matched
    }
}

fn from_tables(from: &[TableWithJoins]) -> Vec<TableRef> {
    fn factor(out: &mut Vec<TableRef>, factor_ref: &TableFactor) {
        if let TableFactor::NestedJoin { table_with_joins, .. } = factor_ref {
            walk(out, table_with_joins);
        } else if let Some(table) = table_ref(factor_ref) {
            out.push(table);
        }
    }
    fn walk(out: &mut Vec<TableRef>, twj: &TableWithJoins) {
        factor(out, &twj.relation);
        for join in &twj.joins {
            factor(out, &join.relation);
        }
    }

    let mut out = Vec::new();
    for twj in from {
        walk(&mut out, twj);
    }
    out
}

/// A whole row handed to a function, as in `row_to_json(u.*)`
#[derive(Debug, Clone, PartialEq, Eq)]
enum RowRef {
    Qualified(String),
    /// Unqualified `*`: every table in the statement
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ColumnRef {
    Bare(String),
    Qualified { qualifier: String, column: String },
}

/// Everything the rules need, collected in one walk of the statement
#[derive(Debug)]
struct Analysis {
    kind: StatementKind,
    /// Top-level query (also the one under EXPLAIN)
    root: Option<Query>,
    statement_kinds: Vec<StatementKind>,
    relations: Vec<ObjectName>,
    tables: Vec<TableRef>,
    functions: Vec<String>,
    columns: Vec<ColumnRef>,
    rows: Vec<RowRef>,
    subqueries: Vec<Query>,
}

impl Analysis {
    fn of(statement: &Statement) -> Self {
        let root = match statement {
            Statement::Query(query) => Some(query.as_ref().clone()),
            Statement::Explain { statement, .. } => match statement.as_ref() {
                Statement::Query(query) => Some(query.as_ref().clone()),
                _ => None,
            },
            _ => None,
        };

        let mut analysis = Self {
            kind: StatementKind::of(statement),
            root,
            statement_kinds: Vec::new(),
            relations: Vec::new(),
            tables: Vec::new(),
            functions: Vec::new(),
            columns: Vec::new(),
            rows: Vec::new(),
            subqueries: Vec::new(),
        };
        let _ = statement.visit(&mut analysis);
        analysis
    }

    /// Every query node: the root, subqueries, derived tables, CTE bodies and set operands
    fn queries(&self) -> Vec<&Query> {
        let mut queries = Vec::new();
        let mut selects = Vec::new();
        for query in self.root.iter().chain(self.subqueries.iter()) {
            walk_query(query, &mut queries, &mut selects);
        }
        queries
    }

    fn selects(&self) -> Vec<&Select> {
        let mut queries = Vec::new();
        let mut selects = Vec::new();
        for query in self.root.iter().chain(self.subqueries.iter()) {
            walk_query(query, &mut queries, &mut selects);
        }
        selects
    }
}

fn walk_query<'a>(query: &'a Query, queries: &mut Vec<&'a Query>, selects: &mut Vec<&'a Select>) {
    queries.push(query);
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            walk_query(&cte.query, queries, selects);
        }
    }
    walk_set_expr(&query.body, queries, selects);
}

fn walk_set_expr<'a>(body: &'a SetExpr, queries: &mut Vec<&'a Query>, selects: &mut Vec<&'a Select>) {
    match body {
        SetExpr::Select(select) => selects.push(&**select),
        SetExpr::Query(query) => walk_query(query, queries, selects),
        SetExpr::SetOperation { left, right, .. } => {
            walk_set_expr(left, queries, selects);
            walk_set_expr(right, queries, selects);
        }
        _ => {}
    }
}

impl Visitor for Analysis {
    type Break = ();

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(relation.clone());
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { name, args: Some(_), .. } => self.functions.push(last_segment(name)),
            TableFactor::Derived { subquery, .. } => self.subqueries.push(subquery.as_ref().clone()),
            other => {
                if let Some(table) = table_ref(other) {
                    self.tables.push(table);
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Function(function) => {
                let name = last_segment(&function.name);
                if name != "count" {
                    for arg in &function.args {
                        let (FunctionArg::Named { arg, .. } | FunctionArg::Unnamed(arg)) = arg;
                        match arg {
                            FunctionArgExpr::QualifiedWildcard(qualifier) => {
                                self.rows.push(RowRef::Qualified(last_segment(qualifier)));
                            }
                            FunctionArgExpr::Wildcard => self.rows.push(RowRef::All),
                            FunctionArgExpr::Expr(_) => {}
                        }
                    }
                }
                self.functions.push(name);
            }
            Expr::Identifier(ident) => self.columns.push(ColumnRef::Bare(ident.value.to_lowercase())),
            Expr::CompoundIdentifier(idents) => match idents.as_slice() {
                [.., qualifier, column] => self.columns.push(ColumnRef::Qualified {
                    qualifier: qualifier.value.to_lowercase(),
                    column: column.value.to_lowercase(),
                }),
                [only] => self.columns.push(ColumnRef::Bare(only.value.to_lowercase())),
                [] => {}
            },
            Expr::Subquery(subquery)
            | Expr::Exists { subquery, .. }
            | Expr::InSubquery { subquery, .. } => self.subqueries.push(subquery.as_ref().clone()),
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        self.statement_kinds.push(StatementKind::of(statement));
        match statement {
            Statement::ExplainTable { table_name, .. } | Statement::Insert { table_name, .. } => {
                self.relations.push(table_name.clone());
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
