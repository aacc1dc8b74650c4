//! Security Policy
//!
//! The policy gating every candidate SQL string. It is built once from settings
//! ([`PolicySettings`], every field optional) into a fully populated, validated
//! [`SecurityPolicy`]; a database may override any field of the global policy.
//! A built policy is immutable and shared by `Arc` for the lifetime of the process.
//!
//! # Identifier Normalization
//! Blocked function, table and column names are stored lowercase and unqualified:
//! `public.Secrets` blocks `secrets` in every schema. Blocked columns are written
//! `table.column` (or `schema.table.column`).

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, Result};

/// Default maximum rows returned by a single statement
pub const DEFAULT_MAX_ROWS: usize = 1000;

/// Default statement execution time limit
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(30);

/// Functions blocked unless settings replace the list
pub const DEFAULT_BLOCKED_FUNCTIONS: &[&str] = &[
    // PostgreSQL
    "pg_sleep",
    "pg_read_file",
    "pg_read_binary_file",
    "pg_ls_dir",
    "pg_stat_file",
    "pg_terminate_backend",
    "pg_cancel_backend",
    "pg_reload_conf",
    "set_config",
    "lo_import",
    "lo_export",
    "dblink",
    "dblink_exec",
    "query_to_xml",
    "query_to_xmlschema",
    "query_to_xml_and_xmlschema",
    "table_to_xml",
    "table_to_xmlschema",
    "table_to_xml_and_xmlschema",
    "cursor_to_xml",
    "cursor_to_xmlschema",
    "schema_to_xml",
    "schema_to_xmlschema",
    "schema_to_xml_and_xmlschema",
    "database_to_xml",
    "database_to_xmlschema",
    "database_to_xml_and_xmlschema",
    // MySQL
    "sleep",
    "benchmark",
    "load_file",
    // SQLite
    "load_extension",
];

const REDACTED: &str = "<redacted>";

/// Policy fields as they appear in settings
///
/// Every field is optional. Absent fields inherit from the policy being overridden
/// (the built-in defaults for the global policy).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_write: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_explain: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_functions: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_tables: Option<Vec<String>>,

    /// `table.column` entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_columns: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_time_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly_role: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_path: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redact_identifiers: Option<bool>,
}

/// Fully populated, validated security policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityPolicy {
    pub allow_write: bool,
    pub allow_explain: bool,
    pub blocked_functions: BTreeSet<String>,
    pub blocked_tables: BTreeSet<String>,
    /// table → blocked columns of that table
    pub blocked_columns: BTreeMap<String, BTreeSet<String>>,
    pub max_rows: usize,
    #[serde(serialize_with = "serialize_millis")]
    pub max_execution_time: Duration,
    pub readonly_role: Option<String>,
    pub search_path: Vec<String>,
    pub redact_identifiers: bool,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow_write: false,
            allow_explain: false,
            blocked_functions: DEFAULT_BLOCKED_FUNCTIONS.iter().map(|f| (*f).to_string()).collect(),
            blocked_tables: BTreeSet::new(),
            blocked_columns: BTreeMap::new(),
            max_rows: DEFAULT_MAX_ROWS,
            max_execution_time: DEFAULT_MAX_EXECUTION_TIME,
            readonly_role: None,
            search_path: vec!["public".to_string()],
            redact_identifiers: false,
        }
    }
}

impl SecurityPolicy {
    /// Build the global policy from settings over the built-in defaults
    pub fn build(settings: &PolicySettings) -> Result<Self> {
        Self::default().with_overrides(settings)
    }

    /// Derive a policy with `overrides` applied on top of this one
    pub fn with_overrides(&self, overrides: &PolicySettings) -> Result<Self> {
        let mut policy = self.clone();

        if let Some(allow_write) = overrides.allow_write {
            policy.allow_write = allow_write;
        }
        if let Some(allow_explain) = overrides.allow_explain {
            policy.allow_explain = allow_explain;
        }
        if let Some(functions) = &overrides.blocked_functions {
            policy.blocked_functions = functions
                .iter()
                .map(|f| normalize_name(f, "blocked function"))
                .collect::<Result<_>>()?;
        }
        if let Some(tables) = &overrides.blocked_tables {
            policy.blocked_tables = tables
                .iter()
                .map(|t| normalize_name(t, "blocked table"))
                .collect::<Result<_>>()?;
        }
        if let Some(columns) = &overrides.blocked_columns {
            let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for entry in columns {
                let (table, column) = parse_blocked_column(entry)?;
                map.entry(table).or_default().insert(column);
            }
            policy.blocked_columns = map;
        }
        if let Some(max_rows) = overrides.max_rows {
            if max_rows == 0 {
                return Err(QueryError::config_error("max_rows must be at least 1"));
            }
            policy.max_rows = max_rows;
        }
        if let Some(ms) = overrides.max_execution_time_ms {
            if ms == 0 {
                return Err(QueryError::config_error("max_execution_time_ms must be at least 1"));
            }
            policy.max_execution_time = Duration::from_millis(ms);
        }
        if let Some(role) = &overrides.readonly_role {
            policy.readonly_role = if role.is_empty() {
                None
            } else {
                validate_identifier(role, "readonly_role")?;
                Some(role.clone())
            };
        }
        if let Some(path) = &overrides.search_path {
            if path.is_empty() {
                return Err(QueryError::config_error("search_path must name at least one schema"));
            }
            for schema in path {
                validate_identifier(schema, "search_path entry")?;
            }
            policy.search_path = path.clone();
        }
        if let Some(redact) = overrides.redact_identifiers {
            policy.redact_identifiers = redact;
        }

        Ok(policy)
    }

    #[must_use]
    pub fn is_function_blocked(&self, name: &str) -> bool {
        self.blocked_functions.contains(&name.to_lowercase())
    }

    #[must_use]
    pub fn is_table_blocked(&self, name: &str) -> bool {
        self.blocked_tables.contains(&name.to_lowercase())
    }

    /// Whether `table` has any blocked column
    #[must_use]
    pub fn has_blocked_columns(&self, table: &str) -> bool {
        self.blocked_columns.contains_key(&table.to_lowercase())
    }

    #[must_use]
    pub fn is_column_blocked(&self, table: &str, column: &str) -> bool {
        self.blocked_columns
            .get(&table.to_lowercase())
            .is_some_and(|columns| columns.contains(&column.to_lowercase()))
    }

    /// Effective row cap for a request
    #[must_use]
    pub fn row_cap(&self, requested: Option<usize>) -> usize {
        requested.map_or(self.max_rows, |r| r.min(self.max_rows))
    }

    /// Identifier as it may appear in logs and traces
    #[must_use]
    pub fn loggable<'a>(&self, identifier: &'a str) -> Cow<'a, str> {
        if self.redact_identifiers {
            Cow::Borrowed(REDACTED)
        } else {
            Cow::Borrowed(identifier)
        }
    }
}

fn normalize_name(raw: &str, what: &str) -> Result<String> {
    let name = raw.trim().rsplit('.').next().unwrap_or_default().trim().to_lowercase();
    if name.is_empty() {
        return Err(QueryError::config_error(format!("{what} name cannot be empty")));
    }
    Ok(name)
}

fn parse_blocked_column(entry: &str) -> Result<(String, String)> {
    let Some((table, column)) = entry.trim().rsplit_once('.') else {
        return Err(QueryError::config_error(format!(
            "blocked column '{entry}' must be written as table.column"
        )));
    };
    let table = normalize_name(table, "blocked column table")?;
    let column = column.trim().to_lowercase();
    if column.is_empty() {
        return Err(QueryError::config_error(format!("blocked column '{entry}' has no column name")));
    }
    Ok((table, column))
}

fn validate_identifier(value: &str, what: &str) -> Result<()> {
    if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(QueryError::config_error(format!(
            "{what} '{value}' may only contain letters, digits and underscores"
        )));
    }
    Ok(())
}
