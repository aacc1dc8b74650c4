//! Result sanity checks run after execution.

use crate::executor::ExecutionResult;
use crate::validator::{StatementKind, Verdict};

/// Checks a result before it is returned to the caller
///
/// `Err` carries a reason that is fed back to the generator on regeneration.
pub trait ResultValidator: Send + Sync {
    fn check(&self, verdict: &Verdict, result: &ExecutionResult) -> std::result::Result<(), String>;
}

/// Structural checks on the returned shape
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeValidator;

impl ResultValidator for ShapeValidator {
    fn check(&self, verdict: &Verdict, result: &ExecutionResult) -> std::result::Result<(), String> {
        if result.row_count != result.rows.len() {
            return Err(format!(
                "row count {} does not match {} returned rows",
                result.row_count,
                result.rows.len()
            ));
        }
        if result.rows.len() > verdict.row_cap {
            return Err(format!(
                "{} rows returned, exceeding the cap of {}",
                result.rows.len(),
                verdict.row_cap
            ));
        }
        if verdict.statement_kind == Some(StatementKind::Query) && result.columns.is_empty() {
            return Err("query returned no columns".to_string());
        }
        let width = result.columns.len();
        if let Some(index) = result.rows.iter().position(|row| row.len() != width) {
            return Err(format!(
                "row {index} has {} values for {width} columns",
                result.rows[index].len()
            ));
        }
        Ok(())
    }
}
