//! SQLite End-to-End Tests
//!
//! Runs the full pipeline against real SQLite files in the temp directory, with a scripted
//! generator standing in for the model.

#![cfg(feature = "sqlite")]

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::ScriptedGenerator;
use querygate::{QueryOrchestrator, QueryRequest, ResponseStatus, Settings};

/// Create a database with eight users and a secrets table
fn create_test_db(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("querygate_e2e_{name}_{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let conn = rusqlite::Connection::open(&path).expect("Failed to create temp database");
    conn.execute_batch(
        "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL, email TEXT, signup_date TEXT);
         CREATE TABLE secrets (id INTEGER PRIMARY KEY, token TEXT);
         INSERT INTO secrets (token) VALUES ('hunter2');",
    )
    .expect("Failed to create schema");
    for i in 1..=8 {
        conn.execute(
            "INSERT INTO users (name, email, signup_date) VALUES (?1, ?2, ?3)",
            rusqlite::params![format!("user{i}"), format!("user{i}@example.com"), format!("2024-01-0{i}")],
        )
        .expect("Failed to insert user");
    }
    path
}

async fn orchestrator(path: &PathBuf, generator: Arc<ScriptedGenerator>) -> QueryOrchestrator {
    let settings = json!({
        "databases": {
            "default": { "engine": "sqlite", "file": path }
        },
        "security": {
            "blocked_tables": ["secrets"],
            "blocked_columns": ["users.email"]
        }
    });
    let settings = Settings::from_json(&settings.to_string()).unwrap();
    QueryOrchestrator::from_settings(&settings, generator).await.unwrap()
}

fn user_count(path: &PathBuf) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0)).unwrap()
}

#[tokio::test]
async fn test_top_users_by_signup_date() {
    let path = create_test_db("top_users");
    let generator = ScriptedGenerator::always("SELECT name, signup_date FROM users ORDER BY signup_date DESC", 1);
    let orchestrator = orchestrator(&path, generator.clone()).await;

    let request = QueryRequest::new("top 5 users by signup date").with_database("default").with_max_rows(5);
    let response = orchestrator.query(request).await;

    assert_eq!(response.status, ResponseStatus::Complete);
    assert!(response.row_count <= 5);
    assert_eq!(response.row_count, 5);
    assert_eq!(response.rows[0]["name"], json!("user8"));
    assert_eq!(response.rows[0]["signup_date"], json!("2024-01-08"));
    assert_eq!(
        response.sql_used.as_deref(),
        Some("SELECT name, signup_date FROM users ORDER BY signup_date DESC LIMIT 5")
    );
    assert!(response.truncated);
    assert_eq!(response.tokens_used, 25);

    // The generator saw the schema without blocked tables or columns.
    let schema = &generator.requests()[0].schema_context;
    assert!(schema.contains("users(id INTEGER, name TEXT, signup_date TEXT)"));
    assert!(!schema.contains("secrets"));
    assert!(!schema.contains("email"));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_explicit_limit_is_clamped() {
    let path = create_test_db("clamp");
    let generator = ScriptedGenerator::always("SELECT id FROM users LIMIT 100", 1);
    let orchestrator = orchestrator(&path, generator).await;

    let response = orchestrator.query(QueryRequest::new("ids").with_max_rows(3)).await;

    assert_eq!(response.row_count, 3);
    assert_eq!(response.sql_used.as_deref(), Some("SELECT id FROM users LIMIT 3"));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_write_is_rejected_and_data_untouched() {
    let path = create_test_db("write");
    let generator = ScriptedGenerator::new(vec![Ok("DELETE FROM users"), Ok("DROP TABLE users")]);
    let orchestrator = orchestrator(&path, generator.clone()).await;

    let response = orchestrator.query(QueryRequest::new("remove every user")).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, "ValidationRejected");
    assert!(error.message.contains("WriteNotAllowed"));
    assert_eq!(generator.calls(), 2);
    assert!(generator.requests()[1].prior_violations[0].starts_with("WriteNotAllowed"));
    assert_eq!(user_count(&path), 8);

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_blocked_column_is_rejected() {
    let path = create_test_db("column");
    let generator = ScriptedGenerator::new(vec![Ok("SELECT u.email FROM users u"), Ok("SELECT name FROM users")]);
    let orchestrator = orchestrator(&path, generator).await;

    let response = orchestrator.query(QueryRequest::new("user names")).await;

    assert_eq!(response.status, ResponseStatus::Complete);
    assert_eq!(response.row_count, 8);
    assert_eq!(response.warnings.len(), 1);
    assert!(response.warnings[0].contains("BlockedColumn"));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_database_error_is_sanitized() {
    let path = create_test_db("missing");
    let generator = ScriptedGenerator::always("SELECT nickname FROM users", 1);
    let orchestrator = orchestrator(&path, generator).await;

    let response = orchestrator.query(QueryRequest::new("nicknames")).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, "ExecutionError");
    assert_eq!(error.stage, "executing");
    assert!(error.message.contains("nickname"));
    assert!(!error.message.contains('\n'));

    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn test_unknown_database() {
    let path = create_test_db("unknown");
    let generator = ScriptedGenerator::always("SELECT 1", 1);
    let orchestrator = orchestrator(&path, generator.clone()).await;

    let response = orchestrator.query(QueryRequest::new("anything").with_database("warehouse")).await;

    let error = response.error.unwrap();
    assert_eq!(error.kind, "UnknownDatabase");
    assert!(error.message.contains("default"));
    assert_eq!(generator.calls(), 0);

    let _ = std::fs::remove_file(&path);
}
