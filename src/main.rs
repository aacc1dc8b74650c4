//! querygate CLI Entry Point
//!
//! Subcommands:
//! - `serve` - MCP server on stdio
//! - `query` - One-shot natural-language query
//! - `check` - Validate SQL against a database policy without executing it
//!
//! All output to stdout is JSON-only. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::error;
use tracing_subscriber::EnvFilter;

use querygate::output::CheckReport;
use querygate::{
    HttpGenerator, QueryError, QueryOrchestrator, QueryRequest, QueryResponse, Settings, SqlValidator,
};

/// querygate - natural-language query gateway for AI agents
#[derive(Parser)]
#[command(name = "querygate")]
#[command(about = "Natural-language query gateway with a structural SQL policy engine")]
#[command(version)]
struct Cli {
    /// Settings file (defaults to $QUERYGATE_CONFIG, then the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP server on stdio
    Serve,

    /// Answer one natural-language question and print the response
    Query {
        /// The question
        natural_language: String,

        /// Configured database name
        #[arg(long)]
        database: Option<String>,

        /// Maximum rows to return
        #[arg(long)]
        max_rows: Option<usize>,
    },

    /// Print the validation verdict for SQL without executing it
    Check {
        /// SQL to validate
        #[arg(long)]
        sql: String,

        /// Configured database name
        #[arg(long)]
        database: Option<String>,

        /// Maximum rows to apply to the rewritten SQL
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => return fail(&e),
    };

    match cli.command {
        Commands::Serve => {
            let orchestrator = match build_orchestrator(&settings).await {
                Ok(orchestrator) => orchestrator,
                Err(e) => return fail(&e),
            };
            match querygate::mcp::serve(Arc::new(orchestrator)).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "mcp server stopped");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Query { natural_language, database, max_rows } => {
            let orchestrator = match build_orchestrator(&settings).await {
                Ok(orchestrator) => orchestrator,
                Err(e) => return fail(&e),
            };
            let request = QueryRequest { database, max_rows, ..QueryRequest::new(natural_language) };
            let response = orchestrator.query(request).await;
            print_json(&response);
            if response.is_complete() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Check { sql, database, max_rows } => match check(&settings, &sql, database.as_deref(), max_rows) {
            Ok(report) => {
                print_json(&report);
                if report.verdict.allowed {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                }
            }
            Err(e) => fail(&e),
        },
    }
}

fn load_settings(explicit: Option<&Path>) -> querygate::Result<Settings> {
    let path = querygate::config::resolve_config_path(explicit)?;
    Settings::load(&path)
}

async fn build_orchestrator(settings: &Settings) -> querygate::Result<QueryOrchestrator> {
    let endpoint = settings
        .generator
        .endpoint
        .as_deref()
        .ok_or_else(|| QueryError::config_error("generator.endpoint is not configured"))?;
    let generator = HttpGenerator::new(endpoint, settings.generator_timeout()?)?;
    QueryOrchestrator::from_settings(settings, Arc::new(generator)).await
}

/// Validate without connecting: the verdict depends only on the policy and the engine
fn check(
    settings: &Settings,
    sql: &str,
    database: Option<&str>,
    max_rows: Option<usize>,
) -> querygate::Result<CheckReport> {
    let name = match database.filter(|n| !n.is_empty()) {
        Some(name) => name,
        None => settings.default_database_name()?,
    };
    let target = settings.databases.get(name).ok_or_else(|| QueryError::UnknownDatabase {
        name: name.to_string(),
        available: settings.databases.keys().cloned().collect(),
    })?;

    let policy = settings.security_policy()?.with_overrides(&target.policy)?;
    let engine = target.connection.engine;
    let verdict = SqlValidator::new(Arc::new(policy), engine).validate(sql, max_rows);
    Ok(CheckReport { database: name.to_string(), engine: engine.to_string(), verdict })
}

fn fail(err: &QueryError) -> ExitCode {
    error!(kind = err.kind(), error = %err, "startup failed");
    print_json(&QueryResponse::failed(err, "startup", None, 0, Vec::new()));
    ExitCode::FAILURE
}

fn print_json(value: &impl Serialize) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "could not serialize output"),
    }
}
