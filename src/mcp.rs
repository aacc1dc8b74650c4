//! MCP (Model Context Protocol) Server
//!
//! This module implements an MCP server using manual JSON-RPC 2.0 over stdio.
//!
//! # Architecture
//!
//! - **Transport**: JSON-RPC 2.0 over stdio (line-based)
//! - **Dependencies**: `serde_json`, `schemars` for the tool input schema, and anyhow
//! - **Concurrency**: each `tools/call` runs on its own task; responses are funnelled
//!   through one writer task, so lines never interleave
//!
//! # MCP Tools
//!
//! - `query` - Answer a natural-language question against a configured database
//!
//! # Usage
//!
//! Start the MCP server with: `querygate serve`
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "querygate": {
//!       "command": "querygate",
//!       "args": ["serve", "--config", "/etc/querygate/config.json"]
//!     }
//!   }
//! }
//! ```

use std::sync::Arc;

use anyhow::{anyhow, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::orchestrator::{QueryOrchestrator, QueryRequest};
use crate::output::QueryResponse;

const PROTOCOL_VERSION: &str = "2024-11-05";

// ============================================================================
// JSON-RPC 2.0 Structures
// ============================================================================

/// JSON-RPC 2.0 Request
#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    fn err(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError { code, message: message.into() }),
        }
    }
}

// ============================================================================
// MCP Tool Result Structures
// ============================================================================

/// Text content block for MCP tool results
#[derive(Debug, Serialize)]
struct TextContent {
    #[serde(rename = "type")]
    content_type: String,
    text: String,
}

/// MCP tool call result
#[derive(Debug, Serialize)]
struct CallToolResult {
    content: Vec<TextContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

impl CallToolResult {
    /// Wrap a pipeline response; a FAILED response is flagged as a tool error
    fn from_response(response: &QueryResponse) -> Result<Value> {
        let text = serde_json::to_string_pretty(response)?;
        let result = Self {
            content: vec![TextContent { content_type: "text".to_string(), text }],
            is_error: !response.is_complete(),
        };
        Ok(serde_json::to_value(result)?)
    }
}

/// Arguments of the `query` tool
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QueryToolArgs {
    /// Question to answer, in plain language
    pub natural_language: String,
    /// Configured database to query; the default database when omitted
    #[serde(default)]
    pub database: Option<String>,
    /// Maximum rows to return, bounded by the database policy
    #[serde(default)]
    pub max_rows: Option<usize>,
}

impl From<QueryToolArgs> for QueryRequest {
    fn from(args: QueryToolArgs) -> Self {
        Self {
            natural_language: args.natural_language,
            database: args.database,
            max_rows: args.max_rows,
            request_id: uuid::Uuid::new_v4(),
        }
    }
}

// ============================================================================
// MCP Server
// ============================================================================

/// Start the MCP server on stdin/stdout
///
/// Returns when stdin closes and every in-flight call has been answered.
pub async fn serve(orchestrator: Arc<QueryOrchestrator>) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve_io(orchestrator, stdin, tokio::io::stdout()).await
}

/// Run the server loop over arbitrary line-based streams
pub async fn serve_io<R, W>(orchestrator: Arc<QueryOrchestrator>, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_lines(rx, writer));

    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                send(&tx, &JsonRpcResponse::err(None, -32700, format!("Parse error: {e}")));
                continue;
            }
        };
        debug!(method = %request.method, "mcp request");

        if request.method == "tools/call" {
            let orchestrator = orchestrator.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let id = request.id.clone();
                let response = match handle_call_tool(&orchestrator, request.params).await {
                    Ok(value) => JsonRpcResponse::ok(id, value),
                    Err(e) => JsonRpcResponse::err(id, -32602, e.to_string()),
                };
                send(&tx, &response);
            });
            continue;
        }

        if let Some(response) = handle_request(request) {
            send(&tx, &response);
        }
    }

    // The writer finishes once every spawned call has dropped its sender.
    drop(tx);
    writer_task.await?
}

fn send(tx: &mpsc::UnboundedSender<String>, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            if tx.send(line).is_err() {
                warn!("mcp writer closed, dropping response");
            }
        }
        Err(e) => warn!(error = %e, "could not serialize mcp response"),
    }
}

async fn write_lines<W>(mut rx: mpsc::UnboundedReceiver<String>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Handle a synchronous JSON-RPC request; notifications get no response
fn handle_request(request: JsonRpcRequest) -> Option<JsonRpcResponse> {
    let result = match request.method.as_str() {
        "initialize" => handle_initialize(),
        "tools/list" => handle_list_tools(),
        "ping" => Ok(serde_json::json!({})),
        method if method.starts_with("notifications/") => return None,
        method => {
            return Some(JsonRpcResponse::err(request.id, -32601, format!("Unknown method: {method}")));
        }
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::ok(request.id, value),
        Err(e) => JsonRpcResponse::err(request.id, -32603, e.to_string()),
    })
}

// ============================================================================
// MCP Protocol Handlers
// ============================================================================

/// Returns server capabilities and metadata.
fn handle_initialize() -> Result<Value> {
    Ok(serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": {}
        },
        "serverInfo": {
            "name": "querygate",
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

/// Returns the `query` tool with its generated input schema.
fn handle_list_tools() -> Result<Value> {
    let schema = serde_json::to_value(schemars::schema_for!(QueryToolArgs))?;
    Ok(serde_json::json!({
        "tools": [
            {
                "name": "query",
                "description": "Answer a question about a configured database. The question is turned into SQL, checked against the database's security policy (read-only unless writes are allowed, blocked tables, columns and functions), executed with a row cap and a time limit, and returned as JSON rows. Returns {status, sql_used, rows, row_count, truncated, tokens_used, error?, warnings}. A FAILED status carries error.kind and error.retriable; retry later only when retriable is true. Use max_rows to keep responses small.",
                "inputSchema": schema
            }
        ]
    }))
}

async fn handle_call_tool(orchestrator: &QueryOrchestrator, params: Option<Value>) -> Result<Value> {
    let params = params.ok_or_else(|| anyhow!("Missing params"))?;
    let name = params["name"].as_str().ok_or_else(|| anyhow!("Missing tool name"))?;

    match name {
        "query" => {
            let args: QueryToolArgs = serde_json::from_value(params["arguments"].clone())
                .map_err(|e| anyhow!("Invalid arguments for 'query': {e}"))?;
            let response = orchestrator.query(args.into()).await;
            CallToolResult::from_response(&response)
        }
        _ => Err(anyhow!("Unknown tool: {name}")),
    }
}
