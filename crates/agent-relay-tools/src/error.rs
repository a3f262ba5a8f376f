use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("MCP request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("MCP request aborted")]
    Aborted,

    #[error("MCP server '{0}' is not connected")]
    NotConnected(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid MCP server config: {0}")]
    InvalidConfig(String),

    #[error("MCP JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, McpError>;
