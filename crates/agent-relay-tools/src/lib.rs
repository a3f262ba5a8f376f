//! Tool bridge for the agent runtime.
//!
//! Tools live on remote MCP servers. [`McpManager`] holds one client per
//! configured server and implements [`ToolBridge`], the seam the LLM agent
//! uses to advertise and invoke tools.

use async_trait::async_trait;
use serde_json::Value;

use agent_relay_core::run::ToolSpec;

pub mod client;
pub mod error;
pub mod http;
pub mod manager;
pub mod protocol;
pub mod stdio;
pub mod transport;

pub use client::McpClient;
pub use error::McpError;
pub use manager::McpManager;
pub use protocol::{CallToolResult, ToolContent};

/// Tool discovery and invocation, independent of where tools run.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    /// Every tool currently available, in a stable order.
    async fn list_tools(&self) -> error::Result<Vec<ToolSpec>>;

    /// Invoke a tool previously returned by [`ToolBridge::list_tools`].
    async fn call_tool(&self, name: &str, arguments: Value) -> error::Result<CallToolResult>;
}
