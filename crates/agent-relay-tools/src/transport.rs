//! Transport seam between the MCP client and a remote tool server.

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Transport name for logs ("http", "stdio").
    fn kind(&self) -> &'static str;

    /// Send one message. Requests resolve to their response; notifications
    /// (and acknowledged-but-empty replies) resolve to `None`.
    async fn send(&self, message: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>>;

    /// Tear down the transport. Never fails; remote errors are logged.
    async fn close(&self);
}
