//! MCP client: handshake, tool discovery and tool calls over any transport.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use agent_relay_core::config::McpServerConfig;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{McpError, Result};
use crate::http::HttpTransport;
use crate::protocol::{CallToolResult, JsonRpcRequest, ListToolsResult, McpTool, PROTOCOL_VERSION};
use crate::stdio::StdioTransport;
use crate::transport::McpTransport;

pub struct McpClient {
    server_id: String,
    transport: Box<dyn McpTransport>,
    next_id: AtomicI64,
}

impl McpClient {
    pub fn new(server_id: impl Into<String>, transport: Box<dyn McpTransport>) -> Self {
        Self {
            server_id: server_id.into(),
            transport,
            next_id: AtomicI64::new(1),
        }
    }

    /// Build the transport for `config` and run the initialize handshake.
    pub async fn connect(server_id: &str, config: &McpServerConfig) -> Result<Self> {
        config.check().map_err(McpError::InvalidConfig)?;
        let timeout = Duration::from_secs(config.timeout_secs());

        let transport: Box<dyn McpTransport> = match (&config.url, &config.command) {
            (Some(url), None) => Box::new(HttpTransport::new(url.as_str(), &config.headers, timeout)?),
            (None, Some(command)) => Box::new(StdioTransport::spawn(
                server_id,
                command,
                &config.args,
                &config.env,
                timeout,
            )?),
            _ => return Err(McpError::InvalidConfig(format!("server '{server_id}' needs exactly one transport"))),
        };

        let client = Self::new(server_id, transport);
        if let Err(e) = client.initialize().await {
            client.close().await;
            return Err(e);
        }
        Ok(client)
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// `initialize` request followed by the `notifications/initialized` notification.
    pub async fn initialize(&self) -> Result<Value> {
        let result = self
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "agent-relay",
                        "version": env!("CARGO_PKG_VERSION"),
                    }
                }),
            )
            .await?;
        debug!(server_id = %self.server_id, ?result, "MCP initialize response");

        self.notify("notifications/initialized", None).await?;

        info!(
            server_id = %self.server_id,
            transport = self.transport.kind(),
            "MCP client connected"
        );
        Ok(result)
    }

    /// All tools the server exposes, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let page: ListToolsResult = serde_json::from_value(self.request("tools/list", params).await?)?;
            tools.extend(page.tools);

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        debug!(server_id = %self.server_id, count = tools.len(), "Discovered MCP tools");
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        debug!(server_id = %self.server_id, tool = name, "Calling MCP tool");
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, Some(params));

        let response = self
            .transport
            .send(&request)
            .await?
            .ok_or_else(|| McpError::Transport(format!("empty response to '{method}'")))?;

        if let Some(error) = response.error {
            return Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.transport
            .send(&JsonRpcRequest::notification(method, params))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::protocol::{JsonRpcError, JsonRpcResponse};

    /// Records sent messages and answers from a scripted list.
    struct ScriptedTransport {
        sent: std::sync::Arc<Mutex<Vec<JsonRpcRequest>>>,
        replies: Mutex<Vec<Option<JsonRpcResponse>>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Option<JsonRpcResponse>>) -> (Self, std::sync::Arc<Mutex<Vec<JsonRpcRequest>>>) {
            let sent = std::sync::Arc::new(Mutex::new(Vec::new()));
            let mut replies = replies;
            replies.reverse();
            (
                Self {
                    sent: sent.clone(),
                    replies: Mutex::new(replies),
                },
                sent,
            )
        }
    }

    #[async_trait]
    impl McpTransport for ScriptedTransport {
        fn kind(&self) -> &'static str {
            "scripted"
        }

        async fn send(&self, message: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>> {
            self.sent.lock().unwrap().push(message.clone());
            if message.is_notification() {
                return Ok(None);
            }
            Ok(self.replies.lock().unwrap().pop().flatten())
        }

        async fn close(&self) {}
    }

    fn ok(result: Value) -> Option<JsonRpcResponse> {
        Some(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: None,
            result: Some(result),
            error: None,
        })
    }

    #[tokio::test]
    async fn test_initialize_sends_notification_after_request() {
        let (transport, sent) = ScriptedTransport::new(vec![ok(json!({"protocolVersion": "2024-11-05"}))]);
        let client = McpClient::new("weather", Box::new(transport));
        assert_eq!(client.server_id(), "weather");
        client.initialize().await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].method, "initialize");
        assert_eq!(sent[0].params.as_ref().unwrap()["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(sent[1].method, "notifications/initialized");
        assert!(sent[1].is_notification());
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let (transport, sent) = ScriptedTransport::new(vec![
            ok(json!({"tools": [{"name": "a"}], "nextCursor": "page2"})),
            ok(json!({"tools": [{"name": "b"}]})),
        ]);
        let client = McpClient::new("s", Box::new(transport));
        let tools = client.list_tools().await.unwrap();

        assert_eq!(tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        let sent = sent.lock().unwrap();
        assert_eq!(sent[1].params.as_ref().unwrap()["cursor"], "page2");
        assert_ne!(sent[0].id, sent[1].id);
    }

    #[tokio::test]
    async fn test_rpc_error_member_becomes_rpc_error() {
        let (transport, _) = ScriptedTransport::new(vec![Some(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(json!(1)),
            result: None,
            error: Some(JsonRpcError {
                code: -32602,
                message: "bad params".into(),
                data: None,
            }),
        })]);
        let client = McpClient::new("s", Box::new(transport));
        let err = client.call_tool("x", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32602, .. }));
    }

    #[tokio::test]
    async fn test_empty_reply_to_request_is_error() {
        let (transport, _) = ScriptedTransport::new(vec![None]);
        let client = McpClient::new("s", Box::new(transport));
        let err = client.list_tools().await.unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let result = McpClient::connect("s", &McpServerConfig::default()).await;
        assert!(matches!(result, Err(McpError::InvalidConfig(_))));
    }
}
