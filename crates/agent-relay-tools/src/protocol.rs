//! MCP JSON-RPC protocol types (client side).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Request header carrying the negotiated session id on the HTTP transport.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC 2.0 request, or a notification when `id` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP tool definition (from a tools/list response)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpTool>,
    #[serde(rename = "nextCursor", default)]
    pub next_cursor: Option<String>,
}

/// MCP tool call result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    /// Text parts, in order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(ToolContent::as_text)
    }

    /// Non-text parts (images, resources, ...), in order.
    pub fn resources(&self) -> impl Iterator<Item = &ToolContent> {
        self.content.iter().filter(|c| c.as_text().is_none())
    }
}

/// MCP tool content block. Non-text blocks keep their remaining fields in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".into(),
            text: Some(text.into()),
            extra: Default::default(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        if self.content_type == "text" {
            self.text.as_deref()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_omits_id() {
        let n = JsonRpcRequest::notification("notifications/initialized", None);
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "method": "notifications/initialized"}));
        assert!(n.is_notification());
    }

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new(3, "tools/list", Some(json!({})));
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["id"], 3);
        assert_eq!(value["method"], "tools/list");
    }

    #[test]
    fn test_error_response_deserialization() {
        let resp: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32601);
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_mcp_tool_defaults() {
        let tool: McpTool = serde_json::from_value(json!({"name": "ping"})).unwrap();
        assert_eq!(tool.description, "");
        assert_eq!(tool.input_schema["type"], "object");
    }

    #[test]
    fn test_call_result_splits_text_and_resources() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "line 1"},
                {"type": "image", "data": "aGk=", "mimeType": "image/png"},
                {"type": "text", "text": "line 2"}
            ],
            "isError": false
        }))
        .unwrap();

        assert_eq!(result.texts().collect::<Vec<_>>(), vec!["line 1", "line 2"]);
        let resources: Vec<_> = result.resources().collect();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].content_type, "image");
        assert_eq!(resources[0].extra["mimeType"], "image/png");
        assert_eq!(result.is_error, Some(false));
    }
}
