//! Streamable-HTTP transport.
//!
//! Each message is a `POST` to the server endpoint. The server may answer
//! with plain JSON or with an event-stream body; both decode to one
//! response. The `mcp-session-id` handed out on the first response is
//! echoed on every later request and used to `DELETE` the session on close.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{McpError, Result};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, SESSION_HEADER};
use crate::transport::McpTransport;

pub struct HttpTransport {
    endpoint: String,
    headers: HeaderMap,
    timeout: Duration,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    cancel: CancellationToken,
}

impl HttpTransport {
    pub fn new(
        endpoint: impl Into<String>,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpError::InvalidConfig(format!("header '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpError::InvalidConfig(format!("header '{name}': {e}")))?;
            header_map.insert(name, value);
        }

        Ok(Self {
            endpoint: endpoint.into(),
            headers: header_map,
            timeout,
            client: reqwest::Client::new(),
            session_id: RwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// Session id negotiated with the server, if any.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().ok().and_then(|s| s.clone())
    }

    fn remember_session(&self, response: &reqwest::Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        if let Ok(mut slot) = self.session_id.write() {
            if slot.is_none() {
                debug!(session_id = id, "MCP session established");
                *slot = Some(id.to_string());
            }
        }
    }

    async fn post(&self, message: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(id) = self.session_id() {
            req = req.header(SESSION_HEADER, id);
        }

        let response = req
            .send()
            .await
            .map_err(|e| McpError::Transport(format!("HTTP request failed: {e}")))?;

        self.remember_session(&response);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(McpError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| McpError::Transport(format!("Failed to read response body: {e}")))?;

        decode_body(&content_type, &body)
    }
}

/// Decode a response body by content type. An empty body (or an event
/// stream without data) is an acknowledged notification.
pub fn decode_body(content_type: &str, body: &str) -> Result<Option<JsonRpcResponse>> {
    let payload = if content_type.starts_with("text/event-stream") {
        body.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect::<String>()
    } else {
        body.to_string()
    };

    if payload.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&payload)?))
}

#[async_trait]
impl McpTransport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn send(&self, message: &JsonRpcRequest) -> Result<Option<JsonRpcResponse>> {
        if self.cancel.is_cancelled() {
            return Err(McpError::Aborted);
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(McpError::Aborted),
            result = tokio::time::timeout(self.timeout, self.post(message)) => {
                result.map_err(|_| McpError::Timeout(self.timeout))?
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();

        let session = self.session_id.write().ok().and_then(|mut s| s.take());
        let Some(session) = session else {
            return;
        };

        let result = self
            .client
            .delete(&self.endpoint)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, &session)
            .timeout(self.timeout)
            .send()
            .await;
        match result {
            Ok(response) => debug!(status = %response.status(), "MCP session terminated"),
            Err(e) => warn!(%e, "Failed to terminate MCP session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_json() {
        let resp = decode_body("application/json", r#"{"jsonrpc":"2.0","id":1,"result":{}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(resp.id, Some(serde_json::json!(1)));
    }

    #[test]
    fn test_decode_event_stream_concatenates_data_lines() {
        let body = "event: message\ndata: {\"jsonrpc\":\"2.0\",\ndata: \"id\":2,\"result\":{\"ok\":true}}\n\n";
        let resp = decode_body("text/event-stream; charset=utf-8", body)
            .unwrap()
            .unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn test_decode_empty_body_is_none() {
        assert!(decode_body("application/json", "").unwrap().is_none());
        assert!(decode_body("text/event-stream", ": ping\n\n").unwrap().is_none());
    }

    #[test]
    fn test_decode_garbage_is_json_error() {
        let err = decode_body("application/json", "<html>").unwrap_err();
        assert!(matches!(err, McpError::Json(_)));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "x".to_string());
        let result = HttpTransport::new("http://localhost", &headers, Duration::from_secs(1));
        assert!(matches!(result, Err(McpError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_send_after_close_is_aborted() {
        let transport =
            HttpTransport::new("http://127.0.0.1:9", &HashMap::new(), Duration::from_secs(1))
                .unwrap();
        transport.close().await;
        let err = transport
            .send(&JsonRpcRequest::new(1, "tools/list", None))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Aborted));
    }
}
