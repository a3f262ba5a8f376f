//! MCP bridge tests against a local mock tool server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_relay_core::config::McpServerConfig;
use agent_relay_tools::{McpClient, McpError, McpManager, ToolBridge};
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde_json::{Value, json};

const SESSION: &str = "sess-1";

#[derive(Clone, Default)]
struct MockServer {
    /// (method, session header seen) per POST
    posts: Arc<Mutex<Vec<(String, Option<String>)>>>,
    deletes: Arc<Mutex<Vec<Option<String>>>>,
}

fn session_of(headers: &HeaderMap) -> Option<String> {
    headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

async fn handle_post(
    State(server): State<MockServer>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let method = body["method"].as_str().unwrap_or_default().to_string();
    server
        .posts
        .lock()
        .unwrap()
        .push((method.clone(), session_of(&headers)));

    let Some(id) = body.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };

    match method.as_str() {
        "initialize" => (
            [("mcp-session-id", SESSION)],
            axum::Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"protocolVersion": "2024-11-05", "capabilities": {"tools": {}}}
            })),
        )
            .into_response(),
        "tools/list" => {
            let payload = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": [
                    {"name": "weather", "description": "Weather", "inputSchema": {"type": "object"}},
                    {"name": "fail", "description": "Always fails"}
                ]}
            });
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                format!("event: message\ndata: {payload}\n\n"),
            )
                .into_response()
        }
        "tools/call" if body["params"]["name"] == "weather" => axum::Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"content": [
                {"type": "text", "text": format!("Sunny in {}", body["params"]["arguments"]["city"].as_str().unwrap_or("?"))},
                {"type": "image", "data": "aGk=", "mimeType": "image/png"}
            ]}
        }))
        .into_response(),
        _ => axum::Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32603, "message": "tool exploded"}
        }))
        .into_response(),
    }
}

async fn handle_delete(State(server): State<MockServer>, headers: HeaderMap) -> StatusCode {
    server.deletes.lock().unwrap().push(session_of(&headers));
    StatusCode::OK
}

async fn broken() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

async fn slow() -> Response {
    tokio::time::sleep(Duration::from_secs(5)).await;
    StatusCode::OK.into_response()
}

async fn start_mock(server: MockServer) -> String {
    let app = Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete))
        .route("/broken", post(broken))
        .route("/slow", post(slow))
        .with_state(server);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_handshake_captures_and_replays_session_id() {
    let server = MockServer::default();
    let base = start_mock(server.clone()).await;

    let client = McpClient::connect("mock", &McpServerConfig::http(format!("{base}/mcp")))
        .await
        .unwrap();
    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].name, "weather");

    client.close().await;

    let posts = server.posts.lock().unwrap().clone();
    assert_eq!(posts[0], ("initialize".to_string(), None));
    assert_eq!(
        posts[1],
        ("notifications/initialized".to_string(), Some(SESSION.to_string()))
    );
    assert_eq!(posts[2], ("tools/list".to_string(), Some(SESSION.to_string())));
    assert_eq!(
        server.deletes.lock().unwrap().clone(),
        vec![Some(SESSION.to_string())]
    );
}

#[tokio::test]
async fn test_manager_routes_bridge_calls_to_owner() {
    let base = start_mock(MockServer::default()).await;
    let manager = McpManager::new();
    let config = McpServerConfig::http(format!("{base}/mcp"));

    manager.connect("weather-server", &config).await.unwrap();
    // idempotent
    manager.connect("weather-server", &config).await.unwrap();
    assert!(manager.is_connected("weather-server").await);

    let specs = ToolBridge::list_tools(&manager).await.unwrap();
    let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["weather", "fail"]);

    let result = ToolBridge::call_tool(&manager, "weather", json!({"city": "Paris"}))
        .await
        .unwrap();
    assert_eq!(result.texts().collect::<Vec<_>>(), vec!["Sunny in Paris"]);
    assert_eq!(result.resources().count(), 1);

    let err = ToolBridge::call_tool(&manager, "fail", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Rpc { code: -32603, .. }), "got {err:?}");
}

#[tokio::test]
async fn test_bridge_call_without_prior_listing() {
    let server = MockServer::default();
    let base = start_mock(server.clone()).await;
    let manager = McpManager::new();
    manager
        .connect("weather-server", &McpServerConfig::http(format!("{base}/mcp")))
        .await
        .unwrap();

    let result = ToolBridge::call_tool(&manager, "weather", json!({"city": "Paris"}))
        .await
        .unwrap();
    assert_eq!(result.texts().collect::<Vec<_>>(), vec!["Sunny in Paris"]);

    // still unknown after the refresh
    let err = ToolBridge::call_tool(&manager, "nope", json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::UnknownTool(ref name) if name == "nope"));

    let methods: Vec<_> = server
        .posts
        .lock()
        .unwrap()
        .iter()
        .map(|(method, _)| method.clone())
        .collect();
    assert_eq!(
        methods,
        vec![
            "initialize",
            "notifications/initialized",
            "tools/list",
            "tools/call",
            "tools/list",
        ]
    );
}

#[tokio::test]
async fn test_disconnect_sends_delete_and_forgets_server() {
    let server = MockServer::default();
    let base = start_mock(server.clone()).await;
    let manager = McpManager::new();
    manager
        .connect("s", &McpServerConfig::http(format!("{base}/mcp")))
        .await
        .unwrap();

    assert!(manager.disconnect("s").await);
    assert_eq!(server.deletes.lock().unwrap().len(), 1);

    let err = manager.list_tools("s").await.unwrap_err();
    assert!(matches!(err, McpError::NotConnected(_)));
}

#[tokio::test]
async fn test_non_2xx_reports_status_and_body() {
    let base = start_mock(MockServer::default()).await;
    let result = McpClient::connect("broken", &McpServerConfig::http(format!("{base}/broken"))).await;
    match result {
        Err(McpError::Http { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("expected failure"),
    }
}

#[tokio::test]
async fn test_request_timeout() {
    let base = start_mock(MockServer::default()).await;
    let config = McpServerConfig {
        timeout_secs: Some(1),
        ..McpServerConfig::http(format!("{base}/slow"))
    };
    let result = McpClient::connect("slow", &config).await;
    assert!(matches!(result, Err(McpError::Timeout(_))));
}
