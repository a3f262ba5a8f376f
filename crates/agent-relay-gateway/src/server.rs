//! Axum HTTP server.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::router::{get_events, health, post_agent};
use crate::scenarios::{get_scenario, list_scenarios, run_scenario};
use crate::state::GatewayState;
use crate::sweep::{SweepSettings, spawn_sweeper};

/// All gateway routes over the shared state.
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let cors = state.config.cors_enabled();

    let app = Router::new()
        .route("/health", get(health))
        .route("/agent", post(post_agent))
        .route("/events", get(get_events))
        .route("/scenarios", get(list_scenarios))
        .route("/scenarios/{id}", get(get_scenario).post(run_scenario));

    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    let app = app.with_state(state).layer(TraceLayer::new_for_http());
    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<Arc<GatewayState>>,
) -> axum::response::Response {
    use axum::response::IntoResponse;
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => axum::http::StatusCode::NOT_FOUND.into_response(),
    }
}

/// Bind the configured address and serve until Ctrl+C.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let addr = format!("{}:{port}", state.config.gateway_bind());
    let listener = TcpListener::bind(&addr).await?;
    info!("Gateway listening on {addr}");
    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves. Runs the
/// sweeper alongside and disconnects MCP servers on the way out.
pub async fn serve<F>(listener: TcpListener, state: Arc<GatewayState>, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let sweeper = spawn_sweeper(state.clone(), SweepSettings::from_state(&state));
    let app = build_router(state.clone());

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    sweeper.abort();
    state.tools.disconnect_all().await;
    result?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(%e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_agent::{EchoAgent, ScenarioStore};
    use agent_relay_core::config::Config;
    use agent_relay_tools::McpManager;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(config: Config) -> Router {
        build_router(Arc::new(GatewayState::new(
            Arc::new(config),
            Arc::new(EchoAgent::new()),
            Arc::new(ScenarioStore::builtin()),
            Arc::new(McpManager::new()),
        )))
    }

    #[tokio::test]
    async fn test_unknown_scenario_is_404() {
        let response = app(Config::default())
            .oneshot(Request::get("/scenarios/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_events_requires_uuid() {
        let response = app(Config::default())
            .oneshot(
                Request::get("/events?sessionId=not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cors_headers_follow_config() {
        let preflight = || {
            Request::builder()
                .method("OPTIONS")
                .uri("/agent")
                .header("origin", "http://example.com")
                .header("access-control-request-method", "POST")
                .body(Body::empty())
                .unwrap()
        };

        let enabled = app(Config::default()).oneshot(preflight()).await.unwrap();
        assert!(enabled.headers().contains_key("access-control-allow-origin"));

        let config = Config::parse("{ gateway: { cors: false } }").unwrap();
        let disabled = app(config).oneshot(preflight()).await.unwrap();
        assert!(!disabled.headers().contains_key("access-control-allow-origin"));
    }
}
