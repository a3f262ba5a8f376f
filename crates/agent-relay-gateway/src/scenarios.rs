//! Scenario catalogue and direct scenario runs.

use std::sync::Arc;

use agent_relay_agent::{Agent, Scenario, ScenarioAgent};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::encoder::FrameFormat;
use crate::router::{error_response, parse_run, stream_direct};
use crate::state::GatewayState;

pub async fn list_scenarios(State(state): State<Arc<GatewayState>>) -> Json<Vec<Scenario>> {
    Json(
        state
            .scenarios
            .list()
            .iter()
            .map(|s| s.as_ref().clone())
            .collect(),
    )
}

pub async fn get_scenario(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
) -> Response {
    match state.scenarios.get(&id) {
        Some(scenario) => Json(scenario.as_ref().clone()).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("Scenario not found: {id}")),
    }
}

/// Replay a scenario for the given run body. Always streamed directly,
/// whatever channel the thread has open.
pub async fn run_scenario(
    State(state): State<Arc<GatewayState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(scenario) = state.scenarios.get(&id) else {
        return error_response(StatusCode::NOT_FOUND, format!("Scenario not found: {id}"));
    };
    let request = match parse_run(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };

    state
        .sessions
        .update_messages(&request.thread_id, request.messages.clone())
        .await;

    let agent = ScenarioAgent::new(scenario, state.event_delay());
    #[cfg(feature = "metrics")]
    crate::metrics::record_run("scenario");
    stream_direct(agent.run(request), FrameFormat::from_headers(&headers))
}
