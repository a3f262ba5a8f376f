//! Run delivery and event channel handlers.
//!
//! `POST /agent` streams a run's events straight back as the response body,
//! unless the thread has an open `/events` channel. In that case the run is
//! driven to completion, each event is written to the channel (queued when
//! the write fails), and the response is a JSON summary.

use std::convert::Infallible;
use std::sync::Arc;

use agent_relay_agent::{Agent, EventStream};
use agent_relay_core::error::RelayError;
use agent_relay_core::run::RunRequest;
use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encoder::{FrameFormat, stream_response};
use crate::state::GatewayState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub(crate) fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Decode and validate a run body, or the 400 to send back.
pub(crate) fn parse_run(body: &[u8]) -> Result<RunRequest, Response> {
    let value: Value = serde_json::from_slice(body).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {e}"))
    })?;
    RunRequest::from_value(value).map_err(|e| {
        let message = match e {
            RelayError::Validation(message) => message,
            other => other.to_string(),
        };
        error_response(StatusCode::BAD_REQUEST, message)
    })
}

pub async fn post_agent(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match parse_run(&body) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let agent = state.agent.clone();
    deliver(&state, agent.as_ref(), request, &headers).await
}

/// Record the run's messages, then deliver over the thread's channel if one
/// is open, or directly otherwise.
pub(crate) async fn deliver(
    state: &Arc<GatewayState>,
    agent: &dyn Agent,
    request: RunRequest,
    headers: &HeaderMap,
) -> Response {
    let thread_id = request.thread_id.clone();
    info!(
        thread_id = %thread_id,
        run_id = %request.run_id,
        agent = agent.id(),
        messages = request.messages.len(),
        "Run requested"
    );
    state
        .sessions
        .update_messages(&thread_id, request.messages.clone())
        .await;

    if state.connections.has_connection(&thread_id).await {
        let (sent, queued) = run_to_channel(state, &thread_id, agent.run(request)).await;
        return Json(json!({
            "status": "ok",
            "eventsSent": sent,
            "eventsQueued": queued,
        }))
        .into_response();
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_run("direct");
    stream_direct(agent.run(request), FrameFormat::from_headers(headers))
}

/// Drive a run to completion over the session's channel. Returns
/// (events produced, events queued).
async fn run_to_channel(
    state: &GatewayState,
    session_id: &str,
    mut events: EventStream,
) -> (usize, usize) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_run("channel");

    let mut sent = 0;
    let mut queued = 0;
    while let Some(event) = events.next().await {
        sent += 1;
        if !state
            .connections
            .send_or_queue(session_id, event, &state.queue)
            .await
        {
            queued += 1;
        }
    }

    if queued > 0 {
        warn!(session_id, queued, "Events queued for later delivery");
        #[cfg(feature = "metrics")]
        crate::metrics::record_queued(queued);
    }
    info!(session_id, sent, queued, "Run delivered over event channel");
    (sent, queued)
}

/// Stream a run as the response body.
pub(crate) fn stream_direct(events: EventStream, format: FrameFormat) -> Response {
    let body = events.filter_map(move |event| match format.encode(&event) {
        Ok(frame) => Some(Ok::<_, Infallible>(frame)),
        Err(e) => {
            warn!(%e, kind = event.kind(), "Dropping unencodable event");
            None
        }
    });
    stream_response(format, body)
}

/// Open the long-lived event channel for a session: retry hint, queued
/// backlog in order, then live events and heartbeats.
pub async fn get_events(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = query.session_id.filter(|id| is_session_id(id)) else {
        return error_response(StatusCode::BAD_REQUEST, "sessionId must be a valid UUID");
    };

    state.sessions.get_or_create(&session_id).await;

    let format = FrameFormat::from_headers(&headers);
    let (handle, rx, _flushed) = state
        .connections
        .open(
            &session_id,
            format,
            format.retry(state.retry_hint_ms()),
            &state.queue,
        )
        .await;
    debug!(session_id = %session_id, conn_id = %handle.conn_id, "Event channel ready");

    let guard = state.connections.guard(&handle);
    let body = UnboundedReceiverStream::new(rx).map(move |frame| {
        let _guard = &guard;
        Ok::<_, Infallible>(frame)
    });
    stream_response(format, body)
}

/// Hyphenated UUID only; `Uuid::parse_str` alone also takes the simple,
/// braced and URN forms.
fn is_session_id(id: &str) -> bool {
    id.len() == 36 && Uuid::parse_str(id).is_ok()
}

pub async fn health(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len().await,
        "connections": state.connections.len().await,
    }))
}
