//! Wire framing for event streams.
//!
//! Two formats: server-sent events (`data: <json>\n\n`) and JSON lines
//! (`<json>\n`). The format is picked once per response from the client's
//! `Accept` header and never changes afterwards.

use std::convert::Infallible;

use agent_relay_core::protocol::Event;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::Stream;

const EVENT_STREAM: &str = "text/event-stream";
const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFormat {
    #[default]
    EventStream,
    JsonLines,
}

impl FrameFormat {
    /// Event stream unless the client asks for JSON and not for SSE.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::EventStream;
        };
        let accept = accept.to_ascii_lowercase();
        if accept.contains(EVENT_STREAM) {
            Self::EventStream
        } else if accept.contains(NDJSON) || accept.contains("application/json") {
            Self::JsonLines
        } else {
            Self::EventStream
        }
    }

    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::negotiate(
            headers
                .get(header::ACCEPT)
                .and_then(|v| v.to_str().ok()),
        )
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::EventStream => EVENT_STREAM,
            Self::JsonLines => NDJSON,
        }
    }

    pub fn encode(self, event: &Event) -> serde_json::Result<Bytes> {
        let json = serde_json::to_string(event)?;
        Ok(match self {
            Self::EventStream => Bytes::from(format!("data: {json}\n\n")),
            Self::JsonLines => Bytes::from(format!("{json}\n")),
        })
    }

    /// Reconnect hint. JSON lines has no equivalent.
    pub fn retry(self, millis: u64) -> Option<Bytes> {
        match self {
            Self::EventStream => Some(Bytes::from(format!("retry: {millis}\n\n"))),
            Self::JsonLines => None,
        }
    }

    pub fn heartbeat(self) -> Bytes {
        match self {
            Self::EventStream => Bytes::from_static(b": heartbeat\n\n"),
            Self::JsonLines => Bytes::from_static(b"\n"),
        }
    }
}

/// Streaming response with the headers proxies need to leave it unbuffered.
pub fn stream_response<S>(format: FrameFormat, stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    (headers, Body::from_stream(stream)).into_response()
}
