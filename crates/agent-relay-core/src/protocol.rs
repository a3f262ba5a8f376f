//! Agent event protocol.
//!
//! Every run produces an ordered sequence of [`Event`]s. On the wire each
//! event is a JSON object tagged by `type` (e.g. `"TEXT_MESSAGE_CHUNK"`) with
//! camelCase fields.

use serde::{Deserialize, Serialize};

use crate::run::Role;

/// Name of the custom event emitted for non-text tool result parts.
pub const TOOL_RESOURCE_EVENT: &str = "tool_resource";

/// A protocol event exchanged between agent and client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Event {
    /// Opens a run. Always the first event of a sequence.
    RunStarted { thread_id: String, run_id: String },

    /// Closes a run successfully.
    RunFinished { thread_id: String, run_id: String },

    /// Closes a run with a failure.
    RunError { message: String },

    TextMessageStart { message_id: String, role: Role },

    TextMessageChunk { message_id: String, delta: String },

    TextMessageEnd { message_id: String },

    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },

    /// A fragment of the JSON-encoded argument object, in concatenation order.
    ToolCallArgs { tool_call_id: String, delta: String },

    ToolCallEnd { tool_call_id: String },

    ToolCallResult {
        tool_call_id: String,
        message_id: String,
        content: String,
        role: Role,
    },

    /// Escape hatch for out-of-band UI payloads.
    Custom { name: String, value: serde_json::Value },
}

impl Event {
    pub fn run_started(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self::RunStarted {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_finished(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self::RunFinished {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
        }
    }

    pub fn run_error(message: impl Into<String>) -> Self {
        Self::RunError {
            message: message.into(),
        }
    }

    pub fn text_start(message_id: impl Into<String>) -> Self {
        Self::TextMessageStart {
            message_id: message_id.into(),
            role: Role::Assistant,
        }
    }

    pub fn text_chunk(message_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextMessageChunk {
            message_id: message_id.into(),
            delta: delta.into(),
        }
    }

    pub fn text_end(message_id: impl Into<String>) -> Self {
        Self::TextMessageEnd {
            message_id: message_id.into(),
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        message_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::ToolCallResult {
            tool_call_id: tool_call_id.into(),
            message_id: message_id.into(),
            content: content.into(),
            role: Role::Tool,
        }
    }

    /// The wire `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "RUN_STARTED",
            Self::RunFinished { .. } => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageChunk { .. } => "TEXT_MESSAGE_CHUNK",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::ToolCallStart { .. } => "TOOL_CALL_START",
            Self::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Self::ToolCallEnd { .. } => "TOOL_CALL_END",
            Self::ToolCallResult { .. } => "TOOL_CALL_RESULT",
            Self::Custom { .. } => "CUSTOM",
        }
    }

    /// True for the events that close a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunError { .. })
    }

    /// Replace the thread/run ids of a lifecycle event. Other events are
    /// returned unchanged.
    pub fn restamp(self, thread_id: &str, run_id: &str) -> Self {
        match self {
            Self::RunStarted { .. } => Self::run_started(thread_id, run_id),
            Self::RunFinished { .. } => Self::run_finished(thread_id, run_id),
            other => other,
        }
    }
}
