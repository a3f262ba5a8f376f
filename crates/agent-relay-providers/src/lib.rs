//! Upstream LLM access.
//!
//! A [`ChatProvider`] turns a [`CompletionRequest`] into a stream of
//! vendor-neutral [`CompletionChunk`]s. The only wire dialect shipped is the
//! OpenAI-compatible chat-completions API (see [`openai`]).

use std::pin::Pin;

use agent_relay_core::run::{Message, ToolSpec};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

pub mod openai;
pub mod retry;
pub mod sse;

pub use openai::OpenAiProvider;
pub use retry::{RetryPolicy, with_retry};

/// A request to the upstream model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    /// Vendor-formatted messages, system prompt included.
    pub messages: Vec<serde_json::Value>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    /// Vendor-formatted tool declarations. `None` or empty advertises nothing.
    pub tools: Option<Vec<serde_json::Value>>,
}

/// One streamed delta from the upstream model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallChunk>,
    pub finish_reason: Option<String>,
}

/// A fragment of a tool call. `id` and `name` usually arrive only on the
/// first fragment for a given `index`; `arguments` is a raw JSON fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<CompletionChunk>> + Send>>;

/// A streaming chat-completion upstream.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider identifier (e.g., "openai").
    fn id(&self) -> &str;

    /// Convert tool declarations into the vendor format.
    fn format_tools(&self, tools: &[ToolSpec]) -> Vec<serde_json::Value>;

    /// Convert conversation messages into the vendor format.
    fn format_messages(&self, messages: &[Message]) -> Vec<serde_json::Value>;

    /// Open a streaming completion. Connection failures are retried per the
    /// provider's policy before an error is returned.
    async fn stream(&self, request: &CompletionRequest) -> anyhow::Result<ChunkStream>;
}
