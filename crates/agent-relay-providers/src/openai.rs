//! OpenAI-compatible Chat Completions upstream.
//!
//! Streams `POST {base_url}/chat/completions` and works against OpenAI,
//! OpenRouter, Ollama and any server speaking the same dialect.

use std::pin::Pin;
use std::time::Duration;

use agent_relay_core::config::LlmConfig;
use agent_relay_core::run::{Message, Role, ToolSpec};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::retry::{RetryPolicy, with_retry};
use crate::sse::{SseEvent, parse_sse_stream};
use crate::{ChatProvider, ChunkStream, CompletionChunk, CompletionRequest, ToolCallChunk};

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    pub base_url: String,
    api_key: Option<String>,
    retry: RetryPolicy,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<&str>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(OPENAI_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key,
            retry: RetryPolicy::default(),
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(Some(config.base_url()), config.resolve_api_key())
            .with_retry_policy(RetryPolicy::from_config(config))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [serde_json::Value],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Outcome of decoding one `data:` payload.
#[derive(Debug, PartialEq)]
enum Decoded {
    Done,
    Skip,
    Chunk(CompletionChunk),
}

fn decode_data(data: &str) -> Decoded {
    let data = data.trim();

    // OpenAI terminates with "data: [DONE]"
    if data == "[DONE]" {
        return Decoded::Done;
    }

    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            warn!(%e, data, "Skipping malformed upstream chunk");
            return Decoded::Skip;
        }
    };

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Decoded::Skip;
    };

    let text = choice.delta.content.filter(|c| !c.is_empty());
    let tool_calls: Vec<ToolCallChunk> = choice
        .delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| {
            let function = tc.function.unwrap_or_default();
            ToolCallChunk {
                index: tc.index,
                id: tc.id.filter(|id| !id.is_empty()),
                name: function.name.filter(|n| !n.is_empty()),
                arguments: function.arguments.filter(|a| !a.is_empty()),
            }
        })
        .collect();

    if text.is_none() && tool_calls.is_empty() && choice.finish_reason.is_none() {
        return Decoded::Skip;
    }

    Decoded::Chunk(CompletionChunk {
        text,
        tool_calls,
        finish_reason: choice.finish_reason,
    })
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn id(&self) -> &str {
        "openai"
    }

    fn format_tools(&self, tools: &[ToolSpec]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect()
    }

    fn format_messages(&self, messages: &[Message]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| match m.role {
                Role::System => json!({ "role": "system", "content": m.text() }),
                Role::User => json!({ "role": "user", "content": m.text() }),
                Role::Assistant => {
                    let mut msg = json!({ "role": "assistant", "content": m.content });
                    if let Some(calls) = m.tool_calls.as_ref().filter(|c| !c.is_empty()) {
                        msg["tool_calls"] = json!(calls);
                    }
                    msg
                }
                Role::Tool => json!({
                    "role": "tool",
                    "tool_call_id": m.tool_call_id,
                    "content": m.text(),
                }),
            })
            .collect()
    }

    async fn stream(&self, request: &CompletionRequest) -> anyhow::Result<ChunkStream> {
        let body = OpenAiRequest {
            model: &request.model,
            messages: &request.messages,
            stream: true,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: request.tools.as_deref().filter(|t| !t.is_empty()),
        };

        debug!(model = %body.model, base_url = %self.base_url, "Streaming chat completion");

        let response = with_retry(&self.retry, "chat completion", |_attempt| {
            let mut req = self
                .client
                .post(self.endpoint())
                .header("content-type", "application/json")
                .header("accept", "text/event-stream")
                .json(&body);
            if let Some(key) = &self.api_key {
                req = req.header("authorization", format!("Bearer {key}"));
            }

            async move {
                let response = req.send().await?;
                if !response.status().is_success() {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    anyhow::bail!("Upstream API error {status}: {body}");
                }
                Ok::<_, anyhow::Error>(response)
            }
        })
        .await?;

        // A stalled body ends the run instead of hanging it
        let chunk_stream = futures::stream::unfold(
            ChunkState {
                sse: Box::pin(parse_sse_stream(response)),
                idle_timeout: self.retry.attempt_timeout,
                done: false,
            },
            |mut state| async move {
                if state.done {
                    return None;
                }
                loop {
                    let next = match tokio::time::timeout(state.idle_timeout, state.sse.next()).await
                    {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(
                                idle_ms = state.idle_timeout.as_millis() as u64,
                                "Upstream stream stalled"
                            );
                            state.done = true;
                            let err = anyhow::anyhow!(
                                "Upstream stream idle for {}ms",
                                state.idle_timeout.as_millis()
                            );
                            return Some((Err(err), state));
                        }
                    };
                    match next {
                        Some(Ok(event)) => match decode_data(&event.data) {
                            Decoded::Done => return None,
                            Decoded::Skip => continue,
                            Decoded::Chunk(chunk) => return Some((Ok(chunk), state)),
                        },
                        Some(Err(e)) => {
                            state.done = true;
                            return Some((Err(e), state));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(chunk_stream))
    }
}

struct ChunkState {
    sse: Pin<Box<dyn Stream<Item = anyhow::Result<SseEvent>> + Send>>,
    /// Longest wait allowed between two upstream events.
    idle_timeout: Duration,
    done: bool,
}
