//! LLM bridge agent.
//!
//! Streams a chat completion from the upstream provider and translates it
//! into protocol events. Tool calls the model makes are forwarded as they
//! stream; once the completion ends they are executed through the attached
//! [`ToolBridge`] and their results emitted.

use std::collections::HashMap;
use std::sync::Arc;

use agent_relay_core::config::LlmConfig;
use agent_relay_core::protocol::{Event, TOOL_RESOURCE_EVENT};
use agent_relay_core::run::{RunRequest, ToolSpec};
use agent_relay_providers::{ChatProvider, CompletionChunk, CompletionRequest, OpenAiProvider};
use agent_relay_tools::ToolBridge;
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::prompt::{build_system_prompt, prepare_messages};
use crate::sink::{EventSink, SinkClosed, spawn_run};
use crate::{Agent, EventStream, new_message_id};

const EMPTY_TOOL_RESULT: &str = "Tool executed successfully";

/// Model parameters applied to every completion.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
}

impl LlmSettings {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            model: config.model().to_string(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

pub struct LlmAgent {
    provider: Arc<dyn ChatProvider>,
    bridge: Option<Arc<dyn ToolBridge>>,
    settings: Arc<LlmSettings>,
}

impl LlmAgent {
    pub fn new(provider: Arc<dyn ChatProvider>, settings: LlmSettings) -> Self {
        Self {
            provider,
            bridge: None,
            settings: Arc::new(settings),
        }
    }

    /// OpenAI-compatible upstream configured from the `llm` section.
    pub fn from_config(config: &LlmConfig) -> Self {
        Self::new(
            Arc::new(OpenAiProvider::from_config(config)),
            LlmSettings::from_config(config),
        )
    }

    pub fn with_bridge(mut self, bridge: Arc<dyn ToolBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }
}

impl Agent for LlmAgent {
    fn id(&self) -> &str {
        self.provider.id()
    }

    fn run(&self, request: RunRequest) -> EventStream {
        let run = LlmRun {
            provider: self.provider.clone(),
            bridge: self.bridge.clone(),
            settings: self.settings.clone(),
        };
        spawn_run(move |sink| async move { run.execute(request, sink).await })
    }
}

struct LlmRun {
    provider: Arc<dyn ChatProvider>,
    bridge: Option<Arc<dyn ToolBridge>>,
    settings: Arc<LlmSettings>,
}

/// A tool call accumulated from streamed fragments.
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Open/closed bookkeeping for one streamed completion.
struct StreamState {
    /// Assistant message id, also the parent of every tool call.
    message_id: String,
    text_open: bool,
    open_tool: Option<String>,
    ids_by_index: HashMap<usize, String>,
    calls: Vec<PendingCall>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            message_id: new_message_id(),
            text_open: false,
            open_tool: None,
            ids_by_index: HashMap::new(),
            calls: Vec::new(),
        }
    }

    /// Close whatever is still open, tool call first.
    async fn close_open(&mut self, sink: &EventSink) -> Result<(), SinkClosed> {
        if let Some(tool_call_id) = self.open_tool.take() {
            sink.emit(Event::ToolCallEnd { tool_call_id }).await?;
        }
        if self.text_open {
            self.text_open = false;
            sink.emit(Event::text_end(&self.message_id)).await?;
        }
        Ok(())
    }

    async fn on_chunk(&mut self, chunk: CompletionChunk, sink: &EventSink) -> Result<(), SinkClosed> {
        if let Some(text) = chunk.text.filter(|t| !t.is_empty()) {
            if !self.text_open {
                self.text_open = true;
                sink.emit(Event::text_start(&self.message_id)).await?;
            }
            sink.emit(Event::text_chunk(&self.message_id, text)).await?;
        }

        for fragment in chunk.tool_calls {
            let id = match (&fragment.id, self.ids_by_index.get(&fragment.index)) {
                (Some(id), _) => id.clone(),
                (None, Some(known)) => known.clone(),
                (None, None) => format!("call_{}", uuid::Uuid::new_v4().simple()),
            };
            self.ids_by_index.insert(fragment.index, id.clone());

            let position = match self.calls.iter().position(|c| c.id == id) {
                Some(pos) => pos,
                None => {
                    self.calls.push(PendingCall {
                        id: id.clone(),
                        name: String::new(),
                        arguments: String::new(),
                    });
                    self.calls.len() - 1
                }
            };
            if let Some(name) = fragment.name.filter(|n| !n.is_empty()) {
                if self.calls[position].name.is_empty() {
                    self.calls[position].name = name;
                }
            }

            if self.open_tool.as_deref() != Some(id.as_str()) {
                if let Some(previous) = self.open_tool.take() {
                    sink.emit(Event::ToolCallEnd {
                        tool_call_id: previous,
                    })
                    .await?;
                }
                sink.emit(Event::ToolCallStart {
                    tool_call_id: id.clone(),
                    tool_call_name: self.calls[position].name.clone(),
                    parent_message_id: Some(self.message_id.clone()),
                })
                .await?;
                self.open_tool = Some(id.clone());
            }

            if let Some(delta) = fragment.arguments.filter(|a| !a.is_empty()) {
                self.calls[position].arguments.push_str(&delta);
                sink.emit(Event::ToolCallArgs {
                    tool_call_id: id,
                    delta,
                })
                .await?;
            }
        }
        Ok(())
    }
}

impl LlmRun {
    async fn execute(self, request: RunRequest, sink: EventSink) {
        let thread_id = request.thread_id.clone();
        let run_id = request.run_id.clone();

        if sink.emit(Event::run_started(&thread_id, &run_id)).await.is_err() {
            return;
        }

        let mut state = StreamState::new();
        match self.drive(&request, &mut state, &sink).await {
            Ok(()) => {
                info!(thread_id = %thread_id, run_id = %run_id, "LLM run finished");
                let _ = sink.emit(Event::run_finished(&thread_id, &run_id)).await;
            }
            Err(e) if e.downcast_ref::<SinkClosed>().is_some() => {
                debug!(thread_id = %thread_id, run_id = %run_id, "LLM run abandoned by consumer");
            }
            Err(e) => {
                error!(thread_id = %thread_id, run_id = %run_id, error = %format!("{e:#}"), "LLM run failed");
                if state.close_open(&sink).await.is_ok() {
                    let _ = sink.emit(Event::run_error(format!("{e:#}"))).await;
                }
            }
        }
    }

    async fn drive(
        &self,
        request: &RunRequest,
        state: &mut StreamState,
        sink: &EventSink,
    ) -> anyhow::Result<()> {
        let tools = self.resolve_tools(request).await?;
        let system_prompt =
            build_system_prompt(self.settings.system_prompt.as_deref(), &request.context);
        let messages = prepare_messages(&system_prompt, &request.messages);

        let formatted_tools = self.provider.format_tools(&tools);
        let completion = CompletionRequest {
            model: self.settings.model.clone(),
            messages: self.provider.format_messages(&messages),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            tools: (!formatted_tools.is_empty()).then_some(formatted_tools),
        };

        info!(
            thread_id = %request.thread_id,
            run_id = %request.run_id,
            model = %completion.model,
            messages = completion.messages.len(),
            tools = tools.len(),
            "Starting LLM run"
        );

        let mut stream = self.provider.stream(&completion).await?;
        while let Some(chunk) = stream.next().await {
            state.on_chunk(chunk?, sink).await?;
        }
        state.close_open(sink).await?;

        if let Some(bridge) = &self.bridge {
            for call in std::mem::take(&mut state.calls) {
                execute_call(bridge.as_ref(), &call, sink).await?;
            }
        }
        Ok(())
    }

    /// Tools sent with the request win, even when empty; otherwise whatever
    /// the bridge advertises.
    async fn resolve_tools(&self, request: &RunRequest) -> anyhow::Result<Vec<ToolSpec>> {
        match (&request.tools, &self.bridge) {
            (Some(tools), _) => Ok(tools.clone()),
            (None, Some(bridge)) => Ok(bridge.list_tools().await?),
            (None, None) => Ok(Vec::new()),
        }
    }
}

async fn execute_call(
    bridge: &dyn ToolBridge,
    call: &PendingCall,
    sink: &EventSink,
) -> Result<(), SinkClosed> {
    let arguments = parse_arguments(call);
    debug!(tool = %call.name, tool_call_id = %call.id, "Executing tool call");

    let result_id = new_message_id();
    match bridge.call_tool(&call.name, arguments).await {
        Ok(result) => {
            let texts: Vec<&str> = result.texts().collect();
            let content = if texts.is_empty() {
                EMPTY_TOOL_RESULT.to_string()
            } else {
                texts.concat()
            };
            sink.emit(Event::tool_result(&call.id, &result_id, content))
                .await?;

            for resource in result.resources() {
                sink.emit(Event::Custom {
                    name: TOOL_RESOURCE_EVENT.to_string(),
                    value: json!({
                        "toolCallId": call.id,
                        "toolName": call.name,
                        "resource": resource,
                    }),
                })
                .await?;
            }
        }
        Err(e) => {
            warn!(tool = %call.name, tool_call_id = %call.id, %e, "Tool call failed");
            sink.emit(Event::tool_result(
                &call.id,
                &result_id,
                format!("Error executing tool {}: {e}", call.name),
            ))
            .await?;
        }
    }
    Ok(())
}

fn parse_arguments(call: &PendingCall) -> Value {
    if call.arguments.trim().is_empty() {
        return json!({});
    }
    match serde_json::from_str::<Value>(&call.arguments) {
        Ok(value) => value,
        Err(e) => {
            warn!(tool = %call.name, tool_call_id = %call.id, %e, "Unparseable tool arguments, using {{}}");
            json!({})
        }
    }
}
