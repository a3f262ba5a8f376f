//! Echo agent: streams the last user message back, one character per chunk.

use agent_relay_core::protocol::Event;
use agent_relay_core::run::RunRequest;
use tracing::debug;

use crate::sink::{EventSink, SinkClosed, spawn_run};
use crate::{Agent, EventStream, new_message_id};

#[derive(Debug, Clone, Default)]
pub struct EchoAgent;

impl EchoAgent {
    pub fn new() -> Self {
        Self
    }
}

impl Agent for EchoAgent {
    fn id(&self) -> &str {
        "echo"
    }

    fn run(&self, request: RunRequest) -> EventStream {
        spawn_run(move |sink| async move {
            if echo(&request, &sink).await.is_err() {
                debug!(run_id = %request.run_id, "Echo run abandoned by consumer");
            }
        })
    }
}

async fn echo(request: &RunRequest, sink: &EventSink) -> Result<(), SinkClosed> {
    let reply = format!("Echo: {}", request.last_user_message().unwrap_or_default());
    let message_id = new_message_id();

    sink.emit(Event::run_started(&request.thread_id, &request.run_id))
        .await?;
    sink.emit(Event::text_start(&message_id)).await?;
    for ch in reply.chars() {
        sink.emit(Event::text_chunk(&message_id, ch.to_string()))
            .await?;
    }
    sink.emit(Event::text_end(&message_id)).await?;
    sink.emit(Event::run_finished(&request.thread_id, &request.run_id))
        .await
}
