//! Agent runtimes.
//!
//! An [`Agent`] turns a [`RunRequest`] into an ordered, finite stream of
//! protocol [`Event`]s. Three runtimes ship: [`EchoAgent`], [`ScenarioAgent`]
//! (scripted replay) and [`LlmAgent`] (upstream chat completion plus tool
//! execution).
//!
//! Every run starts with `RUN_STARTED` and ends with exactly one of
//! `RUN_FINISHED` or `RUN_ERROR`. Failures inside a run are reported as
//! events; they never surface as errors to the caller.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use agent_relay_core::config::{AgentKind, Config};
use agent_relay_core::protocol::Event;
use agent_relay_core::run::RunRequest;
use agent_relay_tools::ToolBridge;
use anyhow::Context;
use futures::Stream;

pub mod echo;
pub mod llm;
pub mod prompt;
pub mod scenario;
pub mod sink;

pub use echo::EchoAgent;
pub use llm::{LlmAgent, LlmSettings};
pub use scenario::{Scenario, ScenarioAgent, ScenarioStore};

/// Events of a single run. Lazy, single consumer, not restartable.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

pub trait Agent: Send + Sync {
    /// Short identifier for logs.
    fn id(&self) -> &str;

    /// Start a run. Dropping the stream stops the run at its next event.
    fn run(&self, request: RunRequest) -> EventStream;
}

pub(crate) fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build the agent selected by `agent.kind`.
///
/// `scenario` mode requires `agent.scenario` to name a loaded scenario.
pub fn build_agent(
    config: &Config,
    scenarios: &ScenarioStore,
    bridge: Option<Arc<dyn ToolBridge>>,
) -> anyhow::Result<Arc<dyn Agent>> {
    match config.agent_kind() {
        AgentKind::Echo => Ok(Arc::new(EchoAgent::new())),
        AgentKind::Scenario => {
            let id = config
                .agent
                .as_ref()
                .and_then(|a| a.scenario.as_deref())
                .context("agent.kind is \"scenario\" but agent.scenario is not set")?;
            let scenario = scenarios
                .get(id)
                .with_context(|| format!("unknown scenario: {id}"))?;
            Ok(Arc::new(ScenarioAgent::new(
                scenario,
                Duration::from_millis(config.event_delay_ms()),
            )))
        }
        AgentKind::Llm => {
            let llm = config.llm.clone().unwrap_or_default();
            let mut agent = LlmAgent::from_config(&llm);
            if let Some(bridge) = bridge {
                agent = agent.with_bridge(bridge);
            }
            Ok(Arc::new(agent))
        }
    }
}
