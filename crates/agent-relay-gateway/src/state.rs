//! Gateway shared state.

use std::sync::Arc;
use std::time::Duration;

use agent_relay_agent::{Agent, ScenarioStore, build_agent};
use agent_relay_core::config::Config;
use agent_relay_tools::{McpManager, ToolBridge};
use tracing::info;

use crate::connections::ConnectionRegistry;
use crate::queue::EventQueue;
use crate::sessions::SessionRegistry;

/// Shared state injected into every handler.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub agent: Arc<dyn Agent>,
    pub scenarios: Arc<ScenarioStore>,
    pub tools: Arc<McpManager>,
    pub sessions: SessionRegistry,
    pub connections: ConnectionRegistry,
    pub queue: EventQueue,
    #[cfg(feature = "metrics")]
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    pub fn new(
        config: Arc<Config>,
        agent: Arc<dyn Agent>,
        scenarios: Arc<ScenarioStore>,
        tools: Arc<McpManager>,
    ) -> Self {
        let heartbeat = Duration::from_secs(config.heartbeat_interval_secs());
        let queue_capacity = config.queue_capacity();
        Self {
            config,
            agent,
            scenarios,
            tools,
            sessions: SessionRegistry::new(),
            connections: ConnectionRegistry::new(heartbeat),
            queue: EventQueue::new(queue_capacity),
            #[cfg(feature = "metrics")]
            metrics_handle: None,
        }
    }

    /// Load scenarios, connect configured MCP servers and build the agent.
    /// Unreachable MCP servers are logged and skipped.
    pub async fn bootstrap(config: Config) -> anyhow::Result<Self> {
        let scenarios = Arc::new(ScenarioStore::from_config(&config)?);

        let tools = Arc::new(McpManager::new());
        let connected = tools.connect_all(&config).await;
        let bridge: Option<Arc<dyn ToolBridge>> = if connected > 0 {
            Some(tools.clone())
        } else {
            None
        };

        let agent = build_agent(&config, &scenarios, bridge)?;
        info!(
            agent = agent.id(),
            scenarios = scenarios.len(),
            mcp_servers = connected,
            "Gateway state ready"
        );

        Ok(Self::new(Arc::new(config), agent, scenarios, tools))
    }

    pub fn event_delay(&self) -> Duration {
        Duration::from_millis(self.config.event_delay_ms())
    }

    pub fn retry_hint_ms(&self) -> u64 {
        self.config.retry_hint_ms()
    }
}
