//! Configuration loading and validation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};

/// Top-level Agent Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Interval between heartbeat frames on a channel (default: 15s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Reconnect hint written once when a channel opens (default: 3000ms).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_hint_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_ttl_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_ttl_secs: Option<u64>,

    /// Per-session cap on undelivered events (default: 1000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,

    #[serde(default = "default_true")]
    pub cors: bool,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

pub const DEFAULT_PORT: u16 = 8787;

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: None,
            heartbeat_interval_secs: None,
            retry_hint_ms: None,
            sweep_interval_secs: None,
            session_ttl_secs: None,
            connection_ttl_secs: None,
            queue_capacity: None,
            cors: true,
        }
    }
}

/// Which agent runtime answers runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    #[default]
    Echo,
    Scenario,
    Llm,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub kind: AgentKind,

    /// Scenario id used by `POST /agent` when `kind` is `scenario`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,

    /// Directory of `.yaml`/`.yml`/`.json` scenario files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_dir: Option<String>,

    /// Delay between replayed scenario events (default: 50ms).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_delay_ms: Option<u64>,
}

/// OpenAI-compatible chat-completions upstream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,
}

impl LlmConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or("gpt-4o-mini")
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(2)
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(30)
    }

    pub fn retry_base_delay_ms(&self) -> u64 {
        self.retry_base_delay_ms.unwrap_or(1000)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// A remote tool server, reached over HTTP (`url`) or a child process (`command`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Extra request headers for the HTTP transport.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    /// Per-request timeout (default: 30s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl McpServerConfig {
    pub fn http(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(30)
    }

    /// Exactly one of `url` or `command` must be set.
    pub fn check(&self) -> std::result::Result<(), String> {
        match (&self.url, &self.command) {
            (Some(_), Some(_)) => Err("set either url or command, not both".into()),
            (None, None) => Err("one of url or command is required".into()),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "agent_relay_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| RelayError::Config(e.to_string()))?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| {
                tracing::warn!(var = &caps[1], "Config references unset environment variable");
                String::new()
            })
        })
        .into_owned())
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loading config");
        Self::parse(&raw)
    }

    /// Parse config text (JSON5) after env substitution.
    pub fn parse(raw: &str) -> Result<Self> {
        let substituted = substitute_env_vars(raw)?;
        json5::from_str(&substituted).map_err(|e| RelayError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn gateway_port(&self) -> u16 {
        self.gateway.as_ref().map(|g| g.port).unwrap_or(DEFAULT_PORT)
    }

    pub fn gateway_bind(&self) -> String {
        self.gateway
            .as_ref()
            .and_then(|g| g.bind.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }

    pub fn heartbeat_interval_secs(&self) -> u64 {
        self.gateway
            .as_ref()
            .and_then(|g| g.heartbeat_interval_secs)
            .unwrap_or(15)
    }

    pub fn retry_hint_ms(&self) -> u64 {
        self.gateway
            .as_ref()
            .and_then(|g| g.retry_hint_ms)
            .unwrap_or(3000)
    }

    pub fn sweep_interval_secs(&self) -> u64 {
        self.gateway
            .as_ref()
            .and_then(|g| g.sweep_interval_secs)
            .unwrap_or(600)
    }

    pub fn session_ttl_secs(&self) -> u64 {
        self.gateway
            .as_ref()
            .and_then(|g| g.session_ttl_secs)
            .unwrap_or(3600)
    }

    pub fn connection_ttl_secs(&self) -> u64 {
        self.gateway
            .as_ref()
            .and_then(|g| g.connection_ttl_secs)
            .unwrap_or(300)
    }

    pub fn queue_capacity(&self) -> usize {
        self.gateway
            .as_ref()
            .and_then(|g| g.queue_capacity)
            .unwrap_or(1000)
    }

    pub fn cors_enabled(&self) -> bool {
        self.gateway.as_ref().map(|g| g.cors).unwrap_or(true)
    }

    pub fn agent_kind(&self) -> AgentKind {
        self.agent.as_ref().map(|a| a.kind).unwrap_or_default()
    }

    pub fn event_delay_ms(&self) -> u64 {
        self.agent
            .as_ref()
            .and_then(|a| a.event_delay_ms)
            .unwrap_or(50)
    }

    /// Resolved scenario directory, with `~` expanded against the home dir.
    pub fn scenario_dir(&self) -> Option<PathBuf> {
        self.agent
            .as_ref()
            .and_then(|a| a.scenario_dir.as_deref())
            .map(expand_home)
    }

    /// MCP servers in a stable (sorted) order.
    pub fn mcp_servers(&self) -> Vec<(&String, &McpServerConfig)> {
        let mut servers: Vec<_> = self
            .mcp
            .as_ref()
            .map(|m| m.servers.iter().collect())
            .unwrap_or_default();
        servers.sort_by(|a, b| a.0.cmp(b.0));
        servers
    }

    /// Get a config value by dotted path (e.g. "gateway.port").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.agent_kind() == AgentKind::Llm {
            match &self.llm {
                None => warnings.push("agent.kind is 'llm' but no llm section is configured".into()),
                Some(llm) if llm.resolve_api_key().is_none() => {
                    warnings.push("LLM upstream has no API key configured".into())
                }
                Some(_) => {}
            }
        }

        if self.agent_kind() == AgentKind::Scenario
            && self.agent.as_ref().and_then(|a| a.scenario.as_ref()).is_none()
        {
            warnings.push("agent.kind is 'scenario' but agent.scenario is not set".into());
        }

        if let Some(dir) = self.scenario_dir() {
            if !dir.is_dir() {
                errors.push(format!("Scenario directory not found: {}", dir.display()));
            }
        }

        for (id, server) in self.mcp_servers() {
            if let Err(e) = server.check() {
                errors.push(format!("MCP server '{id}': {e}"));
            }
        }

        if let Some(gw) = &self.gateway {
            if gw.port == 0 {
                errors.push("Gateway port cannot be 0".to_string());
            }
            if gw.queue_capacity == Some(0) {
                errors.push("Gateway queue_capacity cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

/// Base directory for Agent Relay data: `~/.agent_relay/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agent_relay")
}
