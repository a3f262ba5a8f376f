//! Registry of connected MCP servers.

use std::collections::HashMap;
use std::sync::Arc;

use agent_relay_core::config::{Config, McpServerConfig};
use agent_relay_core::run::ToolSpec;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::ToolBridge;
use crate::client::McpClient;
use crate::error::{McpError, Result};
use crate::protocol::{CallToolResult, McpTool};

/// Owns one [`McpClient`] per server id.
///
/// Calls against an unknown server id fail with [`McpError::NotConnected`];
/// nothing connects implicitly.
#[derive(Default)]
pub struct McpManager {
    clients: RwLock<HashMap<String, Arc<McpClient>>>,
    /// Tool name -> owning server id, filled by [`ToolBridge::list_tools`].
    owners: RwLock<HashMap<String, String>>,
}

impl McpManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every server in `config.mcp.servers`. Failures are logged and
    /// skipped; returns the number of servers connected.
    pub async fn connect_all(&self, config: &Config) -> usize {
        let mut connected = 0;
        for (server_id, server) in config.mcp_servers() {
            match self.connect(server_id, server).await {
                Ok(()) => connected += 1,
                Err(e) => warn!(server_id = %server_id, %e, "Failed to connect MCP server"),
            }
        }
        connected
    }

    /// Connect a server. A second call for a connected id is a no-op.
    pub async fn connect(&self, server_id: &str, config: &McpServerConfig) -> Result<()> {
        if self.is_connected(server_id).await {
            return Ok(());
        }

        let client = McpClient::connect(server_id, config).await?;

        let mut clients = self.clients.write().await;
        if clients.contains_key(server_id) {
            // Lost a race with a concurrent connect
            drop(clients);
            client.close().await;
            return Ok(());
        }
        clients.insert(server_id.to_string(), Arc::new(client));
        info!(server_id, "MCP server registered");
        Ok(())
    }

    pub async fn is_connected(&self, server_id: &str) -> bool {
        self.clients.read().await.contains_key(server_id)
    }

    pub async fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.clients.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn client(&self, server_id: &str) -> Result<Arc<McpClient>> {
        self.clients
            .read()
            .await
            .get(server_id)
            .cloned()
            .ok_or_else(|| McpError::NotConnected(server_id.to_string()))
    }

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<McpTool>> {
        self.client(server_id).await?.list_tools().await
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult> {
        self.client(server_id).await?.call_tool(name, arguments).await
    }

    /// Disconnect one server. Returns false when it was not connected.
    pub async fn disconnect(&self, server_id: &str) -> bool {
        let removed = self.clients.write().await.remove(server_id);
        let Some(client) = removed else {
            return false;
        };
        self.owners
            .write()
            .await
            .retain(|_, owner| owner != server_id);
        client.close().await;
        info!(server_id, "MCP server disconnected");
        true
    }

    async fn owner_of(&self, tool: &str) -> Option<String> {
        self.owners.read().await.get(tool).cloned()
    }

    pub async fn disconnect_all(&self) {
        let clients: Vec<_> = self.clients.write().await.drain().collect();
        self.owners.write().await.clear();
        for (server_id, client) in clients {
            client.close().await;
            info!(server_id = %server_id, "MCP server disconnected");
        }
    }
}

#[async_trait]
impl ToolBridge for McpManager {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        let mut specs = Vec::new();
        let mut owners = HashMap::new();

        for server_id in self.server_ids().await {
            let tools = match McpManager::list_tools(self, &server_id).await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server_id = %server_id, %e, "Failed to list MCP tools");
                    continue;
                }
            };
            for tool in tools {
                if owners.contains_key(&tool.name) {
                    warn!(server_id = %server_id, tool = %tool.name, "Duplicate tool name, keeping first");
                    continue;
                }
                owners.insert(tool.name.clone(), server_id.clone());
                specs.push(ToolSpec {
                    name: tool.name,
                    description: tool.description,
                    parameters: tool.input_schema,
                });
            }
        }

        *self.owners.write().await = owners;
        Ok(specs)
    }

    /// Route a call to the server that owns `name`. An unknown name
    /// re-lists every connected server once before giving up, so calls work
    /// without a prior [`ToolBridge::list_tools`].
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let server_id = match self.owner_of(name).await {
            Some(server_id) => server_id,
            None => {
                debug!(tool = name, "Tool owner unknown, refreshing tool list");
                ToolBridge::list_tools(self).await?;
                self.owner_of(name)
                    .await
                    .ok_or_else(|| McpError::UnknownTool(name.to_string()))?
            }
        };
        McpManager::call_tool(self, &server_id, name, arguments).await
    }
}
