use crate::client::McpClient;
use crate::config::{ServerConfig, TransportKind};
use crate::state::ConnectionState;
use crate::transport::HostBus;
use chrono::{DateTime, Utc};
use conduit_core::{ConduitError, ConduitResult};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Status of a managed MCP server.
#[derive(Debug, Clone, Serialize)]
pub struct McpServerStatus {
    pub name: String,
    pub transport: TransportKind,
    pub state: ConnectionState,
    pub connected: bool,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    pub priority: i32,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Explicit reconnects through the manager.
    pub reconnect_count: usize,
    /// Failed calls and transport errors.
    pub error_count: u64,
}

struct ManagedServer {
    client: McpClient,
    reconnect_count: usize,
}

/// Owns one [`McpClient`] per configured server, in registration order.
pub struct McpServerManager {
    servers: RwLock<Vec<ManagedServer>>,
    host_bus: Option<Arc<dyn HostBus>>,
}

impl McpServerManager {
    /// Manager without a host bus; relay servers fail to connect.
    pub fn new() -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            host_bus: None,
        }
    }

    /// Manager whose relay-transport servers post through `bus`.
    pub fn with_host_bus(bus: Arc<dyn HostBus>) -> Self {
        Self {
            servers: RwLock::new(Vec::new()),
            host_bus: Some(bus),
        }
    }

    /// Connect to all configured servers.
    /// Returns a list of errors for servers that failed to connect.
    pub async fn connect_all(&self, configs: &[ServerConfig]) -> Vec<ConduitError> {
        let mut errors = Vec::new();

        for config in configs {
            if let Err(e) = self.add_server(config.clone()).await {
                warn!(
                    server = %config.name,
                    error = %e,
                    "Failed to connect MCP server"
                );
                errors.push(e);
            }
        }

        errors
    }

    /// Connect one server and start managing it. Servers that fail to
    /// connect are not kept.
    pub async fn add_server(&self, config: ServerConfig) -> ConduitResult<McpClient> {
        config.validate()?;
        self.ensure_unique(&config.name).await?;

        let client = match &self.host_bus {
            Some(bus) => McpClient::with_host_bus(config, bus.clone()),
            None => McpClient::new(config),
        };
        client.connect().await?;

        let mut servers = self.servers.write().await;
        if servers.iter().any(|s| s.client.server_name() == client.server_name()) {
            drop(servers);
            client.disconnect().await;
            return Err(duplicate(client.server_name()));
        }
        servers.push(ManagedServer {
            client: client.clone(),
            reconnect_count: 0,
        });
        info!(
            server = %client.server_name(),
            tools = client.tools().len(),
            "MCP server connected"
        );
        Ok(client)
    }

    /// Disconnect a server and stop managing it.
    pub async fn remove_server(&self, name: &str) -> ConduitResult<()> {
        let removed = {
            let mut servers = self.servers.write().await;
            let index = servers
                .iter()
                .position(|s| s.client.server_name() == name)
                .ok_or_else(|| unknown(name))?;
            servers.remove(index)
        };
        removed.client.disconnect().await;
        info!(server = %name, "MCP server removed");
        Ok(())
    }

    /// Drop the current connection and establish a fresh one.
    pub async fn reconnect(&self, name: &str) -> ConduitResult<()> {
        let client = self.client(name).await.ok_or_else(|| unknown(name))?;
        info!(server = %name, "Reconnecting MCP server on request");
        client.disconnect().await;
        client.connect().await?;

        let mut servers = self.servers.write().await;
        if let Some(server) = servers.iter_mut().find(|s| s.client.server_name() == name) {
            server.reconnect_count += 1;
        }
        Ok(())
    }

    /// Swap a server's configuration, reconnecting it if it was active.
    pub async fn reconfigure(&self, config: ServerConfig) -> ConduitResult<()> {
        let client = self
            .client(&config.name)
            .await
            .ok_or_else(|| unknown(&config.name))?;
        client.reconfigure(config).await
    }

    /// Client for `name`, if managed.
    pub async fn client(&self, name: &str) -> Option<McpClient> {
        self.servers
            .read()
            .await
            .iter()
            .find(|s| s.client.server_name() == name)
            .map(|s| s.client.clone())
    }

    /// All managed clients in registration order.
    pub async fn clients(&self) -> Vec<McpClient> {
        self.servers
            .read()
            .await
            .iter()
            .map(|s| s.client.clone())
            .collect()
    }

    /// Get the status of all managed servers.
    pub async fn status(&self) -> Vec<McpServerStatus> {
        let servers = self.servers.read().await;
        servers
            .iter()
            .map(|s| {
                let client = &s.client;
                let config = client.config();
                let health = client.health();
                McpServerStatus {
                    name: client.server_name().to_string(),
                    transport: config.transport.kind(),
                    state: client.state(),
                    connected: client.is_connected(),
                    tool_count: client.tools().len(),
                    resource_count: client.resources().len(),
                    prompt_count: client.prompts().len(),
                    priority: config.priority,
                    connected_at: health.connected_since,
                    last_health_check: health.last_check,
                    reconnect_count: s.reconnect_count,
                    error_count: health.error_count,
                }
            })
            .collect()
    }

    /// Get the number of managed servers.
    pub async fn server_count(&self) -> usize {
        self.servers.read().await.len()
    }

    /// Disconnect every managed server. They stay registered.
    pub async fn disconnect_all(&self) {
        for client in self.clients().await {
            client.disconnect().await;
        }
    }

    async fn ensure_unique(&self, name: &str) -> ConduitResult<()> {
        let servers = self.servers.read().await;
        if servers.iter().any(|s| s.client.server_name() == name) {
            return Err(duplicate(name));
        }
        Ok(())
    }
}

impl Default for McpServerManager {
    fn default() -> Self {
        Self::new()
    }
}

fn duplicate(name: &str) -> ConduitError {
    ConduitError::Config(format!("server '{name}' is already registered"))
}

fn unknown(name: &str) -> ConduitError {
    ConduitError::Config(format!("unknown server '{name}'"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_server_status_serialization() {
        let status = McpServerStatus {
            name: "test-server".to_string(),
            transport: TransportKind::Pipe,
            state: ConnectionState::Connected,
            connected: true,
            tool_count: 5,
            resource_count: 0,
            prompt_count: 0,
            priority: 0,
            connected_at: Some(Utc::now()),
            last_health_check: None,
            reconnect_count: 0,
            error_count: 0,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("test-server"));
        assert!(json.contains("tool_count"));
        assert!(json.contains("\"state\":\"connected\""));
    }

    #[tokio::test]
    async fn test_manager_empty() {
        let mgr = McpServerManager::new();
        assert_eq!(mgr.server_count().await, 0);
        assert!(mgr.status().await.is_empty());
        assert!(mgr.client("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_connect_nonexistent_server() {
        let mgr = McpServerManager::new();
        let mut config = ServerConfig::pipe("ghost", "/nonexistent/mcp-server", Vec::<String>::new());
        config.auto_reconnect = false;
        let errors = mgr.connect_all(&[config]).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_connection());
        assert_eq!(mgr.server_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_reported_per_server() {
        let mgr = McpServerManager::new();
        let bad = ServerConfig::stream("web", "ftp://example.com", crate::config::StreamMode::Chunked);
        let errors = mgr.connect_all(&[bad]).await;
        assert!(matches!(errors[0], ConduitError::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_server_operations() {
        let mgr = McpServerManager::new();
        assert!(mgr.remove_server("nope").await.is_err());
        assert!(mgr.reconnect("nope").await.is_err());
        let err = mgr
            .reconfigure(ServerConfig::relay("nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown server"));
    }
}
