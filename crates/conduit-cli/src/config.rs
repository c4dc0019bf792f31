use conduit_mcp::ServerConfig;
use conduit_router::{ProviderPolicy, RouterConfig};
use serde::Deserialize;
use std::path::Path;

/// Contents of `conduit.toml`.
#[derive(Debug, Deserialize)]
pub struct ConduitConfig {
    /// Cache and call settings for the router.
    #[serde(default)]
    pub router: RouterConfig,
    /// Servers to connect at startup, in order.
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// One `[[servers]]` table: the connection settings plus how the router
/// may use the server.
#[derive(Debug, Deserialize)]
pub struct ServerEntry {
    /// Connection settings.
    #[serde(flatten)]
    pub server: ServerConfig,
    /// How the router may use this server.
    #[serde(default)]
    pub routing: ProviderPolicy,
}

impl ConduitConfig {
    /// Read and validate the file at `path`.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    /// Parse TOML and validate every server entry.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(raw)?;
        for entry in &config.servers {
            entry.server.validate()?;
        }
        Ok(config)
    }

    /// Connection settings of every server entry.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        self.servers.iter().map(|e| e.server.clone()).collect()
    }

    /// Routing policy for a server; servers without a `routing` table get
    /// the default.
    pub fn policy_for(&self, name: &str) -> ProviderPolicy {
        self.servers
            .iter()
            .find(|e| e.server.name == name)
            .map(|e| e.routing.clone())
            .unwrap_or_default()
    }
}
