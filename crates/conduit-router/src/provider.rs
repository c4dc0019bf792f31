//! The seam between the router and whatever executes tools.

use async_trait::async_trait;
use conduit_core::{ConduitResult, ContentType};
use conduit_mcp::{McpClient, McpToolDef, McpToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A named source of tools the router can dispatch to.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Added to every candidate score from this provider.
    fn priority(&self) -> i32;

    fn is_connected(&self) -> bool;

    /// Snapshot of the tools currently offered.
    fn tools(&self) -> Vec<McpToolDef>;

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> ConduitResult<McpToolResult>;
}

#[async_trait]
impl ToolProvider for McpClient {
    fn name(&self) -> &str {
        self.server_name()
    }

    fn priority(&self) -> i32 {
        self.config().priority
    }

    fn is_connected(&self) -> bool {
        McpClient::is_connected(self)
    }

    fn tools(&self) -> Vec<McpToolDef> {
        McpClient::tools(self)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> ConduitResult<McpToolResult> {
        McpClient::call_tool(self, name, arguments, timeout).await
    }
}

/// Per-provider routing settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderPolicy {
    /// Explicit allow-list. When non-empty only these content types are
    /// routed to the provider, and they earn the category bonus.
    #[serde(default)]
    pub categories: Vec<ContentType>,
    /// Answer with a marked placeholder instead of trying the next candidate
    /// when a call to this provider fails.
    #[serde(default)]
    pub placeholder_fallback: bool,
}

impl ProviderPolicy {
    /// Policy restricting the provider to `categories`.
    pub fn for_categories(categories: impl IntoIterator<Item = ContentType>) -> Self {
        Self {
            categories: categories.into_iter().collect(),
            placeholder_fallback: false,
        }
    }

    /// Answer with a placeholder when a call fails.
    pub fn with_placeholder_fallback(mut self) -> Self {
        self.placeholder_fallback = true;
        self
    }
}
