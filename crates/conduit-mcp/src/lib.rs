//! MCP client subsystem: JSON-RPC protocol types, the four wire transports,
//! the per-server client core and the multi-server manager.

/// Per-server client core.
pub mod client;
/// Server and transport configuration.
pub mod config;
/// Multi-server manager.
pub mod manager;
/// Tool usage metrics.
pub mod metrics;
/// JSON-RPC and MCP message types.
pub mod protocol;
/// Connection, session and health state.
pub mod state;
/// Wire transports.
pub mod transport;

pub use client::McpClient;
pub use config::{
    AuthPlacement, BridgeConfig, PipeConfig, RelayConfig, ServerConfig, StreamConfig, StreamMode,
    TransportConfig, TransportKind,
};
pub use manager::{McpServerManager, McpServerStatus};
pub use metrics::{ToolUsage, UsageMetrics};
pub use protocol::{McpPrompt, McpResource, McpToolDef, McpToolResult, ReadResourceResult};
pub use state::{ClientEvent, ConnectionHealth, ConnectionState, HealthStatus, SessionState};
pub use transport::{HostBus, LocalHostBus, Transport, TransportEvent};
