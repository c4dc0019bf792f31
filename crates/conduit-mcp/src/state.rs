//! Connection, session and health state plus the client event type.

use crate::protocol::{ServerCapabilities, ServerInfo};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Reconnecting,
    /// Reconnect budget exhausted; only an explicit `connect` leaves this state.
    Failed,
}

/// Per-session bookkeeping. Replaced wholesale on every (re)connect.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: Uuid,
    pub connected: bool,
    pub initialized: bool,
    pub protocol_version: Option<String>,
    pub client_capabilities: Value,
    pub server_capabilities: ServerCapabilities,
    pub server_info: Option<ServerInfo>,
    pub last_activity: DateTime<Utc>,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Responses matched to a pending request; the latency mean is over these.
    pub responses: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

impl SessionState {
    /// Fresh session with a new id.
    pub fn new(client_capabilities: Value) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            connected: false,
            initialized: false,
            protocol_version: None,
            client_capabilities,
            server_capabilities: ServerCapabilities::default(),
            server_info: None,
            last_activity: Utc::now(),
            messages_sent: 0,
            messages_received: 0,
            responses: 0,
            errors: 0,
            avg_latency_ms: 0.0,
        }
    }

    /// Counts one matched response and folds its round trip into the
    /// running mean.
    pub fn record_latency(&mut self, latency_ms: f64) {
        self.responses += 1;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / self.responses as f64;
    }
}

/// Health as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
    Failed,
}

/// Health of one client across sessions.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionHealth {
    pub status: HealthStatus,
    pub error_count: u64,
    pub connected_since: Option<DateTime<Utc>>,
    /// Attempts in the current reconnect run; reset on every successful connect.
    pub reconnect_attempts: u32,
    /// Round trip of the most recent successful ping.
    pub last_ping_ms: Option<u64>,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for ConnectionHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Disconnected,
            error_count: 0,
            connected_since: None,
            reconnect_attempts: 0,
            last_ping_ms: None,
            last_check: None,
        }
    }
}

/// Broadcast to every subscriber. Handlers must tolerate repeats.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { server: String, session_id: Uuid },
    Disconnected { server: String, reason: Option<String> },
    /// `terminal` is set once reconnection has given up.
    Error { server: String, message: String, terminal: bool },
    ToolsChanged { server: String, count: usize },
    ResourcesChanged { server: String, count: usize },
    PromptsChanged { server: String, count: usize },
    Notification { server: String, method: String, params: Option<Value> },
    Reconnecting { server: String, attempt: u32, delay_ms: u64 },
    Reconnected { server: String, attempts: u32 },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sessions_get_distinct_ids() {
        let a = SessionState::new(Value::Null);
        let b = SessionState::new(Value::Null);
        assert_ne!(a.session_id, b.session_id);
        assert!(!a.connected && !a.initialized);
    }

    #[test]
    fn test_latency_running_mean() {
        let mut s = SessionState::new(Value::Null);
        s.record_latency(100.0);
        s.record_latency(200.0);
        assert_eq!(s.responses, 2);
        assert!((s.avg_latency_ms - 150.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_mean_ignores_other_inbound_frames() {
        let mut s = SessionState::new(Value::Null);
        // Five notifications, then one response.
        s.messages_received += 5;
        s.messages_received += 1;
        s.record_latency(100.0);
        assert_eq!(s.responses, 1);
        assert!((s.avg_latency_ms - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_health_serializes_snake_case() {
        let json = serde_json::to_value(ConnectionHealth::default()).unwrap();
        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["reconnect_attempts"], 0);
    }
}
