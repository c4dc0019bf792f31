use conduit_core::{ConduitError, ConduitResult};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single MCP server.
///
/// Immutable once handed to a client; use `McpClient::reconfigure` to swap
/// it, which forces a reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name; also the router provider name.
    pub name: String,
    /// How to reach the server.
    pub transport: TransportConfig,
    /// Per-request deadline in milliseconds (default: 30000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum reconnect attempts before giving up (default: 3).
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base reconnect delay; attempt `n` waits `n * retry_delay_ms` (default: 1000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Added to the router's candidate score.
    #[serde(default)]
    pub priority: i32,
    /// Reconnect after the transport closes or fails (default: true).
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Health check interval in seconds (default: 30). Set to 0 to disable.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    /// Treat a failed health-check ping like a transport close (default: false).
    #[serde(default)]
    pub reconnect_on_health_failure: bool,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}
fn default_health_interval() -> u64 {
    30
}
fn default_relay_retries() -> u32 {
    3
}
fn default_relay_retry_delay_ms() -> u64 {
    500
}

/// Transport selection, tagged by `kind` in config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Pipe(PipeConfig),
    Stream(StreamConfig),
    Bridge(BridgeConfig),
    Relay(RelayConfig),
}

/// Discriminant of [`TransportConfig`] and `Transport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Pipe,
    Stream,
    Bridge,
    Relay,
}

impl TransportConfig {
    /// Which transport this selects.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Pipe(_) => TransportKind::Pipe,
            TransportConfig::Stream(_) => TransportKind::Stream,
            TransportConfig::Bridge(_) => TransportKind::Bridge,
            TransportConfig::Relay(_) => TransportKind::Relay,
        }
    }
}

/// Local subprocess speaking newline-delimited JSON on stdio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Executable to spawn.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

/// Framing used by the HTTP stream transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    /// Server-sent events; one JSON message per event.
    #[default]
    EventStream,
    /// Long-lived response body framed on newlines.
    Chunked,
}

/// Where the bearer token travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPlacement {
    #[default]
    Header,
    /// `access_token` query parameter, for peers that cannot read custom headers.
    Query,
}

/// HTTP endpoint streaming server messages back to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Endpoint streaming server messages.
    pub url: String,
    #[serde(default)]
    pub mode: StreamMode,
    /// Endpoint for outgoing messages; defaults to `url`.
    #[serde(default)]
    pub message_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Environment variable to read the token from when `auth_token` is unset.
    #[serde(default)]
    pub auth_token_env: Option<String>,
    #[serde(default)]
    pub auth_placement: AuthPlacement,
}

impl StreamConfig {
    /// The bearer token, from the config or the named environment variable.
    pub fn resolved_token(&self) -> Option<String> {
        self.auth_token.clone().or_else(|| {
            self.auth_token_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
                .filter(|t| !t.is_empty())
        })
    }
}

/// WebSocket relay process that forwards frames to a named target server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// WebSocket URL of the relay (`ws` or `wss`).
    pub relay_url: String,
    /// Server name announced to the relay in the bridge-control frame.
    pub target: String,
    #[serde(default = "default_relay_retries")]
    pub max_relay_retries: u32,
    #[serde(default = "default_relay_retry_delay_ms")]
    pub relay_retry_delay_ms: u64,
}

/// Host message bus relay (see `HostBus`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Name used to address the server on the bus; defaults to the server name.
    #[serde(default)]
    pub channel: Option<String>,
}

impl ServerConfig {
    /// Config with default timeouts, retries and health checks.
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout_ms: default_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            priority: 0,
            auto_reconnect: true,
            health_check_interval_secs: default_health_interval(),
            reconnect_on_health_failure: false,
        }
    }

    /// Subprocess server.
    pub fn pipe<I, S>(name: impl Into<String>, command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            TransportConfig::Pipe(PipeConfig {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                cwd: None,
            }),
        )
    }

    /// HTTP stream server in the given mode.
    pub fn stream(name: impl Into<String>, url: impl Into<String>, mode: StreamMode) -> Self {
        Self::new(
            name,
            TransportConfig::Stream(StreamConfig {
                url: url.into(),
                mode,
                message_url: None,
                auth_token: None,
                auth_token_env: None,
                auth_placement: AuthPlacement::Header,
            }),
        )
    }

    /// Server reached through a local WebSocket relay.
    pub fn bridge(
        name: impl Into<String>,
        relay_url: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            TransportConfig::Bridge(BridgeConfig {
                relay_url: relay_url.into(),
                target: target.into(),
                max_relay_retries: default_relay_retries(),
                relay_retry_delay_ms: default_relay_retry_delay_ms(),
            }),
        )
    }

    /// Server reached through the host message bus.
    pub fn relay(name: impl Into<String>) -> Self {
        Self::new(name, TransportConfig::Relay(RelayConfig::default()))
    }

    /// Set the router priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the per-request deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the reconnect budget and base delay.
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Set the health-check interval (0 disables) and whether a failed ping reconnects.
    pub fn with_health_check(mut self, interval_secs: u64, reconnect_on_failure: bool) -> Self {
        self.health_check_interval_secs = interval_secs;
        self.reconnect_on_health_failure = reconnect_on_failure;
        self
    }

    /// Per-request deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Base reconnect delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Checks the fields required by the selected transport.
    pub fn validate(&self) -> ConduitResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConduitError::Config("server name must not be empty".into()));
        }
        let invalid = |msg: String| ConduitError::Config(format!("server '{}': {msg}", self.name));

        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be greater than zero".into()));
        }

        match &self.transport {
            TransportConfig::Pipe(pipe) => {
                if pipe.command.trim().is_empty() {
                    return Err(invalid("pipe transport requires a command".into()));
                }
            }
            TransportConfig::Stream(stream) => {
                check_url(&stream.url, &["http", "https"]).map_err(invalid)?;
                if let Some(message_url) = &stream.message_url {
                    check_url(message_url, &["http", "https"]).map_err(invalid)?;
                }
            }
            TransportConfig::Bridge(bridge) => {
                check_url(&bridge.relay_url, &["ws", "wss"]).map_err(invalid)?;
                if bridge.target.trim().is_empty() {
                    return Err(invalid("bridge transport requires a target server".into()));
                }
            }
            TransportConfig::Relay(relay) => {
                if relay.channel.as_deref().is_some_and(|c| c.trim().is_empty()) {
                    return Err(invalid("relay channel must not be blank".into()));
                }
            }
        }

        Ok(())
    }
}

fn check_url(raw: &str, schemes: &[&str]) -> Result<(), String> {
    let url = Url::parse(raw).map_err(|e| format!("invalid url '{raw}': {e}"))?;
    if !schemes.contains(&url.scheme()) {
        return Err(format!(
            "url '{raw}' must use one of: {}",
            schemes.join(", ")
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"name":"fs","transport":{"kind":"pipe","command":"mcp-fs"}}"#,
        )
        .unwrap();
        assert!(config.auto_reconnect);
        assert_eq!(config.health_check_interval_secs, 30);
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.retry_attempts, 3);
        assert_eq!(config.retry_delay_ms, 1_000);
        assert!(!config.reconnect_on_health_failure);
        match &config.transport {
            TransportConfig::Pipe(p) => {
                assert!(p.args.is_empty());
                assert!(p.env.is_empty());
            }
            other => panic!("expected pipe, got {other:?}"),
        }
    }

    #[test]
    fn test_echo_pipe_config_validates() {
        let config = ServerConfig::pipe("echo", "echo", ["hi"]);
        assert!(config.validate().is_ok());
        assert_eq!(config.transport.kind(), TransportKind::Pipe);
    }

    #[test]
    fn test_stream_config_parse() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"name":"remote","priority":5,"transport":{"kind":"stream","url":"https://mcp.example.com/sse","auth_token":"t0k","auth_placement":"query"}}"#,
        )
        .unwrap();
        assert_eq!(config.priority, 5);
        match &config.transport {
            TransportConfig::Stream(s) => {
                assert_eq!(s.mode, StreamMode::EventStream);
                assert_eq!(s.auth_placement, AuthPlacement::Query);
                assert_eq!(s.resolved_token().as_deref(), Some("t0k"));
            }
            other => panic!("expected stream, got {other:?}"),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_failures() {
        assert!(ServerConfig::pipe("", "echo", ["hi"]).validate().is_err());
        assert!(ServerConfig::pipe("x", "  ", Vec::<String>::new()).validate().is_err());
        assert!(ServerConfig::stream("x", "ftp://host", StreamMode::Chunked)
            .validate()
            .is_err());
        assert!(ServerConfig::stream("x", "not a url", StreamMode::Chunked)
            .validate()
            .is_err());
        assert!(ServerConfig::bridge("x", "http://localhost:1", "fs")
            .validate()
            .is_err());
        assert!(ServerConfig::bridge("x", "ws://localhost:1", "")
            .validate()
            .is_err());

        let mut zero = ServerConfig::relay("x");
        zero.timeout_ms = 0;
        let err = zero.validate().unwrap_err();
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_bridge_and_relay_validate() {
        assert!(ServerConfig::bridge("b", "ws://127.0.0.1:7000", "fs")
            .validate()
            .is_ok());
        assert!(ServerConfig::relay("r").validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::relay("r")
            .with_priority(7)
            .with_timeout(Duration::from_millis(250))
            .with_retry(5, Duration::from_millis(20))
            .with_health_check(0, true);
        assert_eq!(config.priority, 7);
        assert_eq!(config.timeout(), Duration::from_millis(250));
        assert_eq!(config.retry_attempts, 5);
        assert_eq!(config.retry_delay(), Duration::from_millis(20));
        assert_eq!(config.health_check_interval_secs, 0);
        assert!(config.reconnect_on_health_failure);
    }
}
