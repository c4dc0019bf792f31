use thiserror::Error;

/// A convenience `Result` alias using [`ConduitError`].
pub type ConduitResult<T> = Result<T, ConduitError>;

/// Top-level error type shared by every Conduit crate.
///
/// Protocol-facing variants carry the name of the server they originated
/// from so callers can surface them without extra bookkeeping.
#[derive(Error, Debug)]
pub enum ConduitError {
    /// Transport or handshake failure.
    #[error("Connection error [{server}]: {message}")]
    Connection {
        server: String,
        message: String,
        /// `false` when retrying cannot help (e.g. the host relay is absent).
        retryable: bool,
    },

    /// The connection was torn down while the request was outstanding.
    #[error("Connection error [{server}]: connection closed")]
    ConnectionClosed { server: String },

    /// A request exceeded its deadline.
    #[error("Timeout [{server}]: '{method}' did not complete within {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The tool is not in the server's cached catalog.
    #[error("Tool not found [{server}]: '{tool}'")]
    ToolNotFound { server: String, tool: String },

    /// The remote side answered with a JSON-RPC error object.
    #[error("Protocol error [{server}] {code}: {message}")]
    Protocol {
        server: String,
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No registered provider can serve the requested content type.
    #[error("No provider available for content type '{content_type}'")]
    NoProvider { content_type: String },

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConduitError {
    /// Builds a retryable [`ConduitError::Connection`].
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Builds a [`ConduitError::Connection`] that reconnect loops must not retry.
    pub fn permanent(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// The server this error originated from, if any.
    pub fn server(&self) -> Option<&str> {
        match self {
            Self::Connection { server, .. }
            | Self::ConnectionClosed { server }
            | Self::Timeout { server, .. }
            | Self::ToolNotFound { server, .. }
            | Self::Protocol { server, .. } => Some(server),
            _ => None,
        }
    }

    /// Whether a reconnect loop may try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { retryable, .. } => *retryable,
            Self::ConnectionClosed { .. } | Self::Timeout { .. } | Self::Io(_) => true,
            _ => false,
        }
    }

    /// True for every variant describing a broken or missing connection.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ConnectionClosed { .. })
    }
}
