//! Wire transports.
//!
//! Every transport pushes inbound traffic into the [`EventSender`] handed to
//! `connect` instead of returning it, since several of them deliver
//! server-initiated frames at arbitrary times. `send` fails synchronously
//! only when the transport is not connected; every other failure arrives as
//! a [`TransportEvent`].

/// WebSocket relay bridge.
pub mod bridge;
/// Subprocess stdio.
pub mod pipe;
/// Host message bus relay.
pub mod relay;
/// HTTP event stream or chunked body.
pub mod stream;

pub use bridge::BridgeTransport;
pub use pipe::PipeTransport;
pub use relay::{HostBus, LocalHostBus, RelayDirection, RelayEnvelope, RelayFrame, RelayTransport};
pub use stream::StreamTransport;

use crate::config::{ServerConfig, TransportConfig, TransportKind};
use conduit_core::ConduitResult;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something a transport observed on its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One decoded JSON-RPC message.
    Message(Value),
    /// A failure. `fatal` errors mean the channel is gone.
    Error { message: String, fatal: bool },
    /// The channel closed.
    Closed { reason: Option<String> },
}

/// Where a transport delivers its events.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
/// Receiving side of [`EventSender`].
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// The four supported transports. Dispatch is by variant.
pub enum Transport {
    Pipe(PipeTransport),
    Stream(StreamTransport),
    Bridge(BridgeTransport),
    Relay(RelayTransport),
}

impl Transport {
    /// Builds the transport selected by `config`. The host bus is only used
    /// by the relay variant.
    pub fn from_config(config: &ServerConfig, host_bus: Option<Arc<dyn HostBus>>) -> Self {
        let server = config.name.clone();
        match &config.transport {
            TransportConfig::Pipe(pipe) => Transport::Pipe(PipeTransport::new(server, pipe.clone())),
            TransportConfig::Stream(stream) => {
                Transport::Stream(StreamTransport::new(server, stream.clone()))
            }
            TransportConfig::Bridge(bridge) => {
                Transport::Bridge(BridgeTransport::new(server, bridge.clone()))
            }
            TransportConfig::Relay(relay) => {
                let channel = relay.channel.clone().unwrap_or_else(|| server.clone());
                Transport::Relay(RelayTransport::new(server, channel, host_bus))
            }
        }
    }

    /// Which variant this is.
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Pipe(_) => TransportKind::Pipe,
            Transport::Stream(_) => TransportKind::Stream,
            Transport::Bridge(_) => TransportKind::Bridge,
            Transport::Relay(_) => TransportKind::Relay,
        }
    }

    /// Open the connection; events flow to `events` until it closes.
    pub async fn connect(&mut self, events: EventSender) -> ConduitResult<()> {
        match self {
            Transport::Pipe(t) => t.connect(events).await,
            Transport::Stream(t) => t.connect(events).await,
            Transport::Bridge(t) => t.connect(events).await,
            Transport::Relay(t) => t.connect(events).await,
        }
    }

    /// Close the connection. Idempotent.
    pub async fn disconnect(&mut self) {
        match self {
            Transport::Pipe(t) => t.disconnect().await,
            Transport::Stream(t) => t.disconnect().await,
            Transport::Bridge(t) => t.disconnect().await,
            Transport::Relay(t) => t.disconnect().await,
        }
    }

    /// Queue one JSON-RPC message.
    pub fn send(&self, message: Value) -> ConduitResult<()> {
        match self {
            Transport::Pipe(t) => t.send(message),
            Transport::Stream(t) => t.send(message),
            Transport::Bridge(t) => t.send(message),
            Transport::Relay(t) => t.send(message),
        }
    }

    /// Whether the connection is open.
    pub fn is_connected(&self) -> bool {
        match self {
            Transport::Pipe(t) => t.is_connected(),
            Transport::Stream(t) => t.is_connected(),
            Transport::Bridge(t) => t.is_connected(),
            Transport::Relay(t) => t.is_connected(),
        }
    }
}

/// Decodes one text frame and reports it. Malformed frames become
/// non-fatal errors and are never delivered as messages.
pub(crate) fn emit_frame(events: &EventSender, server: &str, frame: &str) {
    let frame = frame.trim();
    if frame.is_empty() {
        return;
    }
    match serde_json::from_str::<Value>(frame) {
        Ok(Value::Array(batch)) => {
            for item in batch {
                let _ = events.send(TransportEvent::Message(item));
            }
        }
        Ok(value @ Value::Object(_)) => {
            let _ = events.send(TransportEvent::Message(value));
        }
        Ok(other) => {
            let _ = events.send(TransportEvent::Error {
                message: format!("[{server}] frame is not a JSON-RPC object: {other}"),
                fatal: false,
            });
        }
        Err(e) => {
            tracing::debug!(server = %server, frame = %frame, error = %e, "Malformed frame");
            let _ = events.send(TransportEvent::Error {
                message: format!("[{server}] malformed frame: {e}"),
                fatal: false,
            });
        }
    }
}

/// Splits a byte stream into newline-terminated lines, keeping any partial
/// line until the next chunk arrives.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Whatever is left once the stream ends without a final newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&std::mem::take(&mut self.buf))
            .trim()
            .to_string();
        (!rest.is_empty()).then_some(rest)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_line_buffer_keeps_partial_lines() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(br#"{"jsonrpc":"2.0","#).is_empty());
        let lines = buf.push(b"\"id\":1}\n{\"a\":");
        assert_eq!(lines, vec![r#"{"jsonrpc":"2.0","id":1}"#.to_string()]);
        let lines = buf.push(b"2}\r\n\n");
        assert_eq!(lines, vec![r#"{"a":2}"#.to_string()]);
        assert!(buf.finish().is_none());
    }

    #[test]
    fn test_line_buffer_split_utf8() {
        let mut buf = LineBuffer::default();
        let bytes = "{\"t\":\"é\"}\n".as_bytes();
        // Split inside the two-byte character.
        assert!(buf.push(&bytes[..7]).is_empty());
        let lines = buf.push(&bytes[7..]);
        assert_eq!(lines, vec!["{\"t\":\"é\"}".to_string()]);
    }

    #[test]
    fn test_line_buffer_finish_returns_tail() {
        let mut buf = LineBuffer::default();
        buf.push(b"{\"tail\":true}");
        assert_eq!(buf.finish().as_deref(), Some("{\"tail\":true}"));
    }

    #[test]
    fn test_emit_frame_routes_malformed_to_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        emit_frame(&tx, "s", "hi");
        emit_frame(&tx, "s", r#"{"jsonrpc":"2.0","method":"ping"}"#);
        emit_frame(&tx, "s", "42");
        emit_frame(&tx, "s", "   ");

        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Error { fatal: false, .. }));
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Message(_)));
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Error { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_frame_unpacks_batches() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        emit_frame(&tx, "s", r#"[{"id":1,"result":{}},{"id":2,"result":{}}]"#);
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Message(_)));
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Message(_)));
    }
}
