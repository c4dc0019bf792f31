//! Relay through a host message bus.
//!
//! Frames travel as [`RelayEnvelope`]s tagged with the channel name. The
//! host answers on the same channel with `FromHost` envelopes. When the host
//! has not installed its presence marker the relay cannot work at all, so
//! connecting fails with a non-retryable error.

use super::{emit_frame, EventSender, TransportEvent};
use conduit_core::{ConduitError, ConduitResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const BUS_CAPACITY: usize = 256;

/// Which way an envelope travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayDirection {
    ToHost,
    FromHost,
}

/// Payload of a relay envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// A JSON-RPC payload, either as a JSON value or as raw text.
    Message { payload: Value },
    /// The channel was torn down by either side.
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
}

/// One message on the host bus, addressed to a server channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Channel name; replies are correlated by it.
    pub server: String,
    pub direction: RelayDirection,
    pub frame: RelayFrame,
}

impl RelayEnvelope {
    /// Envelope from the client to the host.
    pub fn to_host(server: impl Into<String>, frame: RelayFrame) -> Self {
        Self {
            server: server.into(),
            direction: RelayDirection::ToHost,
            frame,
        }
    }

    /// Envelope from the host to the client.
    pub fn from_host(server: impl Into<String>, frame: RelayFrame) -> Self {
        Self {
            server: server.into(),
            direction: RelayDirection::FromHost,
            frame,
        }
    }
}

/// The host side of the relay: whatever environment embeds the client.
pub trait HostBus: Send + Sync {
    /// Whether the host has announced that it can relay.
    fn marker_present(&self) -> bool;

    fn post(&self, envelope: RelayEnvelope) -> ConduitResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope>;
}

/// In-process bus backed by a broadcast channel.
pub struct LocalHostBus {
    tx: broadcast::Sender<RelayEnvelope>,
    marker: AtomicBool,
}

impl LocalHostBus {
    /// Bus with the host marker present.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            marker: AtomicBool::new(true),
        }
    }

    /// A bus whose host never announced itself.
    pub fn without_marker() -> Self {
        let bus = Self::new();
        bus.set_marker(false);
        bus
    }

    /// Install or remove the host marker.
    pub fn set_marker(&self, present: bool) {
        self.marker.store(present, Ordering::SeqCst);
    }

    /// Deliver a payload to the client listening on `server`.
    pub fn reply(&self, server: &str, payload: Value) {
        let _ = self.tx.send(RelayEnvelope::from_host(server, RelayFrame::Message { payload }));
    }

    /// Tell the client on `server` that the host dropped the channel.
    pub fn drop_channel(&self, server: &str, reason: impl Into<String>) {
        let _ = self.tx.send(RelayEnvelope::from_host(
            server,
            RelayFrame::Disconnected {
                reason: Some(reason.into()),
            },
        ));
    }
}

impl Default for LocalHostBus {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBus for LocalHostBus {
    fn marker_present(&self) -> bool {
        self.marker.load(Ordering::SeqCst)
    }

    fn post(&self, envelope: RelayEnvelope) -> ConduitResult<()> {
        if self.tx.send(envelope).is_err() {
            debug!("Host bus has no listeners, frame dropped");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RelayEnvelope> {
        self.tx.subscribe()
    }
}

/// Reaches a server through the host bus.
pub struct RelayTransport {
    server: String,
    channel: String,
    bus: Option<Arc<dyn HostBus>>,
    connected: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl RelayTransport {
    /// Transport for `server` addressed on `channel`.
    pub fn new(server: String, channel: String, bus: Option<Arc<dyn HostBus>>) -> Self {
        Self {
            server,
            channel,
            bus,
            connected: Arc::new(AtomicBool::new(false)),
            listener: None,
        }
    }

    /// Check for the host and start listening on the channel.
    pub async fn connect(&mut self, events: EventSender) -> ConduitResult<()> {
        let bus = self
            .bus
            .clone()
            .ok_or_else(|| ConduitError::permanent(&self.server, "no host bus available"))?;
        if !bus.marker_present() {
            return Err(ConduitError::permanent(
                &self.server,
                "relay host not present (marker missing)",
            ));
        }

        let mut rx = bus.subscribe();
        self.connected.store(true, Ordering::SeqCst);

        let server = self.server.clone();
        let channel = self.channel.clone();
        let connected = self.connected.clone();
        self.listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope)
                        if envelope.server == channel
                            && envelope.direction == RelayDirection::FromHost =>
                    {
                        match envelope.frame {
                            RelayFrame::Message { payload } => deliver(&events, &server, payload),
                            RelayFrame::Disconnected { reason } => {
                                info!(server = %server, reason = ?reason, "Host closed relay channel");
                                connected.store(false, Ordering::SeqCst);
                                let _ = events.send(TransportEvent::Closed { reason });
                                break;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(server = %server, skipped, "Relay listener lagged");
                        let _ = events.send(TransportEvent::Error {
                            message: format!("[{server}] relay dropped {skipped} frames"),
                            fatal: false,
                        });
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        connected.store(false, Ordering::SeqCst);
                        let _ = events.send(TransportEvent::Closed {
                            reason: Some("host bus closed".into()),
                        });
                        break;
                    }
                }
            }
        }));

        info!(server = %self.server, channel = %self.channel, "Relay channel open");
        Ok(())
    }

    /// Stop listening and tell the host the channel closed.
    pub async fn disconnect(&mut self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        if let (true, Some(bus)) = (was_connected, &self.bus) {
            let _ = bus.post(RelayEnvelope::to_host(
                &self.channel,
                RelayFrame::Disconnected { reason: None },
            ));
        }
    }

    /// Post a message to the host.
    pub fn send(&self, message: Value) -> ConduitResult<()> {
        let bus = self
            .bus
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or_else(|| ConduitError::connection(&self.server, "not connected"))?;
        bus.post(RelayEnvelope::to_host(
            &self.channel,
            RelayFrame::Message { payload: message },
        ))
    }

    /// Whether the listener is running.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Hosts may hand back either a parsed object or the raw text of a frame.
fn deliver(events: &EventSender, server: &str, payload: Value) {
    match payload {
        Value::Object(_) => {
            let _ = events.send(TransportEvent::Message(payload));
        }
        Value::String(text) => emit_frame(events, server, &text),
        other => emit_frame(events, server, &other.to_string()),
    }
}
