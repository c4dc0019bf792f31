//! WebSocket bridge to a local relay process.
//!
//! The first frame on every socket names the target server; after that
//! frames are forwarded opaquely. When the socket drops, the bridge retries
//! on its own before reporting the channel closed.

use super::{emit_frame, EventSender, TransportEvent};
use crate::config::BridgeConfig;
use conduit_core::{ConduitError, ConduitResult};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frame announcing which server the relay should attach us to.
pub fn bridge_control(target: &str) -> Value {
    serde_json::json!({"type": "bridge_connect", "server": target})
}

/// Reaches a server through a WebSocket relay.
pub struct BridgeTransport {
    server: String,
    config: BridgeConfig,
    outbound: Option<mpsc::UnboundedSender<String>>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl BridgeTransport {
    /// Unconnected bridge for `server`.
    pub fn new(server: String, config: BridgeConfig) -> Self {
        Self {
            server,
            config,
            outbound: None,
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Open the socket and announce the target server.
    pub async fn connect(&mut self, events: EventSender) -> ConduitResult<()> {
        let ws = open(&self.server, &self.config).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        self.cancel = CancellationToken::new();
        self.connected.store(true, Ordering::SeqCst);
        self.outbound = Some(tx);
        self.task = Some(tokio::spawn(run_bridge(
            ws,
            rx,
            self.server.clone(),
            self.config.clone(),
            events,
            self.connected.clone(),
            self.cancel.clone(),
        )));

        info!(server = %self.server, relay = %self.config.relay_url, target = %self.config.target, "Bridge connected");
        Ok(())
    }

    /// Stop the socket task.
    pub async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        self.outbound = None;
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
    }

    /// Queue a frame for the socket task.
    pub fn send(&self, message: Value) -> ConduitResult<()> {
        let outbound = self
            .outbound
            .as_ref()
            .filter(|_| self.is_connected())
            .ok_or_else(|| ConduitError::connection(&self.server, "not connected"))?;
        outbound
            .send(serde_json::to_string(&message)?)
            .map_err(|_| ConduitError::connection(&self.server, "not connected"))
    }

    /// Whether the socket task is running.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn open(server: &str, config: &BridgeConfig) -> ConduitResult<WsStream> {
    let (mut ws, _) = connect_async(config.relay_url.as_str())
        .await
        .map_err(|e| ConduitError::connection(server, format!("relay connect failed: {e}")))?;
    ws.send(Message::text(bridge_control(&config.target).to_string()))
        .await
        .map_err(|e| ConduitError::connection(server, format!("bridge handshake failed: {e}")))?;
    Ok(ws)
}

enum Stop {
    Cancelled,
    Lost(String),
}

async fn run_bridge(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    server: String,
    config: BridgeConfig,
    events: EventSender,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    loop {
        let reason = match pump(&mut ws, &mut outbound, &server, &events, &cancel).await {
            Stop::Cancelled => {
                let _ = ws.close(None).await;
                return;
            }
            Stop::Lost(reason) => reason,
        };
        connected.store(false, Ordering::SeqCst);
        warn!(server = %server, reason = %reason, "Relay socket lost, retrying");

        let mut attempt: u32 = 0;
        ws = loop {
            attempt += 1;
            if attempt > config.max_relay_retries {
                let message = format!(
                    "[{server}] relay unreachable after {} attempts: {reason}",
                    config.max_relay_retries
                );
                let _ = events.send(TransportEvent::Error { message, fatal: true });
                let _ = events.send(TransportEvent::Closed { reason: Some(reason) });
                return;
            }
            let delay = Duration::from_millis(config.relay_retry_delay_ms * u64::from(attempt));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            match open(&server, &config).await {
                Ok(ws) => break ws,
                Err(e) => warn!(server = %server, attempt, error = %e, "Relay reconnect failed"),
            }
        };
        connected.store(true, Ordering::SeqCst);
        info!(server = %server, attempt, "Relay socket re-established");
    }
}

async fn pump(
    ws: &mut WsStream,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    server: &str,
    events: &EventSender,
    cancel: &CancellationToken,
) -> Stop {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Stop::Cancelled,
            frame = outbound.recv() => {
                let Some(frame) = frame else { return Stop::Cancelled };
                if let Err(e) = ws.send(Message::text(frame)).await {
                    return Stop::Lost(format!("write failed: {e}"));
                }
            }
            incoming = ws.next() => match incoming {
                Some(Ok(Message::Text(text))) => handle_frame(events, server, &text),
                Some(Ok(Message::Binary(data))) => {
                    handle_frame(events, server, &String::from_utf8_lossy(&data));
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = ws.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return Stop::Lost("relay closed the socket".into()),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Stop::Lost(e.to_string()),
            },
        }
    }
}

/// Relay control frames carry a `type` field; everything else is payload.
fn handle_frame(events: &EventSender, server: &str, text: &str) {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        match value.get("type").and_then(Value::as_str) {
            Some("bridge_error") => {
                let detail = value.get("message").and_then(Value::as_str).unwrap_or("unknown");
                let _ = events.send(TransportEvent::Error {
                    message: format!("[{server}] relay error: {detail}"),
                    fatal: false,
                });
                return;
            }
            Some(kind) if kind.starts_with("bridge_") => {
                debug!(server = %server, kind = %kind, "Relay control frame");
                return;
            }
            _ => {}
        }
    }
    emit_frame(events, server, text);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config(url: String, retries: u32) -> BridgeConfig {
        BridgeConfig {
            relay_url: url,
            target: "files".into(),
            max_relay_retries: retries,
            relay_retry_delay_ms: 10,
        }
    }

    #[test]
    fn test_bridge_control_frame() {
        let frame = bridge_control("files");
        assert_eq!(frame["type"], "bridge_connect");
        assert_eq!(frame["server"], "files");
    }

    #[test]
    fn test_handle_frame_filters_control() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_frame(&tx, "s", r#"{"type":"bridge_connected"}"#);
        assert!(rx.try_recv().is_err());
        handle_frame(&tx, "s", r#"{"type":"bridge_error","message":"no such server"}"#);
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Error { fatal: false, .. }));
        handle_frame(&tx, "s", r#"{"jsonrpc":"2.0","id":1,"result":{}}"#);
        assert!(matches!(rx.try_recv().unwrap(), TransportEvent::Message(_)));
    }

    #[tokio::test]
    async fn test_bridge_sends_control_then_forwards() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (control_tx, control_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let first = ws.next().await.unwrap().unwrap();
            let _ = control_tx.send(first.into_text().unwrap().to_string());
            // Echo every payload back.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        });

        let mut transport = BridgeTransport::new("bridge".into(), config(format!("ws://{addr}"), 1));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        let control: Value = serde_json::from_str(&control_rx.await.unwrap()).unwrap();
        assert_eq!(control, bridge_control("files"));

        let msg = serde_json::json!({"jsonrpc": "2.0", "id": 5, "result": {"ok": true}});
        transport.send(msg.clone()).unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, TransportEvent::Message(msg));

        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_bridge_gives_up_after_relay_retries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
            // Listener dropped here: every reconnect is refused.
        });

        let mut transport = BridgeTransport::new("bridge".into(), config(format!("ws://{addr}"), 2));
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.connect(tx).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, TransportEvent::Error { fatal: true, .. }));
        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Closed { .. }));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_bridge_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut transport = BridgeTransport::new("bridge".into(), config(format!("ws://{addr}"), 1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport.connect(tx).await.unwrap_err();
        assert!(err.is_connection());
    }
}
