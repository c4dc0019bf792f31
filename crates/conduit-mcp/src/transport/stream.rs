//! HTTP streaming transport.
//!
//! Inbound traffic arrives over one long-lived `GET`, either as server-sent
//! events or as a newline-framed body. Outbound messages are individual
//! `POST`s; a JSON (or SSE) reply body is fed back as inbound traffic.

use super::{emit_frame, EventSender, LineBuffer, TransportEvent};
use crate::config::{AuthPlacement, StreamConfig, StreamMode};
use conduit_core::{ConduitError, ConduitResult};
use futures_util::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const AUTH_QUERY_PARAM: &str = "access_token";

/// Reads server messages from a streaming HTTP response and POSTs outgoing ones.
pub struct StreamTransport {
    server: String,
    config: StreamConfig,
    http: reqwest::Client,
    post_url: Arc<RwLock<Option<Url>>>,
    bearer: Option<String>,
    connected: Arc<AtomicBool>,
    events: Option<EventSender>,
    reader: Option<JoinHandle<()>>,
}

impl StreamTransport {
    /// Unconnected transport for `server`.
    pub fn new(server: String, config: StreamConfig) -> Self {
        Self {
            server,
            config,
            http: reqwest::Client::new(),
            post_url: Arc::new(RwLock::new(None)),
            bearer: None,
            connected: Arc::new(AtomicBool::new(false)),
            events: None,
            reader: None,
        }
    }

    /// Open the stream; a non-2xx status fails.
    pub async fn connect(&mut self, events: EventSender) -> ConduitResult<()> {
        let token = self.config.resolved_token();
        let placement = self.config.auth_placement;

        let stream_url = self.parse_url(&self.config.url)?;
        let (stream_url, bearer) = apply_auth(stream_url, token.as_deref(), placement);
        let post_target = match &self.config.message_url {
            Some(raw) => self.parse_url(raw)?,
            None => self.parse_url(&self.config.url)?,
        };
        let (post_target, _) = apply_auth(post_target, token.as_deref(), placement);

        let accept = match self.config.mode {
            StreamMode::EventStream => "text/event-stream",
            StreamMode::Chunked => "application/x-ndjson, application/json",
        };

        let mut request = self.http.get(stream_url.clone()).header(ACCEPT, accept);
        if let Some(token) = &bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            ConduitError::connection(&self.server, format!("stream request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConduitError::connection(
                &self.server,
                format!("stream endpoint returned HTTP {status}"),
            ));
        }

        *self.post_url.write() = Some(post_target);
        self.bearer = bearer;
        self.connected.store(true, Ordering::SeqCst);
        self.events = Some(events.clone());

        let server = self.server.clone();
        let connected = self.connected.clone();
        let reader = match self.config.mode {
            StreamMode::EventStream => {
                let endpoint = EndpointUpdate {
                    base: stream_url,
                    post_url: self.post_url.clone(),
                    token,
                    placement,
                };
                tokio::spawn(read_event_stream(response, server, events, connected, endpoint))
            }
            StreamMode::Chunked => tokio::spawn(read_chunked(response, server, events, connected)),
        };
        self.reader = Some(reader);

        info!(server = %self.server, url = %self.config.url, mode = ?self.config.mode, "Stream connected");
        Ok(())
    }

    /// Stop the reader and writer tasks.
    pub async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.events = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Queue a message for POSTing.
    pub fn send(&self, message: Value) -> ConduitResult<()> {
        let not_connected = || ConduitError::connection(&self.server, "not connected");
        if !self.is_connected() {
            return Err(not_connected());
        }
        let events = self.events.clone().ok_or_else(not_connected)?;
        let url = self.post_url.read().clone().ok_or_else(not_connected)?;

        tokio::spawn(post_message(
            self.http.clone(),
            url,
            self.bearer.clone(),
            message,
            self.server.clone(),
            events,
        ));
        Ok(())
    }

    /// Whether the stream reader is running.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn parse_url(&self, raw: &str) -> ConduitResult<Url> {
        Url::parse(raw)
            .map_err(|e| ConduitError::permanent(&self.server, format!("invalid url '{raw}': {e}")))
    }
}

/// Moves the token into the query string, or hands it back for the header.
fn apply_auth(
    mut url: Url,
    token: Option<&str>,
    placement: AuthPlacement,
) -> (Url, Option<String>) {
    match (token, placement) {
        (None, _) => (url, None),
        (Some(token), AuthPlacement::Header) => (url, Some(token.to_string())),
        (Some(token), AuthPlacement::Query) => {
            url.query_pairs_mut().append_pair(AUTH_QUERY_PARAM, token);
            (url, None)
        }
    }
}

/// Context needed to honour `endpoint` events on the event stream.
struct EndpointUpdate {
    base: Url,
    post_url: Arc<RwLock<Option<Url>>>,
    token: Option<String>,
    placement: AuthPlacement,
}

impl EndpointUpdate {
    fn apply(&self, server: &str, data: &str) {
        let target = data.trim();
        // Some servers wrap the endpoint in a JSON object.
        let target = serde_json::from_str::<Value>(target)
            .ok()
            .and_then(|v| v.get("uri").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| target.to_string());

        match self.base.join(&target) {
            Ok(url) => {
                let (url, _) = apply_auth(url, self.token.as_deref(), self.placement);
                debug!(server = %server, endpoint = %url, "Message endpoint updated");
                *self.post_url.write() = Some(url);
            }
            Err(e) => warn!(server = %server, endpoint = %target, error = %e, "Ignoring bad endpoint event"),
        }
    }
}

async fn read_event_stream(
    response: reqwest::Response,
    server: String,
    events: EventSender,
    connected: Arc<AtomicBool>,
    endpoint: EndpointUpdate,
) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::default();
    let mut failure = None;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for event in decoder.push(&bytes) {
                    match event.event.as_deref() {
                        Some("endpoint") => endpoint.apply(&server, &event.data),
                        _ => emit_frame(&events, &server, &event.data),
                    }
                }
            }
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }
    if failure.is_none() {
        for event in decoder.finish() {
            emit_frame(&events, &server, &event.data);
        }
    }

    finish_stream(&server, &events, &connected, failure);
}

async fn read_chunked(
    response: reqwest::Response,
    server: String,
    events: EventSender,
    connected: Arc<AtomicBool>,
) {
    let mut stream = response.bytes_stream();
    let mut lines = LineBuffer::default();
    let mut failure = None;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                for line in lines.push(&bytes) {
                    emit_frame(&events, &server, &line);
                }
            }
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }
    if let Some(tail) = lines.finish() {
        emit_frame(&events, &server, &tail);
    }

    finish_stream(&server, &events, &connected, failure);
}

fn finish_stream(
    server: &str,
    events: &EventSender,
    connected: &AtomicBool,
    failure: Option<String>,
) {
    connected.store(false, Ordering::SeqCst);
    match failure {
        Some(e) => {
            warn!(server = %server, error = %e, "Stream read failed");
            let _ = events.send(TransportEvent::Error {
                message: format!("[{server}] stream read failed: {e}"),
                fatal: true,
            });
            let _ = events.send(TransportEvent::Closed { reason: Some(e) });
        }
        None => {
            info!(server = %server, "Stream ended");
            let _ = events.send(TransportEvent::Closed {
                reason: Some("stream ended".into()),
            });
        }
    }
}

/// One outgoing round trip. Reply bodies are treated as inbound traffic.
pub(crate) async fn post_message(
    http: reqwest::Client,
    url: Url,
    bearer: Option<String>,
    message: Value,
    server: String,
    events: EventSender,
) {
    let mut request = http
        .post(url)
        .header(ACCEPT, "application/json, text/event-stream")
        .json(&message);
    if let Some(token) = &bearer {
        request = request.bearer_auth(token);
    }

    let response = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            let _ = events.send(TransportEvent::Error {
                message: format!("[{server}] post failed: {e}"),
                fatal: false,
            });
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let _ = events.send(TransportEvent::Error {
            message: format!("[{server}] post returned HTTP {status}"),
            fatal: false,
        });
        return;
    }

    let is_sse = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"));

    match response.bytes().await {
        Ok(body) if is_sse => {
            let mut decoder = SseDecoder::default();
            let mut parsed = decoder.push(&body);
            parsed.extend(decoder.finish());
            for event in parsed {
                emit_frame(&events, &server, &event.data);
            }
        }
        Ok(body) => emit_frame(&events, &server, &String::from_utf8_lossy(&body)),
        Err(e) => {
            let _ = events.send(TransportEvent::Error {
                message: format!("[{server}] failed to read reply body: {e}"),
                fatal: false,
            });
        }
    }
}

/// A parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

/// Incremental `text/event-stream` parser.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(pos) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Parses a trailing event that was not terminated by a blank line.
    pub(crate) fn finish(&mut self) -> Vec<SseEvent> {
        let block = std::mem::take(&mut self.buf);
        parse_block(&String::from_utf8_lossy(&block))
            .into_iter()
            .collect()
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data = Vec::new();

    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event.event = Some(value.to_string()),
            "data" => data.push(value.to_string()),
            "id" => event.id = Some(value.to_string()),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    event.data = data.join("\n");
    Some(event)
}
