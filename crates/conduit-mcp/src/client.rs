//! MCP client core.
//!
//! One [`McpClient`] talks to one server. It owns the transport, matches
//! responses to requests by id, keeps the tool/resource/prompt catalogs
//! current and reconnects on its own when the transport goes away.
//!
//! Every (re)connect starts a new session with its own id, event pump and
//! cancellation token. Pending requests remember the session they were
//! issued under, so a frame from a previous transport can never complete a
//! request from the current one.

use crate::config::ServerConfig;
use crate::metrics::UsageMetrics;
use crate::protocol::{
    client_capabilities, response_message, IncomingMessage, InitializeResult, JsonRpcError,
    JsonRpcNotification, JsonRpcRequest, McpPrompt, McpResource, McpToolDef, McpToolResult,
    ReadResourceResult, METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::state::{ClientEvent, ConnectionHealth, ConnectionState, HealthStatus, SessionState};
use crate::transport::{EventReceiver, HostBus, Transport, TransportEvent};
use chrono::Utc;
use conduit_core::{ConduitError, ConduitResult};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Upper bound on pages fetched for one catalog listing.
const MAX_PAGES: usize = 100;

#[derive(Debug, Clone, Copy)]
enum Catalog {
    Tools,
    Resources,
    Prompts,
}

struct PendingRequest {
    tx: oneshot::Sender<ConduitResult<Value>>,
    method: String,
    submitted_at: Instant,
    session_id: Uuid,
}

#[derive(Default)]
struct Catalogs {
    tools: Vec<McpToolDef>,
    resources: Vec<McpResource>,
    prompts: Vec<McpPrompt>,
}

struct ClientInner {
    name: String,
    config: RwLock<ServerConfig>,
    state: RwLock<ConnectionState>,
    session: RwLock<SessionState>,
    health: RwLock<ConnectionHealth>,
    catalogs: RwLock<Catalogs>,
    metrics: Mutex<UsageMetrics>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    transport: tokio::sync::Mutex<Option<Transport>>,
    session_cancel: Mutex<CancellationToken>,
    reconnect_cancel: Mutex<Option<CancellationToken>>,
    next_id: AtomicU64,
    disconnecting: AtomicBool,
    events: broadcast::Sender<ClientEvent>,
    connect_lock: tokio::sync::Mutex<()>,
    host_bus: Option<Arc<dyn HostBus>>,
}

/// Client for a single MCP server. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct McpClient {
    inner: Arc<ClientInner>,
}

impl McpClient {
    /// Client for `config`. Nothing connects until [`McpClient::connect`].
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    /// Client whose relay transport posts through `bus`.
    pub fn with_host_bus(config: ServerConfig, bus: Arc<dyn HostBus>) -> Self {
        Self::build(config, Some(bus))
    }

    fn build(config: ServerConfig, host_bus: Option<Arc<dyn HostBus>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ClientInner {
                name: config.name.clone(),
                config: RwLock::new(config),
                state: RwLock::new(ConnectionState::Disconnected),
                session: RwLock::new(SessionState::new(client_capabilities())),
                health: RwLock::new(ConnectionHealth::default()),
                catalogs: RwLock::new(Catalogs::default()),
                metrics: Mutex::new(UsageMetrics::default()),
                pending: Mutex::new(HashMap::new()),
                transport: tokio::sync::Mutex::new(None),
                session_cancel: Mutex::new(CancellationToken::new()),
                reconnect_cancel: Mutex::new(None),
                next_id: AtomicU64::new(1),
                disconnecting: AtomicBool::new(false),
                events,
                connect_lock: tokio::sync::Mutex::new(()),
                host_bus,
            }),
        }
    }

    /// Configured server name.
    pub fn server_name(&self) -> &str {
        &self.inner.name
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> ServerConfig {
        self.inner.config.read().clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Whether the handshake completed and the session is live.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Connect the transport, run the handshake and load the catalogs.
    ///
    /// Catalog failures are logged and do not fail the connect. A handshake
    /// failure leaves the client disconnected.
    pub async fn connect(&self) -> ConduitResult<()> {
        self.inner.config.read().validate()?;
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.inner.disconnecting.store(false, Ordering::SeqCst);
        self.inner.cancel_reconnect();
        self.inner.clone().establish().await
    }

    /// Tear the connection down and reject every outstanding request.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.disconnecting.store(true, Ordering::SeqCst);
        inner.cancel_reconnect();
        inner.session_cancel.lock().cancel();
        inner.fail_pending();

        let _guard = inner.connect_lock.lock().await;
        let was_connected = {
            let mut session = inner.session.write();
            let was = session.connected;
            session.connected = false;
            session.initialized = false;
            was
        };
        inner.teardown_session().await;
        inner.set_state(ConnectionState::Disconnected);
        {
            let mut health = inner.health.write();
            health.status = HealthStatus::Disconnected;
            health.connected_since = None;
        }
        if was_connected {
            info!(server = %inner.name, "MCP server disconnected");
            inner.emit(ClientEvent::Disconnected {
                server: inner.name.clone(),
                reason: Some("client disconnect".into()),
            });
        }
    }

    /// Swap the configuration. An active connection is re-established with it.
    pub async fn reconfigure(&self, config: ServerConfig) -> ConduitResult<()> {
        config.validate()?;
        if config.name != self.inner.name {
            return Err(ConduitError::Config(format!(
                "cannot rename server '{}' to '{}'",
                self.inner.name, config.name
            )));
        }
        let was_active = !matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Failed
        );
        if was_active {
            self.disconnect().await;
        }
        *self.inner.config.write() = config;
        info!(server = %self.inner.name, reconnect = was_active, "Server reconfigured");
        if was_active {
            self.connect().await
        } else {
            Ok(())
        }
    }

    /// Invoke a tool from the cached catalog.
    ///
    /// `timeout` overrides the configured per-request deadline.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> ConduitResult<McpToolResult> {
        self.ensure_connected()?;
        if !self.inner.catalogs.read().tools.iter().any(|t| t.name == name) {
            return Err(ConduitError::ToolNotFound {
                server: self.inner.name.clone(),
                tool: name.to_string(),
            });
        }

        let timeout = timeout.unwrap_or_else(|| self.inner.timeout());
        let params = serde_json::json!({"name": name, "arguments": arguments});
        let started = Instant::now();
        let result = self
            .inner
            .request("tools/call", Some(params), timeout)
            .await
            .and_then(|value| {
                serde_json::from_value::<McpToolResult>(value).map_err(ConduitError::from)
            });

        match &result {
            Ok(_) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.inner.metrics.lock().record_success(name, latency_ms);
                debug!(server = %self.inner.name, tool = %name, latency_ms, "Tool call completed");
            }
            Err(e) => {
                self.inner.metrics.lock().record_failure();
                self.inner.health.write().error_count += 1;
                warn!(server = %self.inner.name, tool = %name, error = %e, "Tool call failed");
            }
        }
        result
    }

    /// Fetch the tool catalog and replace the cached copy.
    pub async fn list_tools(&self) -> ConduitResult<Vec<McpToolDef>> {
        self.ensure_connected()?;
        self.inner.fetch_tools().await
    }

    /// Fetch the resource catalog and replace the cached copy.
    pub async fn list_resources(&self) -> ConduitResult<Vec<McpResource>> {
        self.ensure_connected()?;
        self.inner.fetch_resources().await
    }

    /// Fetch the prompt catalog and replace the cached copy.
    pub async fn list_prompts(&self) -> ConduitResult<Vec<McpPrompt>> {
        self.ensure_connected()?;
        self.inner.fetch_prompts().await
    }

    /// Read one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> ConduitResult<ReadResourceResult> {
        self.ensure_connected()?;
        let value = self
            .inner
            .request(
                "resources/read",
                Some(serde_json::json!({"uri": uri})),
                self.inner.timeout(),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Round-trip a `ping`. Returns the measured latency.
    pub async fn ping(&self) -> ConduitResult<Duration> {
        self.ensure_connected()?;
        self.inner.ping().await
    }

    /// Re-fetch every catalog the server advertises. Returns the first error.
    pub async fn refresh_catalogs(&self) -> ConduitResult<()> {
        self.ensure_connected()?;
        let mut first_error = None;
        for catalog in self.inner.advertised_catalogs() {
            if let Err(e) = self.inner.refresh(catalog).await {
                warn!(server = %self.inner.name, catalog = ?catalog, error = %e, "Catalog refresh failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Cached tool catalog.
    pub fn tools(&self) -> Vec<McpToolDef> {
        self.inner.catalogs.read().tools.clone()
    }

    /// Cached resource catalog.
    pub fn resources(&self) -> Vec<McpResource> {
        self.inner.catalogs.read().resources.clone()
    }

    /// Cached prompt catalog.
    pub fn prompts(&self) -> Vec<McpPrompt> {
        self.inner.catalogs.read().prompts.clone()
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> SessionState {
        self.inner.session.read().clone()
    }

    /// Snapshot of connection health.
    pub fn health(&self) -> ConnectionHealth {
        self.inner.health.read().clone()
    }

    /// Snapshot of tool usage metrics.
    pub fn metrics(&self) -> UsageMetrics {
        self.inner.metrics.lock().clone()
    }

    /// Receive lifecycle, catalog and notification events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn ensure_connected(&self) -> ConduitResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ConduitError::connection(&self.inner.name, "not connected"))
        }
    }
}

impl ClientInner {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn timeout(&self) -> Duration {
        self.config.read().timeout()
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn cancel_reconnect(&self) {
        if let Some(token) = self.reconnect_cancel.lock().take() {
            token.cancel();
        }
    }

    /// Brings up a new session. Boxed because reconnection re-enters it from
    /// a task the session itself spawned.
    fn establish(self: Arc<Self>) -> BoxFuture<'static, ConduitResult<()>> {
        async move {
            let config = self.config.read().clone();
            self.set_state(ConnectionState::Connecting);
            self.health.write().status = HealthStatus::Connecting;

            let session = SessionState::new(client_capabilities());
            let session_id = session.session_id;
            *self.session.write() = session;
            let cancel = CancellationToken::new();
            std::mem::replace(&mut *self.session_cancel.lock(), cancel.clone()).cancel();

            let (tx, rx) = mpsc::unbounded_channel();
            let mut transport = Transport::from_config(&config, self.host_bus.clone());
            let kind = transport.kind();
            if let Err(e) = transport.connect(tx).await {
                warn!(server = %self.name, transport = ?kind, error = %e, "Transport connect failed");
                self.set_state(ConnectionState::Disconnected);
                self.health.write().status = HealthStatus::Error;
                return Err(e);
            }
            *self.transport.lock().await = Some(transport);
            self.session.write().connected = true;
            tokio::spawn(run_pump(Arc::downgrade(&self), rx, session_id, cancel.clone()));

            self.set_state(ConnectionState::Handshaking);
            let init = match self.handshake().await {
                Ok(init) => init,
                Err(e) => {
                    self.session.write().connected = false;
                    self.teardown_session().await;
                    self.set_state(ConnectionState::Disconnected);
                    self.health.write().status = HealthStatus::Error;
                    return Err(ConduitError::Connection {
                        server: self.name.clone(),
                        message: format!("handshake failed: {e}"),
                        retryable: e.is_retryable(),
                    });
                }
            };
            info!(
                server = %self.name,
                version = %init.protocol_version,
                transport = ?kind,
                "MCP server initialized"
            );

            {
                let mut session = self.session.write();
                session.initialized = true;
                session.protocol_version = Some(init.protocol_version.clone());
                session.server_capabilities = init.capabilities.clone();
                session.server_info = init.server_info.clone();
            }
            for catalog in self.advertised_catalogs() {
                if let Err(e) = self.refresh(catalog).await {
                    warn!(server = %self.name, catalog = ?catalog, error = %e, "Catalog load failed");
                }
            }

            // The transport may have dropped while catalogs were loading. The
            // session lock is held across the check and the state change so a
            // concurrent `connection_lost` sees either a live `Connected`
            // session or none at all.
            {
                let session = self.session.read();
                if session.session_id != session_id || !session.connected {
                    drop(session);
                    self.set_state(ConnectionState::Disconnected);
                    self.health.write().status = HealthStatus::Error;
                    return Err(ConduitError::ConnectionClosed {
                        server: self.name.clone(),
                    });
                }
                self.set_state(ConnectionState::Connected);
            }
            {
                let mut health = self.health.write();
                health.status = HealthStatus::Connected;
                health.connected_since = Some(Utc::now());
                health.reconnect_attempts = 0;
            }

            if config.health_check_interval_secs > 0 {
                tokio::spawn(run_health_checks(
                    Arc::downgrade(&self),
                    session_id,
                    Duration::from_secs(config.health_check_interval_secs),
                    cancel,
                ));
            }

            info!(
                server = %self.name,
                tools = self.catalogs.read().tools.len(),
                "MCP server connected"
            );
            self.emit(ClientEvent::Connected {
                server: self.name.clone(),
                session_id,
            });
            Ok(())
        }
        .boxed()
    }

    async fn handshake(&self) -> ConduitResult<InitializeResult> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": client_capabilities(),
            "clientInfo": {
                "name": "conduit",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self.request("initialize", Some(params), self.timeout()).await?;
        let init: InitializeResult = serde_json::from_value(result)?;
        self.notify("notifications/initialized", None).await?;
        Ok(init)
    }

    /// Tools are always listed; resources and prompts only when advertised.
    fn advertised_catalogs(&self) -> Vec<Catalog> {
        let session = self.session.read();
        let caps = &session.server_capabilities;
        let mut catalogs = vec![Catalog::Tools];
        if caps.resources.is_some() {
            catalogs.push(Catalog::Resources);
        }
        if caps.prompts.is_some() {
            catalogs.push(Catalog::Prompts);
        }
        catalogs
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> ConduitResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session_id = self.session.read().session_id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingRequest {
                tx,
                method: method.to_string(),
                submitted_at: Instant::now(),
                session_id,
            },
        );
        if self.disconnecting.load(Ordering::SeqCst) {
            self.pending.lock().remove(&id);
            return Err(ConduitError::ConnectionClosed {
                server: self.name.clone(),
            });
        }

        let message = serde_json::to_value(JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.send(message).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        self.session.write().messages_sent += 1;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConduitError::ConnectionClosed {
                server: self.name.clone(),
            }),
            Err(_) => {
                self.pending.lock().remove(&id);
                self.session.write().errors += 1;
                warn!(server = %self.name, method = %method, id, "MCP request timed out");
                Err(ConduitError::Timeout {
                    server: self.name.clone(),
                    method: method.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> ConduitResult<()> {
        let message = serde_json::to_value(JsonRpcNotification::new(method, params))?;
        self.send(message).await?;
        self.session.write().messages_sent += 1;
        Ok(())
    }

    async fn send(&self, message: Value) -> ConduitResult<()> {
        let transport = self.transport.lock().await;
        match transport.as_ref() {
            Some(transport) => transport.send(message),
            None => Err(ConduitError::connection(&self.name, "not connected")),
        }
    }

    async fn ping(&self) -> ConduitResult<Duration> {
        let started = Instant::now();
        self.request("ping", None, self.timeout()).await?;
        let rtt = started.elapsed();
        {
            let mut health = self.health.write();
            health.last_ping_ms = Some(u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX));
            health.last_check = Some(Utc::now());
        }
        Ok(rtt)
    }

    async fn fetch_paged<T: DeserializeOwned>(&self, method: &str, key: &str) -> ConduitResult<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| serde_json::json!({"cursor": c}));
            let result = self.request(method, params, self.timeout()).await?;
            let page: Vec<T> = match result.get(key) {
                Some(list) => serde_json::from_value(list.clone())?,
                None => Vec::new(),
            };
            items.extend(page);
            cursor = result
                .get("nextCursor")
                .and_then(Value::as_str)
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    async fn fetch_tools(&self) -> ConduitResult<Vec<McpToolDef>> {
        let mut tools: Vec<McpToolDef> = self.fetch_paged("tools/list", "tools").await?;
        for tool in &mut tools {
            tool.server = self.name.clone();
        }
        self.catalogs.write().tools = tools.clone();
        debug!(server = %self.name, tools = tools.len(), "Tool catalog updated");
        self.emit(ClientEvent::ToolsChanged {
            server: self.name.clone(),
            count: tools.len(),
        });
        Ok(tools)
    }

    async fn fetch_resources(&self) -> ConduitResult<Vec<McpResource>> {
        let mut resources: Vec<McpResource> =
            self.fetch_paged("resources/list", "resources").await?;
        for resource in &mut resources {
            resource.server = self.name.clone();
        }
        self.catalogs.write().resources = resources.clone();
        self.emit(ClientEvent::ResourcesChanged {
            server: self.name.clone(),
            count: resources.len(),
        });
        Ok(resources)
    }

    async fn fetch_prompts(&self) -> ConduitResult<Vec<McpPrompt>> {
        let mut prompts: Vec<McpPrompt> = self.fetch_paged("prompts/list", "prompts").await?;
        for prompt in &mut prompts {
            prompt.server = self.name.clone();
        }
        self.catalogs.write().prompts = prompts.clone();
        self.emit(ClientEvent::PromptsChanged {
            server: self.name.clone(),
            count: prompts.len(),
        });
        Ok(prompts)
    }

    async fn refresh(&self, catalog: Catalog) -> ConduitResult<usize> {
        match catalog {
            Catalog::Tools => self.fetch_tools().await.map(|v| v.len()),
            Catalog::Resources => self.fetch_resources().await.map(|v| v.len()),
            Catalog::Prompts => self.fetch_prompts().await.map(|v| v.len()),
        }
    }

    fn spawn_refresh(self: &Arc<Self>, catalog: Catalog) {
        let client = Arc::downgrade(self);
        tokio::spawn(async move {
            let Some(inner) = client.upgrade() else { return };
            if let Err(e) = inner.refresh(catalog).await {
                warn!(server = %inner.name, catalog = ?catalog, error = %e, "Catalog refresh failed");
            }
        });
    }

    async fn handle_message(self: &Arc<Self>, message: Value, session_id: Uuid) {
        {
            let mut session = self.session.write();
            session.messages_received += 1;
            session.last_activity = Utc::now();
        }
        match IncomingMessage::classify(message) {
            Some(IncomingMessage::Response { id, outcome }) => self.complete(id, outcome, session_id),
            Some(IncomingMessage::ForeignResponse { id }) => {
                debug!(server = %self.name, id = ?id, "Dropping response with foreign id");
            }
            Some(IncomingMessage::Request { id, method, .. }) => {
                let reply = if method == "ping" {
                    Ok(serde_json::json!({}))
                } else {
                    Err(JsonRpcError {
                        code: METHOD_NOT_FOUND,
                        message: format!("Method not found: {method}"),
                        data: None,
                    })
                };
                if let Err(e) = self.send(response_message(id, reply)).await {
                    debug!(server = %self.name, method = %method, error = %e, "Could not answer server request");
                }
            }
            Some(IncomingMessage::Notification { method, params }) => match method.as_str() {
                "notifications/tools/list_changed" => self.spawn_refresh(Catalog::Tools),
                "notifications/resources/list_changed" => self.spawn_refresh(Catalog::Resources),
                "notifications/prompts/list_changed" => self.spawn_refresh(Catalog::Prompts),
                _ => self.emit(ClientEvent::Notification {
                    server: self.name.clone(),
                    method,
                    params,
                }),
            },
            None => debug!(server = %self.name, "Ignoring non JSON-RPC frame"),
        }
    }

    fn complete(&self, id: u64, outcome: Result<Value, JsonRpcError>, session_id: Uuid) {
        let entry = {
            let mut pending = self.pending.lock();
            match pending.get(&id) {
                Some(p) if p.session_id == session_id => pending.remove(&id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            debug!(server = %self.name, id, "Dropping unmatched response");
            return;
        };

        let latency_ms = entry.submitted_at.elapsed().as_secs_f64() * 1000.0;
        self.session.write().record_latency(latency_ms);
        debug!(server = %self.name, id, method = %entry.method, latency_ms, "Response matched");

        let result = outcome.map_err(|e| ConduitError::Protocol {
            server: self.name.clone(),
            code: e.code,
            message: e.message,
            data: e.data,
        });
        let _ = entry.tx.send(result);
    }

    fn record_transport_error(&self, message: &str) {
        self.session.write().errors += 1;
        self.health.write().error_count += 1;
        warn!(server = %self.name, error = %message, "Transport error");
        self.emit(ClientEvent::Error {
            server: self.name.clone(),
            message: message.to_string(),
            terminal: false,
        });
    }

    fn fail_pending(&self) {
        let drained: Vec<(u64, PendingRequest)> = self.pending.lock().drain().collect();
        for (id, entry) in drained {
            debug!(server = %self.name, id, method = %entry.method, "Rejecting pending request");
            let _ = entry.tx.send(Err(ConduitError::ConnectionClosed {
                server: self.name.clone(),
            }));
        }
    }

    /// Stops the session's tasks, drops the transport and rejects what is pending.
    async fn teardown_session(&self) {
        self.session_cancel.lock().cancel();
        let transport = self.transport.lock().await.take();
        if let Some(mut transport) = transport {
            transport.disconnect().await;
        }
        self.fail_pending();
    }

    async fn connection_lost(self: &Arc<Self>, session_id: Uuid, reason: Option<String>) {
        {
            let mut session = self.session.write();
            if session.session_id != session_id || !session.connected {
                return;
            }
            session.connected = false;
            session.initialized = false;
        }
        if self.disconnecting.load(Ordering::SeqCst) {
            return;
        }

        let was_live = self.state() == ConnectionState::Connected;
        warn!(server = %self.name, reason = ?reason, "MCP connection lost");
        self.teardown_session().await;
        self.set_state(ConnectionState::Disconnected);
        {
            let mut health = self.health.write();
            health.status = HealthStatus::Disconnected;
            health.connected_since = None;
        }
        self.emit(ClientEvent::Disconnected {
            server: self.name.clone(),
            reason,
        });

        let auto_reconnect = self.config.read().auto_reconnect;
        if was_live && auto_reconnect {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.reconnect_cancel.lock().replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(run_reconnect(Arc::downgrade(self), token));
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.session_cancel.get_mut().cancel();
        if let Some(token) = self.reconnect_cancel.get_mut().take() {
            token.cancel();
        }
    }
}

/// Feeds one session's transport events into the client.
async fn run_pump(
    client: Weak<ClientInner>,
    mut events: EventReceiver,
    session_id: Uuid,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        let Some(inner) = client.upgrade() else { return };
        match event {
            Some(TransportEvent::Message(message)) => inner.handle_message(message, session_id).await,
            Some(TransportEvent::Error { message, fatal }) => {
                inner.record_transport_error(&message);
                if fatal {
                    inner.connection_lost(session_id, Some(message)).await;
                    return;
                }
            }
            Some(TransportEvent::Closed { reason }) => {
                inner.connection_lost(session_id, reason).await;
                return;
            }
            None => {
                inner
                    .connection_lost(session_id, Some("transport dropped".into()))
                    .await;
                return;
            }
        }
    }
}

async fn run_health_checks(
    client: Weak<ClientInner>,
    session_id: Uuid,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut timer = tokio::time::interval_at(Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = timer.tick() => {}
        }
        let Some(inner) = client.upgrade() else { return };
        match inner.ping().await {
            Ok(rtt) => {
                inner.health.write().status = HealthStatus::Connected;
                debug!(server = %inner.name, rtt_ms = rtt.as_millis() as u64, "Health check ok");
            }
            Err(e) => {
                warn!(server = %inner.name, error = %e, "MCP health check failed");
                {
                    let mut health = inner.health.write();
                    health.status = HealthStatus::Error;
                    health.error_count += 1;
                    health.last_check = Some(Utc::now());
                }
                let reconnect = inner.config.read().reconnect_on_health_failure;
                if reconnect {
                    inner
                        .connection_lost(session_id, Some(format!("health check failed: {e}")))
                        .await;
                    return;
                }
            }
        }
    }
}

/// Linear backoff: attempt `n` waits `n * retry_delay`.
async fn run_reconnect(client: Weak<ClientInner>, token: CancellationToken) {
    let (attempts, base_delay, name) = {
        let Some(inner) = client.upgrade() else { return };
        let config = inner.config.read();
        (config.retry_attempts, config.retry_delay(), inner.name.clone())
    };

    let mut last_error: Option<ConduitError> = None;
    for attempt in 1..=attempts {
        let delay = base_delay * attempt;
        {
            let Some(inner) = client.upgrade() else { return };
            inner.set_state(ConnectionState::Reconnecting);
            inner.health.write().reconnect_attempts = attempt;
            inner.emit(ClientEvent::Reconnecting {
                server: name.clone(),
                attempt,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            });
        }
        info!(server = %name, attempt, max_attempts = attempts, delay_ms = delay.as_millis() as u64, "Reconnecting to MCP server");

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = client.upgrade() else { return };
        let outcome = {
            let _guard = inner.connect_lock.lock().await;
            if token.is_cancelled() || inner.disconnecting.load(Ordering::SeqCst) {
                return;
            }
            if inner.state() == ConnectionState::Connected {
                return;
            }
            inner.clone().establish().await
        };

        match outcome {
            Ok(()) => {
                inner.health.write().reconnect_attempts = 0;
                info!(server = %name, attempt, "MCP server reconnected");
                inner.emit(ClientEvent::Reconnected {
                    server: name.clone(),
                    attempts: attempt,
                });
                return;
            }
            Err(e) => {
                warn!(server = %name, attempt, error = %e, "MCP reconnect attempt failed");
                let retryable = e.is_retryable();
                last_error = Some(e);
                if !retryable {
                    break;
                }
            }
        }
    }

    if token.is_cancelled() {
        return;
    }
    let Some(inner) = client.upgrade() else { return };
    let detail = last_error.map_or_else(|| "no attempts configured".to_string(), |e| e.to_string());
    let message = format!("reconnect failed after {attempts} attempts: {detail}");
    error!(server = %name, error = %message, "MCP server unreachable");
    inner.set_state(ConnectionState::Failed);
    inner.health.write().status = HealthStatus::Failed;
    inner.emit(ClientEvent::Error {
        server: name,
        message,
        terminal: true,
    });
}
