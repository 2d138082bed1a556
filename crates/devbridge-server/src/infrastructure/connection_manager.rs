//! ConnectionManager: accepts device WebSocket connections, tracks them, and
//! keeps them honest with a heartbeat.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener and upgrading each accepted socket to a
//!    WebSocket session (with a configured message-size ceiling).
//! 2. Assigning each session an opaque id and immediately sending it a
//!    `WELCOME` envelope carrying that id, the server version, and the
//!    capability list.
//! 3. Running one reader task and one writer task per connection.  All
//!    outbound frames go through the writer's channel, so `send_to` never
//!    blocks on a slow socket.
//! 4. Refreshing `last_seen` on every inbound frame and publishing each
//!    decoded envelope on the [`EventBus`].
//! 5. Answering undecodable frames with `ERROR{INVALID_MESSAGE}` without
//!    passing them on.
//! 6. Pinging every connection on a fixed interval and closing any that has
//!    been silent for more than twice that interval.
//!
//! # Connection lifecycle
//!
//! ```text
//! Connecting ──handshake──► Open ──close()/timeout──► Closing ──► Closed
//!      └──────────────── error / handshake timeout ──────────────► Closed
//! ```
//!
//! A connection is in the table only while `Open` or `Closing`.  Removal from
//! the table is the single point where `Disconnected` is published, so every
//! connection produces exactly one `Disconnected` event regardless of which
//! side noticed the close first.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use devbridge_core::protocol::{
    capabilities, decode_envelope, decode_envelope_bytes, encode_envelope, new_envelope_id,
    now_millis, DeviceInfo, Envelope, ErrorCode, ErrorPayload, MessageType, ProtocolError,
    ServerInfo, WelcomePayload, PROTOCOL_VERSION,
};
use devbridge_core::task::ScheduledTask;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{accept_async_with_config, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::correlator::EnvelopeSink;
use crate::application::handlers::DeviceDirectory;
use crate::domain::{BridgeConfig, BridgeError};
use crate::infrastructure::events::{lock, CloseReason, ConnectionEvent, ConnectionId, EventBus, Subscription};

/// Upper bound on the WebSocket upgrade handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server version string advertised in `WELCOME` and discovery replies.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error type for listener setup.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("listener is already running on {0}")]
    AlreadyListening(SocketAddr),
}

/// Settings the connection manager needs from [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    pub heartbeat_interval: Duration,
    pub max_connections: usize,
    pub max_payload_bytes: usize,
}

impl From<&BridgeConfig> for ConnectionManagerConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            max_connections: config.max_connections,
            max_payload_bytes: config.max_payload_bytes,
        }
    }
}

/// Lifecycle state of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Read-only view of a connection, returned by [`ConnectionManager::connections`].
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    pub peer_addr: SocketAddr,
    pub state: ConnectionState,
    /// Wall-clock time of the accept, in ms since the Unix epoch.
    pub connected_at_ms: i64,
    pub idle_for: Duration,
    pub metadata: Option<DeviceInfo>,
}

struct ConnectionEntry {
    peer_addr: SocketAddr,
    state: ConnectionState,
    connected_at_ms: i64,
    /// Monotonic accept order; the newest connection is the default target.
    accept_seq: u64,
    last_seen: Instant,
    metadata: Option<DeviceInfo>,
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: Option<AbortHandle>,
}

/// Owns every device connection of one bridge instance.
pub struct ConnectionManager {
    config: ConnectionManagerConfig,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    accept_counter: Mutex<u64>,
    bus: EventBus,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            connections: Mutex::new(HashMap::new()),
            accept_counter: Mutex::new(0),
            bus: EventBus::new(),
            local_addr: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Registers a listener for connect, message, error, and disconnect events.
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Binds `addr`, then spawns the accept loop and the heartbeat timer.
    ///
    /// Returns the bound address (useful when `addr` uses port 0).
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::BindFailed`] if the port cannot be bound.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, NetworkError> {
        if let Some(bound) = *lock(&self.local_addr) {
            return Err(NetworkError::AlreadyListening(bound));
        }
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::BindFailed { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| NetworkError::BindFailed { addr, source })?;
        *lock(&self.local_addr) = Some(bound);
        info!("bridge listening on ws://{bound}");

        let accept = ScheduledTask::spawn("accept-loop", accept_loop(listener, Arc::downgrade(self)));

        let weak = Arc::downgrade(self);
        let heartbeat = ScheduledTask::every("heartbeat", self.config.heartbeat_interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(mgr) => {
                        mgr.heartbeat_tick();
                        true
                    }
                    None => false,
                }
            }
        });

        lock(&self.tasks).extend([accept, heartbeat]);
        Ok(bound)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Queues `envelope` for the connection.  Returns `false` if the id is
    /// unknown or the connection is no longer writable.
    pub fn send_to(&self, connection_id: &str, envelope: &Envelope) -> bool {
        let text = match encode_envelope(envelope) {
            Ok(t) => t,
            Err(e) => {
                error!("failed to encode {} {}: {e}", envelope.kind, envelope.id);
                return false;
            }
        };
        let connections = lock(&self.connections);
        match connections.get(connection_id) {
            Some(entry) if entry.state == ConnectionState::Open => {
                entry.outbound.send(WsMessage::Text(text)).is_ok()
            }
            _ => false,
        }
    }

    /// Queues `envelope` for every open connection except `exclude`.
    /// Returns the number of connections it was queued for.
    pub fn broadcast(&self, envelope: &Envelope, exclude: Option<&str>) -> usize {
        let text = match encode_envelope(envelope) {
            Ok(t) => t,
            Err(e) => {
                error!("failed to encode broadcast {}: {e}", envelope.kind);
                return 0;
            }
        };
        let connections = lock(&self.connections);
        connections
            .iter()
            .filter(|(id, entry)| {
                Some(id.as_str()) != exclude && entry.state == ConnectionState::Open
            })
            .filter(|(_, entry)| entry.outbound.send(WsMessage::Text(text.clone())).is_ok())
            .count()
    }

    /// Closes a connection with a normal close frame.  Returns `false` if the
    /// id is unknown.
    pub fn close(&self, connection_id: &str, reason: CloseReason) -> bool {
        let (code, text) = match reason {
            CloseReason::HeartbeatTimeout => (CloseCode::Away, "heartbeat timeout"),
            CloseReason::TransportError => (CloseCode::Error, "transport error"),
            _ => (CloseCode::Normal, "closed by bridge"),
        };
        {
            let mut connections = lock(&self.connections);
            let Some(entry) = connections.get_mut(connection_id) else {
                return false;
            };
            entry.state = ConnectionState::Closing;
            let _ = entry.outbound.send(WsMessage::Close(Some(CloseFrame {
                code,
                reason: text.into(),
            })));
        }
        self.remove_connection(connection_id, reason)
    }

    /// Records what a device reported about itself.
    pub fn update_metadata(&self, connection_id: &str, info: DeviceInfo) -> bool {
        match lock(&self.connections).get_mut(connection_id) {
            Some(entry) => {
                debug!(
                    "connection {connection_id} identified as '{}' ({})",
                    info.name, info.platform
                );
                entry.metadata = Some(info);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        lock(&self.connections).contains_key(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Snapshots of all connections, newest first.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        let now = Instant::now();
        let connections = lock(&self.connections);
        let mut list: Vec<(u64, ConnectionSnapshot)> = connections
            .iter()
            .map(|(id, e)| {
                (
                    e.accept_seq,
                    ConnectionSnapshot {
                        id: id.clone(),
                        peer_addr: e.peer_addr,
                        state: e.state,
                        connected_at_ms: e.connected_at_ms,
                        idle_for: now.saturating_duration_since(e.last_seen),
                        metadata: e.metadata.clone(),
                    },
                )
            })
            .collect();
        list.sort_by(|a, b| b.0.cmp(&a.0));
        list.into_iter().map(|(_, s)| s).collect()
    }

    /// The connection untargeted requests go to: the newest open connection
    /// that has announced its [`DeviceInfo`], else the newest open one.
    ///
    /// Sockets that never announce (discovery probes, tooling) only win when
    /// no announced device is connected.
    pub fn default_target(&self, exclude: Option<&str>) -> Option<ConnectionId> {
        let open: Vec<ConnectionSnapshot> = self
            .connections()
            .into_iter()
            .filter(|c| c.state == ConnectionState::Open && Some(c.id.as_str()) != exclude)
            .collect();
        open.iter()
            .find(|c| c.metadata.is_some())
            .or_else(|| open.first())
            .map(|c| c.id.clone())
    }

    /// One heartbeat round: close dead connections, ping the rest.
    pub fn heartbeat_tick(&self) {
        let limit = self.config.heartbeat_interval * 2;
        let now = Instant::now();
        let mut dead = Vec::new();
        {
            let connections = lock(&self.connections);
            for (id, entry) in connections.iter() {
                if now.saturating_duration_since(entry.last_seen) > limit {
                    dead.push(id.clone());
                } else if entry.outbound.send(WsMessage::Ping(Vec::new())).is_err() {
                    debug!("connection {id}: ping not queued, writer gone");
                }
            }
        }
        for id in dead {
            warn!("connection {id}: no traffic for more than {limit:?}; closing");
            self.close(&id, CloseReason::HeartbeatTimeout);
        }
    }

    /// Closes every connection and stops the accept loop and heartbeat.
    pub fn shutdown(&self) {
        lock(&self.tasks).clear();
        let ids: Vec<ConnectionId> = lock(&self.connections).keys().cloned().collect();
        for id in ids {
            self.close(&id, CloseReason::Local);
        }
        *lock(&self.local_addr) = None;
        info!("connection manager stopped");
    }

    // ── Per-connection plumbing ───────────────────────────────────────────────

    fn touch(&self, connection_id: &str) {
        if let Some(entry) = lock(&self.connections).get_mut(connection_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// Removes the connection from the table and publishes `Disconnected`.
    /// Only the first caller for a given id does anything.
    fn remove_connection(&self, connection_id: &str, reason: CloseReason) -> bool {
        let Some(mut entry) = lock(&self.connections).remove(connection_id) else {
            return false;
        };
        entry.state = ConnectionState::Closed;
        info!("connection {connection_id} ({}) closed: {reason:?}", entry.peer_addr);
        self.bus.publish(ConnectionEvent::Disconnected {
            connection_id: connection_id.to_string(),
            reason,
        });
        if let Some(reader) = entry.reader.take() {
            reader.abort();
        }
        true
    }

    /// Inserts a new connection unless the table is full.
    fn register(
        &self,
        peer_addr: SocketAddr,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) -> Option<ConnectionId> {
        let mut connections = lock(&self.connections);
        if connections.len() >= self.config.max_connections {
            return None;
        }
        let accept_seq = {
            let mut counter = lock(&self.accept_counter);
            *counter += 1;
            *counter
        };
        let id = Uuid::new_v4().to_string();
        connections.insert(
            id.clone(),
            ConnectionEntry {
                peer_addr,
                state: ConnectionState::Open,
                connected_at_ms: now_millis(),
                accept_seq,
                last_seen: Instant::now(),
                metadata: None,
                outbound,
                reader: None,
            },
        );
        Some(id)
    }

    fn set_reader(&self, connection_id: &str, reader: AbortHandle) {
        if let Some(entry) = lock(&self.connections).get_mut(connection_id) {
            entry.reader = Some(reader);
        }
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.config.max_payload_bytes);
        config.max_frame_size = Some(self.config.max_payload_bytes);
        config
    }

    /// Runs the handshake for one accepted socket and starts its tasks.
    async fn handle_socket(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let handshake = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            accept_async_with_config(stream, Some(self.ws_config())),
        )
        .await;
        let ws_stream = match handshake {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                warn!("WebSocket handshake with {peer_addr} failed: {e}");
                return;
            }
            Err(_) => {
                warn!("WebSocket handshake with {peer_addr} timed out");
                return;
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let Some(connection_id) = self.register(peer_addr, outbound_tx) else {
            warn!(
                "refusing {peer_addr}: connection limit of {} reached",
                self.config.max_connections
            );
            reject_over_limit(ws_stream).await;
            return;
        };
        info!("connection {connection_id} accepted from {peer_addr}");

        let (ws_tx, ws_rx) = ws_stream.split();
        tokio::spawn(write_loop(
            ws_tx,
            outbound_rx,
            connection_id.clone(),
            Arc::downgrade(&self),
        ));

        let welcome = WelcomePayload {
            connection_id: connection_id.clone(),
            server_version: SERVER_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: capabilities::all(),
        };
        match Envelope::with_payload(MessageType::Welcome, &welcome) {
            Ok(env) => {
                self.send_to(&connection_id, &env);
            }
            Err(e) => error!("failed to build WELCOME: {e}"),
        }

        self.bus.publish(ConnectionEvent::Connected {
            connection_id: connection_id.clone(),
            peer_addr,
        });

        let reader = tokio::spawn(read_loop(ws_rx, connection_id.clone(), Arc::clone(&self)));
        self.set_reader(&connection_id, reader.abort_handle());
    }

    /// Handles one inbound data frame.
    fn on_frame(&self, connection_id: &str, decoded: Result<Envelope, ProtocolError>, raw: &str) {
        match decoded {
            Ok(envelope) => {
                debug!("connection {connection_id}: ← {} {}", envelope.kind, envelope.id);
                self.bus.publish(ConnectionEvent::Message {
                    connection_id: connection_id.to_string(),
                    envelope: Arc::new(envelope),
                });
            }
            Err(e) => {
                warn!("connection {connection_id}: malformed envelope: {e}");
                let reply = Envelope::error(
                    salvage_id(raw),
                    ErrorPayload::new(ErrorCode::InvalidMessage, e.to_string()),
                );
                self.send_to(connection_id, &reply);
                self.bus.publish(ConnectionEvent::Error {
                    connection_id: connection_id.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
}

// ── Application seams ─────────────────────────────────────────────────────────

impl EnvelopeSink for ConnectionManager {
    fn send_to(&self, connection_id: &str, envelope: &Envelope) -> bool {
        ConnectionManager::send_to(self, connection_id, envelope)
    }
}

impl DeviceDirectory for ConnectionManager {
    fn resolve_target(
        &self,
        target: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<ConnectionId, BridgeError> {
        let found = match target {
            Some(t) => self
                .connections()
                .into_iter()
                .filter(|c| c.state == ConnectionState::Open)
                .find(|c| c.id == t || c.metadata.as_ref().is_some_and(|m| m.device_id == t))
                .map(|c| c.id),
            None => self.default_target(exclude),
        };
        found.ok_or_else(|| BridgeError::DeviceUnavailable {
            target: target.unwrap_or("default").to_string(),
        })
    }

    fn aliases(&self, connection_id: &str) -> Vec<String> {
        let mut names = vec![connection_id.to_string()];
        let connections = self.connections();
        if let Some(device_id) = connections
            .iter()
            .find(|c| c.id == connection_id)
            .and_then(|c| c.metadata.as_ref())
            .map(|m| m.device_id.clone())
            .filter(|d| !d.is_empty())
        {
            names.push(device_id);
        }
        // Untargeted requests are cached under "default".
        if self.default_target(None).as_deref() == Some(connection_id) {
            names.push("default".to_string());
        }
        names
    }

    fn record_device(&self, connection_id: &str, info: DeviceInfo) {
        self.update_metadata(connection_id, info);
    }

    fn server_info(&self) -> ServerInfo {
        let addr = self.local_addr();
        ServerInfo {
            host: addr.map(|a| a.ip().to_string()).unwrap_or_default(),
            port: addr.map(|a| a.port()).unwrap_or_default(),
            version: SERVER_VERSION.to_string(),
            capabilities: capabilities::all(),
        }
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, manager: Weak<ConnectionManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let Some(mgr) = manager.upgrade() else {
                    break;
                };
                debug!("TCP connection from {peer_addr}");
                tokio::spawn(mgr.handle_socket(stream, peer_addr));
            }
            Err(e) => {
                // Transient accept error (e.g., too many open file descriptors).
                error!("accept error: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<WsMessage>,
    connection_id: ConnectionId,
    manager: Weak<ConnectionManager>,
) {
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, WsMessage::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!("connection {connection_id}: write failed: {e}");
            if let Some(mgr) = manager.upgrade() {
                mgr.bus.publish(ConnectionEvent::Error {
                    connection_id: connection_id.clone(),
                    message: format!("write failed: {e}"),
                });
                mgr.remove_connection(&connection_id, CloseReason::TransportError);
            }
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    connection_id: ConnectionId,
    manager: Arc<ConnectionManager>,
) {
    let reason = loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                break CloseReason::PeerClosed;
            }
            Some(Err(e)) => {
                warn!("connection {connection_id}: read error: {e}");
                break CloseReason::TransportError;
            }
        };
        manager.touch(&connection_id);
        match msg {
            WsMessage::Text(text) => {
                manager.on_frame(&connection_id, decode_envelope(&text), &text);
            }
            WsMessage::Binary(bytes) => {
                let raw = String::from_utf8_lossy(&bytes).into_owned();
                manager.on_frame(&connection_id, decode_envelope_bytes(&bytes), &raw);
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Close(frame) => {
                debug!("connection {connection_id}: close frame {frame:?}");
                break CloseReason::PeerClosed;
            }
            WsMessage::Frame(_) => {}
        }
    };
    manager.remove_connection(&connection_id, reason);
}

async fn reject_over_limit(mut ws: WebSocketStream<TcpStream>) {
    let reply = Envelope::error(
        new_envelope_id(),
        ErrorPayload::new(ErrorCode::ConnectionLimit, "bridge is at its connection limit"),
    );
    if let Ok(text) = encode_envelope(&reply) {
        let _ = ws.send(WsMessage::Text(text)).await;
    }
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "connection limit".into(),
        }))
        .await;
}

/// Best-effort extraction of the `id` of an undecodable frame so the sender
/// can pair the `ERROR` with what it sent.
fn salvage_id(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(new_envelope_id)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            heartbeat_interval: Duration::from_millis(100),
            max_connections: 2,
            max_payload_bytes: 1024 * 1024,
        }
    }

    fn register_fake(mgr: &ConnectionManager) -> (ConnectionId, mpsc::UnboundedReceiver<WsMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = mgr
            .register("127.0.0.1:5000".parse().unwrap(), tx)
            .expect("below limit");
        (id, rx)
    }

    #[test]
    fn test_salvage_id_recovers_id_from_partial_envelope() {
        assert_eq!(salvage_id(r#"{"id":"abc","type":42}"#), "abc");
    }

    #[test]
    fn test_salvage_id_generates_id_for_garbage() {
        let id = salvage_id("garbage");
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn test_send_to_unknown_id_returns_false() {
        let mgr = ConnectionManager::new(test_config());
        let env = Envelope::new(MessageType::Heartbeat, None);
        assert!(!mgr.send_to("nope", &env));
    }

    #[tokio::test]
    async fn test_send_to_queues_text_frame() {
        // Arrange
        let mgr = ConnectionManager::new(test_config());
        let (id, mut rx) = register_fake(&mgr);
        let env = Envelope::new(MessageType::Heartbeat, None);

        // Act
        let sent = mgr.send_to(&id, &env);

        // Assert
        assert!(sent);
        match rx.recv().await {
            Some(WsMessage::Text(text)) => assert_eq!(decode_envelope(&text).unwrap(), env),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_closed_writer_returns_false() {
        let mgr = ConnectionManager::new(test_config());
        let (id, rx) = register_fake(&mgr);
        drop(rx);
        assert!(!mgr.send_to(&id, &Envelope::new(MessageType::Heartbeat, None)));
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_connection() {
        let mgr = ConnectionManager::new(test_config());
        let (a, _rx_a) = register_fake(&mgr);
        let (_b, mut rx_b) = register_fake(&mgr);

        let count = mgr.broadcast(&Envelope::new(MessageType::Heartbeat, None), Some(&a));

        assert_eq!(count, 1);
        assert!(matches!(rx_b.try_recv(), Ok(WsMessage::Text(_))));
    }

    #[tokio::test]
    async fn test_default_target_prefers_newest_announced_connection() {
        // Arrange: an announced device, then a newer socket that never announces.
        let mgr = ConnectionManager::new(test_config());
        let (device, _rx_device) = register_fake(&mgr);
        mgr.update_metadata(
            &device,
            DeviceInfo {
                device_id: "pixel".into(),
                ..DeviceInfo::default()
            },
        );
        let (anonymous, _rx_anonymous) = register_fake(&mgr);

        // Act / Assert
        assert_eq!(mgr.default_target(None).as_deref(), Some(device.as_str()));
        assert_eq!(mgr.resolve_target(None, None).unwrap(), device);
        assert!(mgr.aliases(&device).contains(&"default".to_string()));
        assert!(!mgr.aliases(&anonymous).contains(&"default".to_string()));
        assert_eq!(mgr.default_target(Some(&device)).as_deref(), Some(anonymous.as_str()));
    }

    #[tokio::test]
    async fn test_default_target_falls_back_to_newest_when_none_announced() {
        let mgr = ConnectionManager::new(test_config());
        let (_older, _rx_a) = register_fake(&mgr);
        let (newer, _rx_b) = register_fake(&mgr);

        assert_eq!(mgr.default_target(None).as_deref(), Some(newer.as_str()));
    }

    #[tokio::test]
    async fn test_register_refuses_beyond_max_connections() {
        let mgr = ConnectionManager::new(test_config());
        let _a = register_fake(&mgr);
        let _b = register_fake(&mgr);
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(mgr.register("127.0.0.1:5001".parse().unwrap(), tx).is_none());
    }

    #[tokio::test]
    async fn test_close_publishes_exactly_one_disconnect() {
        // Arrange
        let mgr = ConnectionManager::new(test_config());
        let mut events = mgr.subscribe();
        let (id, mut rx) = register_fake(&mgr);

        // Act: close twice; the second must be a no-op.
        assert!(mgr.close(&id, CloseReason::Local));
        assert!(!mgr.close(&id, CloseReason::Local));

        // Assert
        assert!(matches!(rx.try_recv(), Ok(WsMessage::Close(_))));
        assert!(matches!(
            events.try_recv(),
            Some(ConnectionEvent::Disconnected { reason: CloseReason::Local, .. })
        ));
        assert!(events.try_recv().is_none());
        assert!(!mgr.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_live_connections() {
        let mgr = ConnectionManager::new(test_config());
        let (_id, mut rx) = register_fake(&mgr);

        mgr.heartbeat_tick();

        assert!(matches!(rx.try_recv(), Ok(WsMessage::Ping(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_closes_connection_silent_for_twice_the_interval() {
        // Arrange
        let mgr = ConnectionManager::new(test_config());
        let mut events = mgr.subscribe();
        let (id, _rx) = register_fake(&mgr);

        // Act: 150ms is past one interval but not two; the connection survives.
        tokio::time::advance(Duration::from_millis(150)).await;
        mgr.heartbeat_tick();
        assert!(mgr.contains(&id));

        tokio::time::advance(Duration::from_millis(100)).await;
        mgr.heartbeat_tick();

        // Assert
        assert!(!mgr.contains(&id));
        assert!(matches!(
            events.try_recv(),
            Some(ConnectionEvent::Disconnected { reason: CloseReason::HeartbeatTimeout, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_connection_alive() {
        let mgr = ConnectionManager::new(test_config());
        let (id, _rx) = register_fake(&mgr);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(150)).await;
            mgr.touch(&id);
            mgr.heartbeat_tick();
        }

        assert!(mgr.contains(&id));
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_invalid_message_reply_and_is_not_published() {
        // Arrange
        let mgr = ConnectionManager::new(test_config());
        let mut events = mgr.subscribe();
        let (id, mut rx) = register_fake(&mgr);
        let raw = r#"{"id":"m1","type":"SCREENSHOT_REQUEST"}"#;

        // Act
        mgr.on_frame(&id, decode_envelope(raw), raw);

        // Assert: sender gets ERROR{INVALID_MESSAGE} echoing the id.
        match rx.try_recv() {
            Ok(WsMessage::Text(text)) => {
                let env = decode_envelope(&text).unwrap();
                assert_eq!(env.kind, MessageType::Error);
                assert_eq!(env.id, "m1");
                assert_eq!(env.error.unwrap().code, "INVALID_MESSAGE");
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        // Subscribers see an Error notification, never a Message.
        assert!(matches!(events.try_recv(), Some(ConnectionEvent::Error { .. })));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_update_metadata_is_visible_in_snapshot() {
        let mgr = ConnectionManager::new(test_config());
        let (id, _rx) = register_fake(&mgr);
        let info = DeviceInfo {
            device_id: "emu-5554".to_string(),
            name: "Pixel 7".to_string(),
            platform: "android".to_string(),
            protocol_version: 1,
            capabilities: vec![],
        };

        assert!(mgr.update_metadata(&id, info.clone()));

        let snap = mgr.connections();
        assert_eq!(snap[0].metadata.as_ref(), Some(&info));
    }

    #[tokio::test]
    async fn test_connections_are_listed_newest_first() {
        let mgr = ConnectionManager::new(test_config());
        let (first, _ra) = register_fake(&mgr);
        let (second, _rb) = register_fake(&mgr);

        let ids: Vec<_> = mgr.connections().into_iter().map(|c| c.id).collect();

        assert_eq!(ids, vec![second, first]);
    }
}
