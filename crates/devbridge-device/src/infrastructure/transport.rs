//! Transport: the device's single outbound WebSocket connection to the bridge.
//!
//! Responsibilities:
//!
//! 1. `connect(url)` opens the socket and waits for the bridge's `WELCOME`
//!    before reporting success; a second `connect` while connected or
//!    connecting is a no-op.
//! 2. Immediately after every (re)connect it announces the device with a
//!    `HEARTBEAT{device}` and flushes envelopes queued by `send_or_queue`,
//!    in order.
//! 3. It sends an application-level `HEARTBEAT` on a fixed interval while
//!    connected, independent of WebSocket ping/pong.
//! 4. On an abnormal close (any close code but 1000, or no close frame at
//!    all) it reconnects with capped exponential backoff.  A clean close or
//!    an explicit [`Transport::disconnect`] never reconnects.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──WELCOME──► Connected
//!      ▲                          │                      │
//!      │                     error/timeout          abnormal close
//!      │                          ▼                      ▼
//!      └──── attempts exhausted / disconnect() ──── Reconnecting ──delay──► Connecting
//! ```
//!
//! # Stale closes
//!
//! Every established socket gets a new generation number.  The reader task
//! reports its close tagged with that generation to a supervisor task; a
//! report whose generation is no longer current (the socket was replaced or
//! explicitly disconnected) is ignored.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use devbridge_core::protocol::{
    decode_envelope, decode_envelope_bytes, encode_envelope, DeviceInfo, Envelope,
    HeartbeatPayload, MessageType, ProtocolError, WelcomePayload,
};
use devbridge_core::task::ScheduledTask;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::domain::DeviceConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code of a clean, intentional shutdown.
pub const NORMAL_CLOSE: u16 = 1000;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors surfaced by [`Transport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected to a bridge")]
    NotConnected,

    #[error("connecting timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Connect(String),

    /// The socket opened but the bridge did not complete the `WELCOME`
    /// handshake (for example it answered `CONNECTION_LIMIT`).
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] ProtocolError),

    #[error("connection closed")]
    Closed,
}

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), max_delay)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Settings the transport needs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on socket open plus `WELCOME`.
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    pub queue_capacity: usize,
    pub max_payload_bytes: usize,
    /// Announced to the bridge after every connect and in each heartbeat.
    pub device: DeviceInfo,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_device_config(&DeviceConfig::default(), DeviceInfo::default())
    }
}

impl TransportConfig {
    pub fn from_device_config(config: &DeviceConfig, device: DeviceInfo) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            heartbeat_interval: config.heartbeat_interval,
            backoff: BackoffPolicy {
                base: config.reconnect_base,
                max_delay: config.reconnect_max_delay,
                max_attempts: config.reconnect_attempts,
            },
            queue_capacity: config.queue_capacity,
            max_payload_bytes: config.max_payload_bytes,
            device,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Everything the transport reports to its owner, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The `WELCOME` handshake completed.
    Connected { connection_id: String },
    /// An envelope arrived from the bridge.
    Message(Envelope),
    /// The socket closed; `code` is absent when no close frame was seen.
    Closed { code: Option<u16> },
    /// A reconnect attempt is scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts are exhausted; the transport stays disconnected.
    GaveUp,
}

struct CloseNotice {
    generation: u64,
    code: Option<u16>,
}

struct Inner {
    state: TransportState,
    url: Option<String>,
    generation: u64,
    connection_id: Option<String>,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    queue: VecDeque<Envelope>,
    /// Set by `disconnect`; suppresses reconnects until the next `connect`.
    manual_close: bool,
    reconnect_attempt: u32,
    reader: Option<ScheduledTask>,
    heartbeat: Option<ScheduledTask>,
    reconnect: Option<ScheduledTask>,
}

/// One device-to-bridge connection with reconnection.
pub struct Transport {
    config: TransportConfig,
    inner: Mutex<Inner>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closes: mpsc::UnboundedSender<CloseNotice>,
    supervisor: Mutex<Option<ScheduledTask>>,
}

impl Transport {
    /// Creates a disconnected transport and the receiver for its events.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: TransportConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closes_tx, closes_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            config,
            inner: Mutex::new(Inner {
                state: TransportState::Disconnected,
                url: None,
                generation: 0,
                connection_id: None,
                outbound: None,
                queue: VecDeque::new(),
                manual_close: false,
                reconnect_attempt: 0,
                reader: None,
                heartbeat: None,
                reconnect: None,
            }),
            events: events_tx,
            closes: closes_tx,
            supervisor: Mutex::new(None),
        });
        let supervisor = ScheduledTask::spawn(
            "transport-supervisor",
            supervise(Arc::downgrade(&transport), closes_rx),
        );
        *lock(&transport.supervisor) = Some(supervisor);
        (transport, events_rx)
    }

    /// Connects to `url` and completes the `WELCOME` handshake.
    ///
    /// Returns immediately with `Ok` if already connected, connecting, or
    /// waiting to reconnect.  A failed first connect is reported to the
    /// caller and does not start the reconnect loop.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] if the handshake does not finish within
    /// the connect timeout, [`TransportError::Connect`] /
    /// [`TransportError::Handshake`] if the bridge cannot be reached or
    /// refuses the session.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<(), TransportError> {
        {
            let mut inner = lock(&self.inner);
            if inner.state != TransportState::Disconnected {
                debug!("connect({url}) ignored: transport is {:?}", inner.state);
                return Ok(());
            }
            inner.state = TransportState::Connecting;
            inner.url = Some(url.to_string());
            inner.manual_close = false;
            inner.reconnect_attempt = 0;
        }

        let result = self.establish(url).await;
        if result.is_err() {
            let mut inner = lock(&self.inner);
            if inner.state == TransportState::Connecting {
                inner.state = TransportState::Disconnected;
            }
        }
        result
    }

    /// Sends `envelope` now.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] unless connected; nothing is queued.
    pub fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = encode_envelope(envelope)?;
        let inner = lock(&self.inner);
        match (&inner.state, &inner.outbound) {
            (TransportState::Connected, Some(tx)) => {
                tx.send(WsMessage::Text(text)).map_err(|_| TransportError::Closed)
            }
            _ => Err(TransportError::NotConnected),
        }
    }

    /// Sends `envelope` now if connected, otherwise buffers it until the next
    /// connect.  When the buffer is full the oldest envelope is dropped.
    ///
    /// Returns `true` if the envelope went out immediately.
    pub fn send_or_queue(&self, envelope: Envelope) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == TransportState::Connected {
            if let (Some(tx), Ok(text)) = (&inner.outbound, encode_envelope(&envelope)) {
                if tx.send(WsMessage::Text(text)).is_ok() {
                    return true;
                }
            }
        }
        if inner.queue.len() >= self.config.queue_capacity {
            if let Some(dropped) = inner.queue.pop_front() {
                debug!("send queue full, dropping oldest {} {}", dropped.kind, dropped.id);
            }
        }
        inner.queue.push_back(envelope);
        false
    }

    /// Closes the connection with code 1000 and cancels the heartbeat and
    /// any pending reconnect.  Safe to call in any state.
    pub fn disconnect(&self) {
        let (outbound, was_connected) = {
            let mut inner = lock(&self.inner);
            inner.manual_close = true;
            inner.generation += 1;
            inner.reconnect = None;
            inner.heartbeat = None;
            inner.reader = None;
            inner.connection_id = None;
            let was_connected = inner.state == TransportState::Connected;
            inner.state = TransportState::Disconnected;
            (inner.outbound.take(), was_connected)
        };
        if let Some(tx) = outbound {
            let _ = tx.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "device disconnect".into(),
            })));
        }
        if was_connected {
            info!("disconnected from bridge");
            self.emit(TransportEvent::Closed {
                code: Some(NORMAL_CLOSE),
            });
        }
    }

    pub fn state(&self) -> TransportState {
        lock(&self.inner).state
    }

    /// Connection id assigned by the bridge in the current `WELCOME`.
    pub fn connection_id(&self) -> Option<String> {
        lock(&self.inner).connection_id.clone()
    }

    /// `true` while a reconnect attempt is pending or running.
    pub fn reconnect_scheduled(&self) -> bool {
        lock(&self.inner)
            .reconnect
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn queued_len(&self) -> usize {
        lock(&self.inner).queue.len()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn ws_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.config.max_payload_bytes);
        config.max_frame_size = Some(self.config.max_payload_bytes);
        config
    }

    /// Opens the socket, waits for `WELCOME`, and brings the session up.
    async fn establish(self: &Arc<Self>, url: &str) -> Result<(), TransportError> {
        let timeout = self.config.connect_timeout;
        let handshake = async {
            let (mut ws, _) = connect_async_with_config(url, Some(self.ws_config()), false)
                .await
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            let connection_id = wait_for_welcome(&mut ws).await?;
            Ok::<_, TransportError>((ws, connection_id))
        };
        let (ws, connection_id) = match tokio::time::timeout(timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(TransportError::Timeout(timeout)),
        };

        let (sink, stream) = ws.split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(sink, rx));

        // The disconnect check and the move to Connected share one lock.
        let mut inner = lock(&self.inner);
        if inner.manual_close {
            let _ = tx.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "device disconnect".into(),
            })));
            return Err(TransportError::Closed);
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.state = TransportState::Connected;
        inner.connection_id = Some(connection_id.clone());
        inner.reconnect_attempt = 0;
        info!("connected to bridge at {url} as {connection_id}");
        self.emit(TransportEvent::Connected {
            connection_id: connection_id.clone(),
        });

        if let Ok(text) = encode_envelope(&self.heartbeat_envelope()) {
            let _ = tx.send(WsMessage::Text(text));
        }
        let queued: Vec<Envelope> = inner.queue.drain(..).collect();
        if !queued.is_empty() {
            debug!("flushing {} queued envelopes", queued.len());
        }
        for envelope in queued {
            match encode_envelope(&envelope) {
                Ok(text) => {
                    let _ = tx.send(WsMessage::Text(text));
                }
                Err(e) => warn!("dropping queued {}: {e}", envelope.kind),
            }
        }
        inner.outbound = Some(tx);

        inner.reader = Some(ScheduledTask::spawn(
            "transport-reader",
            read_loop(stream, generation, self.events.clone(), self.closes.clone()),
        ));

        let weak = Arc::downgrade(self);
        inner.heartbeat = Some(ScheduledTask::every(
            "device-heartbeat",
            self.config.heartbeat_interval,
            move || {
                let weak = weak.clone();
                async move {
                    let Some(transport) = weak.upgrade() else {
                        return false;
                    };
                    if let Err(e) = transport.send(&transport.heartbeat_envelope()) {
                        debug!("heartbeat skipped: {e}");
                    }
                    true
                }
            },
        ));
        Ok(())
    }

    fn heartbeat_envelope(&self) -> Envelope {
        let payload = HeartbeatPayload {
            device: Some(self.config.device.clone()),
        };
        Envelope::with_payload(MessageType::Heartbeat, &payload)
            .unwrap_or_else(|_| Envelope::new(MessageType::Heartbeat, None))
    }

    /// Handles the end of a socket reported by its reader.
    fn on_closed(self: &Arc<Self>, notice: CloseNotice) {
        let mut inner = lock(&self.inner);
        if notice.generation != inner.generation || inner.state != TransportState::Connected {
            debug!("ignoring close of stale connection generation {}", notice.generation);
            return;
        }
        inner.outbound = None;
        inner.heartbeat = None;
        inner.connection_id = None;
        self.emit(TransportEvent::Closed { code: notice.code });

        if notice.code == Some(NORMAL_CLOSE) || inner.manual_close {
            info!("bridge closed the connection cleanly");
            inner.state = TransportState::Disconnected;
            return;
        }

        warn!("connection lost (close code {:?}); reconnecting", notice.code);
        inner.state = TransportState::Reconnecting;
        inner.reconnect = Some(ScheduledTask::spawn(
            "transport-reconnect",
            reconnect_loop(Arc::downgrade(self)),
        ));
    }

    /// Advances the attempt counter.  Returns the delay before the next
    /// attempt, or `None` once attempts are exhausted or the transport was
    /// disconnected meanwhile.
    fn next_attempt(&self) -> Option<Duration> {
        let mut inner = lock(&self.inner);
        if inner.manual_close {
            return None;
        }
        inner.reconnect_attempt += 1;
        let attempt = inner.reconnect_attempt;
        if attempt > self.config.backoff.max_attempts {
            warn!("giving up after {} reconnect attempts", attempt - 1);
            inner.state = TransportState::Disconnected;
            self.emit(TransportEvent::GaveUp);
            return None;
        }
        let delay = self.config.backoff.delay(attempt);
        inner.state = TransportState::Reconnecting;
        info!("reconnect attempt {attempt} in {delay:?}");
        self.emit(TransportEvent::Reconnecting { attempt, delay });
        Some(delay)
    }

    /// Moves `Reconnecting` to `Connecting` and returns the url to dial.
    fn begin_attempt(&self) -> Option<String> {
        let mut inner = lock(&self.inner);
        if inner.manual_close || inner.state != TransportState::Reconnecting {
            return None;
        }
        inner.state = TransportState::Connecting;
        inner.url.clone()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = inner.outbound.take() {
            let _ = tx.send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "device shutting down".into(),
            })));
        }
    }
}

async fn supervise(transport: Weak<Transport>, mut closes: mpsc::UnboundedReceiver<CloseNotice>) {
    while let Some(notice) = closes.recv().await {
        match transport.upgrade() {
            Some(t) => t.on_closed(notice),
            None => break,
        }
    }
}

async fn reconnect_loop(transport: Weak<Transport>) {
    loop {
        let Some(delay) = transport.upgrade().and_then(|t| t.next_attempt()) else {
            return;
        };
        tokio::time::sleep(delay).await;

        let Some(t) = transport.upgrade() else {
            return;
        };
        let Some(url) = t.begin_attempt() else {
            return;
        };
        match t.establish(&url).await {
            Ok(()) => return,
            Err(e) => warn!("reconnect to {url} failed: {e}"),
        }
    }
}

/// Reads until the bridge's `WELCOME` and returns the assigned connection id.
async fn wait_for_welcome(ws: &mut WsStream) -> Result<String, TransportError> {
    while let Some(msg) = ws.next().await {
        let msg = msg.map_err(|e| TransportError::Handshake(e.to_string()))?;
        let envelope = match msg {
            WsMessage::Text(text) => decode_envelope(&text),
            WsMessage::Binary(bytes) => decode_envelope_bytes(&bytes),
            WsMessage::Close(_) => return Err(TransportError::Closed),
            _ => continue,
        };
        let envelope = match envelope {
            Ok(env) => env,
            Err(e) => {
                warn!("undecodable frame during handshake: {e}");
                continue;
            }
        };
        match envelope.kind {
            MessageType::Welcome => {
                let welcome: WelcomePayload = envelope
                    .payload()
                    .map_err(|e| TransportError::Handshake(e.to_string()))?;
                return Ok(welcome.connection_id);
            }
            MessageType::Error => {
                let reason = envelope
                    .error
                    .map(|e| format!("{}: {}", e.code, e.message))
                    .unwrap_or_else(|| "bridge refused the connection".to_string());
                return Err(TransportError::Handshake(reason));
            }
            other => debug!("ignoring {other} before WELCOME"),
        }
    }
    Err(TransportError::Closed)
}

async fn write_loop(
    mut sink: SplitSink<WsStream, WsMessage>,
    mut outbound: mpsc::UnboundedReceiver<WsMessage>,
) {
    while let Some(msg) = outbound.recv().await {
        let closing = matches!(msg, WsMessage::Close(_));
        if let Err(e) = sink.send(msg).await {
            debug!("write to bridge failed: {e}");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    generation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
    closes: mpsc::UnboundedSender<CloseNotice>,
) {
    let code = loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!("read from bridge failed: {e}");
                break None;
            }
            None => break None,
        };
        let decoded = match msg {
            WsMessage::Text(text) => decode_envelope(&text),
            WsMessage::Binary(bytes) => decode_envelope_bytes(&bytes),
            WsMessage::Close(frame) => break frame.map(|f| u16::from(f.code)),
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };
        match decoded {
            Ok(envelope) => {
                debug!("received {} {}", envelope.kind, envelope.id);
                let _ = events.send(TransportEvent::Message(envelope));
            }
            Err(e) => warn!("dropping undecodable frame from bridge: {e}"),
        }
    };
    let _ = closes.send(CloseNotice { generation, code });
}

// ── Tests ─────────────────────────────────────────────────────────────────────
