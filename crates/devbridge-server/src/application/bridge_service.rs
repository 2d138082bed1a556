//! The bridge facade: the five operations an agent adapter calls.
//!
//! [`Bridge::start`] wires the components together:
//!
//! ```text
//!   ConnectionManager ──events──► Correlator ──► handlers
//!          ▲                          │
//!          └──────── send_to ─────────┘
//!
//!   request_screenshot ─► screenshot cache ─► Correlator::issue ─► device
//!   request_context    ─► context cache    ─► Correlator::issue ─► device
//!   send_command       ─────────────────────► Correlator::issue ─► device
//! ```
//!
//! Each `Bridge` owns its components outright, so several bridges can run in
//! one process (the integration tests do exactly that).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use devbridge_core::protocol::{
    CommandPayload, CommandResult, ContextOptions, ContextRequest, ContextSnapshot, Envelope,
    MessageType, ScreenshotOptions, ScreenshotPayload, ScreenshotRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::application::cache::{cache_key, CacheStats, ResponseCache};
use crate::application::context_cache::ContextCache;
use crate::application::correlator::Correlator;
use crate::application::handlers::{
    CommandHandler, DeviceDirectory, DiscoveryHandler, ForwardHandler, HeartbeatHandler,
};
use crate::domain::{BridgeConfig, BridgeError, ConfigError};
use crate::infrastructure::{
    ConnectionManager, ConnectionManagerConfig, ConnectionSnapshot, NetworkError, SERVER_VERSION,
};

/// Why the bridge could not start.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// One connected device as reported by [`Bridge::list_connected_devices`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSummary {
    pub connection_id: String,
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub platform: Option<String>,
    pub peer_addr: String,
    pub connected_at: i64,
    pub idle_ms: u64,
    pub capabilities: Vec<String>,
    /// `true` for the device untargeted requests go to.
    pub is_default: bool,
}

impl DeviceSummary {
    fn from_snapshot(snapshot: ConnectionSnapshot, is_default: bool) -> Self {
        let meta = snapshot.metadata;
        Self {
            connection_id: snapshot.id,
            device_id: meta.as_ref().map(|m| m.device_id.clone()),
            name: meta.as_ref().map(|m| m.name.clone()),
            platform: meta.as_ref().map(|m| m.platform.clone()),
            peer_addr: snapshot.peer_addr.to_string(),
            connected_at: snapshot.connected_at_ms,
            idle_ms: snapshot.idle_for.as_millis() as u64,
            capabilities: meta.map(|m| m.capabilities).unwrap_or_default(),
            is_default,
        }
    }
}

/// Bridge health as reported by [`Bridge::get_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub version: String,
    pub listen_addr: String,
    pub uptime_ms: u64,
    pub connections: usize,
    pub pending_requests: usize,
    pub screenshot_cache: CacheStats,
    pub context_cache: CacheStats,
}

/// A running bridge instance.
pub struct Bridge {
    config: BridgeConfig,
    connections: Arc<ConnectionManager>,
    correlator: Arc<Correlator>,
    screenshots: Arc<ResponseCache<ScreenshotPayload>>,
    contexts: Arc<ContextCache>,
    local_addr: SocketAddr,
    started_at: Instant,
}

impl Bridge {
    /// Validates `config`, binds the listener, and starts every background task.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::Config`] for an invalid config and
    /// [`StartError::Network`] if the listen address cannot be bound.
    pub async fn start(config: BridgeConfig) -> Result<Arc<Self>, StartError> {
        config.validate()?;

        let connections = ConnectionManager::new(ConnectionManagerConfig::from(&config));
        let correlator = Correlator::new(connections.clone());
        let screenshots = Arc::new(ResponseCache::from_config(
            "screenshot-cache",
            &config.screenshot_cache,
        ));
        let contexts = Arc::new(ContextCache::new(&config.context_cache));

        let directory: Arc<dyn DeviceDirectory> = connections.clone();
        let forward = Arc::new(ForwardHandler::new(directory.clone(), config.request_timeout));
        correlator.register_handler(MessageType::ScreenshotRequest, forward.clone());
        correlator.register_handler(MessageType::ContextRequest, forward);
        correlator.register_handler(
            MessageType::Command,
            Arc::new(CommandHandler::new(
                directory.clone(),
                contexts.clone(),
                config.request_timeout,
            )),
        );
        correlator.register_handler(
            MessageType::Discovery,
            Arc::new(DiscoveryHandler::new(directory.clone())),
        );
        correlator.register_handler(MessageType::Heartbeat, Arc::new(HeartbeatHandler::new(directory)));

        // Subscribe before listening so no early event is missed.
        correlator.attach(connections.subscribe());
        let local_addr = connections.listen(config.listen_addr).await?;

        screenshots.start_sweeper(config.screenshot_cache.sweep_interval);
        contexts.start_sweeper();

        info!("bridge {SERVER_VERSION} ready on {local_addr}");
        Ok(Arc::new(Self {
            config,
            connections,
            correlator,
            screenshots,
            contexts,
            local_addr,
            started_at: Instant::now(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Returns a frame from the target device, served from cache when fresh.
    ///
    /// # Errors
    ///
    /// [`BridgeError::DeviceUnavailable`] if no device matches, otherwise any
    /// request or device failure.
    pub async fn request_screenshot(
        &self,
        target: Option<&str>,
        options: ScreenshotOptions,
    ) -> Result<ScreenshotPayload, BridgeError> {
        let connection_id = self.connections.resolve_target(target, None)?;
        let key = cache_key(target, &options);
        self.screenshots
            .fetch_or_get(&key, || async {
                let request = ScreenshotRequest {
                    target_id: None,
                    options,
                };
                self.fetch(&connection_id, MessageType::ScreenshotRequest, &request)
                    .await
            })
            .await
    }

    /// Returns a structured UI snapshot, served from cache when fresh.
    ///
    /// # Errors
    ///
    /// Same as [`Bridge::request_screenshot`].
    pub async fn request_context(
        &self,
        target: Option<&str>,
        options: ContextOptions,
    ) -> Result<ContextSnapshot, BridgeError> {
        let connection_id = self.connections.resolve_target(target, None)?;
        let key = cache_key(target, &options);
        self.contexts
            .fetch_or_get(&key, || async {
                let request = ContextRequest {
                    target_id: None,
                    options,
                };
                self.fetch(&connection_id, MessageType::ContextRequest, &request)
                    .await
            })
            .await
    }

    /// Runs a named command on the target device.  Never cached.
    ///
    /// # Errors
    ///
    /// Same as [`Bridge::request_screenshot`].
    pub async fn send_command(
        &self,
        name: &str,
        params: Value,
        target: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let connection_id = self.connections.resolve_target(target, None)?;
        let command = CommandPayload {
            name: name.to_string(),
            params,
            target_id: None,
        };
        let result: CommandResult = self
            .fetch(&connection_id, MessageType::Command, &command)
            .await?;
        Ok(result.result)
    }

    /// All open connections, newest first.  `is_default` marks the one
    /// untargeted requests go to.
    pub fn list_connected_devices(&self) -> Vec<DeviceSummary> {
        let default = self.connections.default_target(None);
        self.connections
            .connections()
            .into_iter()
            .map(|c| {
                let is_default = default.as_deref() == Some(c.id.as_str());
                DeviceSummary::from_snapshot(c, is_default)
            })
            .collect()
    }

    pub fn get_status(&self) -> BridgeStatus {
        BridgeStatus {
            version: SERVER_VERSION.to_string(),
            listen_addr: self.local_addr.to_string(),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            connections: self.connections.connection_count(),
            pending_requests: self.correlator.pending_count(),
            screenshot_cache: self.screenshots.stats(),
            context_cache: self.contexts.stats(),
        }
    }

    /// Stops every background task and closes every connection.
    pub fn shutdown(&self) {
        info!("bridge shutting down");
        self.screenshots.stop_sweeper();
        self.contexts.stop_sweeper();
        self.correlator.shutdown();
        self.connections.shutdown();
    }

    /// Issues one typed request and reads the typed answer.
    async fn fetch<P, R>(&self, connection_id: &str, kind: MessageType, payload: &P) -> Result<R, BridgeError>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let request = Envelope::with_payload(kind, payload)
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        debug!("fetching {kind} from {connection_id} as {}", request.id);
        let reply = self
            .correlator
            .issue(connection_id, request, self.config.request_timeout)
            .await?;
        read_reply(kind, &reply)
    }
}

/// Turns a device reply into the typed payload, or the device's error.
fn read_reply<R: DeserializeOwned>(kind: MessageType, reply: &Envelope) -> Result<R, BridgeError> {
    if reply.kind == MessageType::Error {
        return Err(match &reply.error {
            Some(error) => BridgeError::from_error_payload(error),
            None => BridgeError::Protocol(format!("{} {} carried no error object", reply.kind, reply.id)),
        });
    }
    if Some(reply.kind) != kind.response_type() {
        return Err(BridgeError::Protocol(format!(
            "expected a response to {kind}, got {}",
            reply.kind
        )));
    }
    reply
        .payload()
        .map_err(|e| BridgeError::Protocol(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use devbridge_core::protocol::{ErrorCode, ErrorPayload, ImageFormat};
    use serde_json::json;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn test_read_reply_decodes_typed_payload() {
        let req = Envelope::new(MessageType::ScreenshotRequest, None);
        let reply = Envelope::reply_to(
            &req,
            MessageType::ScreenshotResponse,
            Some(json!({"image": "YWJj", "format": "png", "byteLength": 3, "capturedAt": 1})),
        );

        let payload: ScreenshotPayload = read_reply(MessageType::ScreenshotRequest, &reply).unwrap();

        assert_eq!(payload.image, "YWJj");
        assert_eq!(payload.format, ImageFormat::Png);
    }

    #[test]
    fn test_read_reply_surfaces_device_error_code() {
        let reply = Envelope::error("x", ErrorPayload::new(ErrorCode::PermissionDenied, "denied"));

        let err = read_reply::<ScreenshotPayload>(MessageType::ScreenshotRequest, &reply).unwrap_err();

        assert_eq!(err.code(), "PERMISSION_DENIED");
    }

    #[test]
    fn test_read_reply_rejects_wrong_response_type() {
        let req = Envelope::new(MessageType::ContextRequest, None);
        let reply = Envelope::reply_to(&req, MessageType::ScreenshotResponse, Some(json!({})));

        let err = read_reply::<ContextSnapshot>(MessageType::ContextRequest, &reply).unwrap_err();

        assert!(matches!(err, BridgeError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = BridgeConfig {
            max_connections: 0,
            ..test_config()
        };
        assert!(matches!(Bridge::start(config).await, Err(StartError::Config(_))));
    }

    #[tokio::test]
    async fn test_requests_without_devices_fail_immediately() {
        // Arrange
        let bridge = Bridge::start(test_config()).await.unwrap();

        // Act
        let shot = bridge.request_screenshot(None, ScreenshotOptions::default()).await;
        let ctx = bridge.request_context(Some("pixel"), ContextOptions::default()).await;
        let cmd = bridge.send_command("reload", json!({}), None).await;

        // Assert
        assert!(matches!(shot, Err(BridgeError::DeviceUnavailable { .. })));
        assert!(matches!(ctx, Err(BridgeError::DeviceUnavailable { ref target }) if target == "pixel"));
        assert_eq!(cmd.unwrap_err().code(), "DEVICE_UNAVAILABLE");
        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_status_of_idle_bridge() {
        let bridge = Bridge::start(test_config()).await.unwrap();

        let status = bridge.get_status();

        assert_eq!(status.version, SERVER_VERSION);
        assert_eq!(status.connections, 0);
        assert_eq!(status.pending_requests, 0);
        assert_eq!(status.listen_addr, bridge.local_addr().to_string());
        assert!(bridge.list_connected_devices().is_empty());
        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_two_bridges_run_side_by_side() {
        let a = Bridge::start(test_config()).await.unwrap();
        let b = Bridge::start(test_config()).await.unwrap();

        assert_ne!(a.local_addr(), b.local_addr());
        a.shutdown();
        b.shutdown();
    }
}
