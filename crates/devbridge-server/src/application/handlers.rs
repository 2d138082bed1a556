//! Default handlers the bridge installs on its correlator.
//!
//! | Type                 | Handler              | Reply                          |
//! |----------------------|----------------------|--------------------------------|
//! | `SCREENSHOT_REQUEST` | [`ForwardHandler`]   | the device's reply, original id |
//! | `CONTEXT_REQUEST`    | [`ForwardHandler`]   | the device's reply, original id |
//! | `COMMAND`            | [`CommandHandler`]   | forwarded, or none for telemetry |
//! | `DISCOVERY`          | [`DiscoveryHandler`] | `ServerInfo`                   |
//! | `HEARTBEAT`          | [`HeartbeatHandler`] | none                           |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbridge_core::protocol::{
    new_envelope_id, now_millis, telemetry, CommandPayload, DeviceInfo, Envelope,
    HeartbeatPayload, Interaction, MessageType, RouteChange, ServerInfo,
};
use tracing::{debug, warn};

use crate::application::context_cache::ContextCache;
use crate::application::correlator::{Correlator, EnvelopeHandler};
use crate::domain::BridgeError;
use crate::infrastructure::events::ConnectionId;

/// Lookup of live devices, used by handlers that need to pick a target.
pub trait DeviceDirectory: Send + Sync {
    /// Picks the connection a request should go to.
    ///
    /// An explicit `target` matches a connection id or a reported device id.
    /// With no target the most recently connected device other than
    /// `exclude` is chosen.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceUnavailable`] if nothing matches.
    fn resolve_target(
        &self,
        target: Option<&str>,
        exclude: Option<&str>,
    ) -> Result<ConnectionId, BridgeError>;

    /// Every name a connection may be addressed by (its id, plus its device
    /// id once reported).
    fn aliases(&self, connection_id: &str) -> Vec<String>;

    fn record_device(&self, connection_id: &str, info: DeviceInfo);

    fn server_info(&self) -> ServerInfo;
}

/// Forwards a request to a device under a fresh id and relays the answer
/// back to the sender under the original id.
pub struct ForwardHandler {
    directory: Arc<dyn DeviceDirectory>,
    timeout: Duration,
}

impl ForwardHandler {
    pub fn new(directory: Arc<dyn DeviceDirectory>, timeout: Duration) -> Self {
        Self { directory, timeout }
    }

    async fn forward(
        &self,
        correlator: &Correlator,
        from: &str,
        envelope: &Envelope,
    ) -> Result<Option<Envelope>, BridgeError> {
        let target = self
            .directory
            .resolve_target(envelope.target_id(), Some(from))?;

        let mut outbound = envelope.clone();
        outbound.id = new_envelope_id();
        outbound.timestamp = now_millis();
        debug!(
            "forwarding {} {} from {from} to {target} as {}",
            envelope.kind, envelope.id, outbound.id
        );

        let mut reply = correlator.issue(&target, outbound, self.timeout).await?;
        reply.id = envelope.id.clone();
        Ok(Some(reply))
    }
}

#[async_trait]
impl EnvelopeHandler for ForwardHandler {
    async fn handle(
        &self,
        correlator: Arc<Correlator>,
        from: ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<Option<Envelope>, BridgeError> {
        self.forward(&correlator, &from, &envelope).await
    }
}

/// `COMMAND` handler: telemetry commands update the snapshot cache, every
/// other command is forwarded like a request.
pub struct CommandHandler {
    forward: ForwardHandler,
    contexts: Arc<ContextCache>,
    directory: Arc<dyn DeviceDirectory>,
}

impl CommandHandler {
    pub fn new(
        directory: Arc<dyn DeviceDirectory>,
        contexts: Arc<ContextCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            forward: ForwardHandler::new(Arc::clone(&directory), timeout),
            contexts,
            directory,
        }
    }

    fn apply_telemetry(&self, from: &str, command: &CommandPayload) -> Result<(), BridgeError> {
        let targets = self.directory.aliases(from);
        let updated = match command.name.as_str() {
            telemetry::ROUTE_CHANGE => {
                let change: RouteChange = serde_json::from_value(command.params.clone())
                    .map_err(|e| BridgeError::Protocol(format!("bad route_change: {e}")))?;
                targets
                    .iter()
                    .map(|t| self.contexts.track_route_change(t, &change))
                    .sum::<usize>()
            }
            _ => {
                let interaction: Interaction = serde_json::from_value(command.params.clone())
                    .map_err(|e| BridgeError::Protocol(format!("bad interaction: {e}")))?;
                targets
                    .iter()
                    .map(|t| self.contexts.track_interaction(t, interaction.clone()))
                    .sum::<usize>()
            }
        };
        debug!("telemetry {} from {from} updated {updated} cached snapshot(s)", command.name);
        Ok(())
    }
}

#[async_trait]
impl EnvelopeHandler for CommandHandler {
    async fn handle(
        &self,
        correlator: Arc<Correlator>,
        from: ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<Option<Envelope>, BridgeError> {
        let command: CommandPayload = envelope
            .payload()
            .map_err(|e| BridgeError::Protocol(e.to_string()))?;

        if telemetry::is_telemetry(&command.name) {
            if let Err(e) = self.apply_telemetry(&from, &command) {
                // Telemetry is fire-and-forget; nobody is waiting for an answer.
                warn!("connection {from}: dropped telemetry: {e}");
            }
            return Ok(None);
        }

        self.forward.forward(&correlator, &from, &envelope).await
    }
}

/// Answers a discovery probe with the bridge's metadata.
pub struct DiscoveryHandler {
    directory: Arc<dyn DeviceDirectory>,
}

impl DiscoveryHandler {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl EnvelopeHandler for DiscoveryHandler {
    async fn handle(
        &self,
        _correlator: Arc<Correlator>,
        _from: ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<Option<Envelope>, BridgeError> {
        let info = serde_json::to_value(self.directory.server_info())
            .map_err(|e| BridgeError::Internal(e.to_string()))?;
        Ok(Some(Envelope::reply_to(&envelope, MessageType::Discovery, Some(info))))
    }
}

/// Records the `DeviceInfo` a device announces in its heartbeat.
pub struct HeartbeatHandler {
    directory: Arc<dyn DeviceDirectory>,
}

impl HeartbeatHandler {
    pub fn new(directory: Arc<dyn DeviceDirectory>) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl EnvelopeHandler for HeartbeatHandler {
    async fn handle(
        &self,
        _correlator: Arc<Correlator>,
        from: ConnectionId,
        envelope: Arc<Envelope>,
    ) -> Result<Option<Envelope>, BridgeError> {
        match envelope.payload::<HeartbeatPayload>() {
            Ok(HeartbeatPayload { device: Some(info) }) => self.directory.record_device(&from, info),
            Ok(_) => {}
            Err(e) => debug!("connection {from}: heartbeat payload ignored: {e}"),
        }
        Ok(None)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use devbridge_core::protocol::{ContextOptions, ContextSnapshot};
    use serde_json::json;

    use crate::application::cache::cache_key;
    use crate::application::correlator::EnvelopeSink;
    use crate::domain::CacheConfig;
    use crate::infrastructure::events::{lock, ConnectionEvent};

    #[derive(Default)]
    struct FakeDirectory {
        devices: Mutex<Vec<(String, Option<DeviceInfo>)>>,
    }

    impl DeviceDirectory for FakeDirectory {
        fn resolve_target(
            &self,
            target: Option<&str>,
            exclude: Option<&str>,
        ) -> Result<ConnectionId, BridgeError> {
            let devices = lock(&self.devices);
            devices
                .iter()
                .rev()
                .find(|(id, info)| match target {
                    Some(t) => id == t || info.as_ref().is_some_and(|i| i.device_id == t),
                    None => Some(id.as_str()) != exclude,
                })
                .map(|(id, _)| id.clone())
                .ok_or_else(|| BridgeError::DeviceUnavailable {
                    target: target.unwrap_or("default").to_string(),
                })
        }

        fn aliases(&self, connection_id: &str) -> Vec<String> {
            vec![connection_id.to_string()]
        }

        fn record_device(&self, connection_id: &str, info: DeviceInfo) {
            let mut devices = lock(&self.devices);
            if let Some(entry) = devices.iter_mut().find(|(id, _)| id == connection_id) {
                entry.1 = Some(info);
            }
        }

        fn server_info(&self) -> ServerInfo {
            ServerInfo {
                host: "127.0.0.1".to_string(),
                port: 8347,
                version: "test".to_string(),
                capabilities: vec!["screenshot".to_string()],
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, Envelope)>>,
    }

    impl EnvelopeSink for RecordingSink {
        fn send_to(&self, connection_id: &str, envelope: &Envelope) -> bool {
            lock(&self.sent).push((connection_id.to_string(), envelope.clone()));
            true
        }
    }

    fn directory_with(ids: &[&str]) -> Arc<FakeDirectory> {
        let dir = FakeDirectory::default();
        *lock(&dir.devices) = ids.iter().map(|id| (id.to_string(), None)).collect();
        Arc::new(dir)
    }

    #[tokio::test]
    async fn test_forward_rewrites_reply_to_original_id() {
        // Arrange
        let sink = Arc::new(RecordingSink::default());
        let correlator = Correlator::new(sink.clone());
        let handler = Arc::new(ForwardHandler::new(
            directory_with(&["device"]),
            Duration::from_secs(5),
        ));
        let mut req = Envelope::new(MessageType::ScreenshotRequest, Some(json!({})));
        req.id = "orig".to_string();

        // Act: run the handler, then answer the forwarded request as the device.
        let c = Arc::clone(&correlator);
        let task = tokio::spawn(async move {
            handler.handle(c, "agent".to_string(), Arc::new(req)).await
        });
        tokio::task::yield_now().await;
        let forwarded = lock(&sink.sent)[0].clone();
        assert_eq!(forwarded.0, "device");
        assert_ne!(forwarded.1.id, "orig");
        let answer = Envelope::reply_to(&forwarded.1, MessageType::ScreenshotResponse, Some(json!("abc")));
        correlator.handle_event(ConnectionEvent::Message {
            connection_id: "device".to_string(),
            envelope: Arc::new(answer),
        });

        // Assert
        let reply = task.await.unwrap().unwrap().unwrap();
        assert_eq!(reply.id, "orig");
        assert_eq!(reply.data, Some(json!("abc")));
    }

    #[tokio::test]
    async fn test_forward_without_devices_is_device_unavailable() {
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        let handler = ForwardHandler::new(directory_with(&["agent"]), Duration::from_secs(1));
        let req = Arc::new(Envelope::new(MessageType::ContextRequest, None));

        // The only connection is the sender itself.
        let outcome = handler.handle(correlator, "agent".to_string(), req).await;

        assert!(matches!(outcome, Err(BridgeError::DeviceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_discovery_reply_echoes_probe_id_and_carries_server_info() {
        let correlator = Correlator::new(Arc::new(RecordingSink::default()));
        let handler = DiscoveryHandler::new(directory_with(&[]));
        let probe = Arc::new(Envelope::new(MessageType::Discovery, None));

        let reply = handler
            .handle(correlator, "probe".to_string(), Arc::clone(&probe))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.id, probe.id);
        let info: ServerInfo = reply.payload().unwrap();
        assert_eq!(info.port, 8347);
    }

    #[tokio::test]
    async fn test_heartbeat_records_device_info_without_reply() {
        // Arrange
        let dir = directory_with(&["conn-1"]);
        let handler = HeartbeatHandler::new(dir.clone());
        let payload = HeartbeatPayload {
            device: Some(DeviceInfo {
                device_id: "emu-5554".to_string(),
                ..DeviceInfo::default()
            }),
        };
        let hb = Envelope::with_payload(MessageType::Heartbeat, &payload).unwrap();

        // Act
        let reply = handler
            .handle(
                Correlator::new(Arc::new(RecordingSink::default())),
                "conn-1".to_string(),
                Arc::new(hb),
            )
            .await
            .unwrap();

        // Assert
        assert!(reply.is_none());
        assert_eq!(dir.resolve_target(Some("emu-5554"), None).unwrap(), "conn-1");
    }

    #[tokio::test]
    async fn test_route_change_telemetry_updates_cached_snapshot() {
        // Arrange
        let contexts = Arc::new(ContextCache::new(&CacheConfig::context_default()));
        let key = cache_key(Some("conn-1"), &ContextOptions::default());
        contexts
            .fetch_or_get(&key, || async { Ok(ContextSnapshot::default()) })
            .await
            .unwrap();
        let sink = Arc::new(RecordingSink::default());
        let handler = CommandHandler::new(directory_with(&["conn-1"]), contexts.clone(), Duration::from_secs(1));
        let command = CommandPayload {
            name: telemetry::ROUTE_CHANGE.to_string(),
            params: json!({"route": "/settings", "params": {"tab": "privacy"}}),
            target_id: None,
        };
        let env = Envelope::with_payload(MessageType::Command, &command).unwrap();

        // Act
        let reply = handler
            .handle(Correlator::new(sink.clone()), "conn-1".to_string(), Arc::new(env))
            .await
            .unwrap();

        // Assert: no reply, nothing forwarded, cache updated in place.
        assert!(reply.is_none());
        assert!(lock(&sink.sent).is_empty());
        let snapshot = contexts.get(&key).unwrap();
        assert_eq!(snapshot.route, "/settings");
        assert_eq!(snapshot.route_params, json!({"tab": "privacy"}));
    }

    #[tokio::test]
    async fn test_malformed_telemetry_is_dropped_quietly() {
        let contexts = Arc::new(ContextCache::new(&CacheConfig::context_default()));
        let handler = CommandHandler::new(directory_with(&["c"]), contexts, Duration::from_secs(1));
        let command = CommandPayload {
            name: telemetry::INTERACTION.to_string(),
            params: json!("not an object"),
            target_id: None,
        };
        let env = Envelope::with_payload(MessageType::Command, &command).unwrap();

        let reply = handler
            .handle(
                Correlator::new(Arc::new(RecordingSink::default())),
                "c".to_string(),
                Arc::new(env),
            )
            .await;

        assert!(matches!(reply, Ok(None)));
    }
}
