//! DeviceAgent: the device-side use case that ties discovery, the transport,
//! and the request dispatcher together.
//!
//! ```text
//!  discovery ──url──► Transport ──TransportEvent::Message──► RequestDispatcher
//!                         ▲                                         │
//!                         └──────────────── reply (same id) ◄───────┘
//! ```
//!
//! Each request is answered on its own task, so a slow capture never holds
//! up a context request or a command arriving behind it.

use std::sync::{Arc, Mutex, Weak};

use devbridge_core::protocol::{
    capabilities, now_millis, telemetry, CommandPayload, DeviceInfo, Envelope,
    Interaction, MessageType, RouteChange, PROTOCOL_VERSION,
};
use devbridge_core::task::ScheduledTask;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::dispatcher::RequestDispatcher;
use crate::domain::{ConfigError, DeviceConfig};
use crate::infrastructure::discovery::{Discovery, DiscoveryConfig, Prober, WsProber};
use crate::infrastructure::transport::{
    lock, Transport, TransportConfig, TransportError, TransportEvent, TransportState,
};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("no bridge found within {0:?}")]
    NoBridgeFound(std::time::Duration),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Snapshot of the agent for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentStatus {
    pub bridge_url: String,
    pub state: TransportState,
    pub connection_id: Option<String>,
    pub queued: usize,
    /// Set once the transport exhausted its reconnect attempts.
    pub gave_up: bool,
}

pub struct DeviceAgent {
    device: DeviceInfo,
    bridge_url: String,
    transport: Arc<Transport>,
    dispatcher: Arc<RequestDispatcher>,
    gave_up: Mutex<bool>,
    event_loop: Mutex<Option<ScheduledTask>>,
}

impl DeviceAgent {
    /// Finds the bridge, connects, and starts answering requests.
    ///
    /// # Errors
    ///
    /// [`AgentError::NoBridgeFound`] if discovery comes back empty, or the
    /// transport error if the first connect fails.
    pub async fn start(
        config: DeviceConfig,
        dispatcher: RequestDispatcher,
    ) -> Result<Arc<Self>, AgentError> {
        Self::start_with_prober(config, dispatcher, Arc::new(WsProber)).await
    }

    /// Like [`DeviceAgent::start`] with a caller-supplied discovery prober.
    ///
    /// # Errors
    ///
    /// Same as [`DeviceAgent::start`].
    pub async fn start_with_prober(
        config: DeviceConfig,
        dispatcher: RequestDispatcher,
        prober: Arc<dyn Prober>,
    ) -> Result<Arc<Self>, AgentError> {
        config.validate()?;
        let device = device_info(&config);

        // A configured address is verified first; if it is silent the search
        // continues through the other strategies.
        let discovery = Discovery::new(prober, DiscoveryConfig::from(&config));
        let bridge_url = match discovery.discover().await {
            Some(found) => found.url,
            None => return Err(AgentError::NoBridgeFound(config.discovery.timeout)),
        };

        let (transport, events) =
            Transport::new(TransportConfig::from_device_config(&config, device.clone()));

        let agent = Arc::new(Self {
            device,
            bridge_url,
            transport,
            dispatcher: Arc::new(dispatcher),
            gave_up: Mutex::new(false),
            event_loop: Mutex::new(None),
        });

        // Subscribe before connecting so no request is missed.
        let task = ScheduledTask::spawn("device-agent", run(Arc::downgrade(&agent), events));
        *lock(&agent.event_loop) = Some(task);

        agent.transport.connect(&agent.bridge_url).await?;
        info!(
            "device {} ({}) serving bridge at {}",
            agent.device.device_id, agent.device.name, agent.bridge_url
        );
        Ok(agent)
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            bridge_url: self.bridge_url.clone(),
            state: self.transport.state(),
            connection_id: self.transport.connection_id(),
            queued: self.transport.queued_len(),
            gave_up: *lock(&self.gave_up),
        }
    }

    /// Tells the bridge the app navigated; queued while disconnected.
    pub fn report_route_change(&self, route: &str, params: Value) {
        let change = RouteChange {
            route: route.to_string(),
            params,
        };
        self.report(telemetry::ROUTE_CHANGE, serde_json::to_value(change));
    }

    /// Tells the bridge about a user interaction; queued while disconnected.
    pub fn report_interaction(&self, kind: &str, target: &str) {
        let interaction = Interaction {
            kind: kind.to_string(),
            target: target.to_string(),
            timestamp: now_millis(),
        };
        self.report(telemetry::INTERACTION, serde_json::to_value(interaction));
    }

    fn report(&self, name: &str, params: serde_json::Result<Value>) {
        let params = match params {
            Ok(p) => p,
            Err(e) => {
                warn!("cannot encode {name} telemetry: {e}");
                return;
            }
        };
        let command = CommandPayload {
            name: name.to_string(),
            params,
            target_id: None,
        };
        match Envelope::with_payload(MessageType::Command, &command) {
            Ok(envelope) => {
                if !self.transport.send_or_queue(envelope) {
                    debug!("{name} telemetry queued until reconnect");
                }
            }
            Err(e) => warn!("cannot build {name} telemetry: {e}"),
        }
    }

    /// Disconnects cleanly and stops answering requests.
    pub fn shutdown(&self) {
        self.transport.disconnect();
        if let Some(task) = lock(&self.event_loop).take() {
            task.cancel();
        }
        info!("device agent stopped");
    }

    fn on_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Message(request) => {
                let dispatcher = Arc::clone(&self.dispatcher);
                let transport = Arc::clone(&self.transport);
                tokio::spawn(async move {
                    let Some(reply) = dispatcher.dispatch(&request).await else {
                        return;
                    };
                    if let Err(e) = transport.send(&reply) {
                        warn!("could not answer {} {}: {e}", request.kind, request.id);
                    }
                });
            }
            TransportEvent::Connected { connection_id } => {
                *lock(&self.gave_up) = false;
                info!("bridge session {connection_id} established");
            }
            TransportEvent::Closed { code } => debug!("bridge session closed ({code:?})"),
            TransportEvent::Reconnecting { attempt, delay } => {
                debug!("reconnect {attempt} scheduled in {delay:?}")
            }
            TransportEvent::GaveUp => {
                warn!("bridge unreachable; agent is idle until restarted");
                *lock(&self.gave_up) = true;
            }
        }
    }
}

async fn run(agent: Weak<DeviceAgent>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        match agent.upgrade() {
            Some(agent) => agent.on_event(event),
            None => break,
        }
    }
}

/// Builds what the device announces, generating an id when none is set.
pub fn device_info(config: &DeviceConfig) -> DeviceInfo {
    let device_id = if config.device.device_id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        config.device.device_id.clone()
    };
    DeviceInfo {
        device_id,
        name: config.device.name.clone(),
        platform: config.device.platform.clone(),
        protocol_version: PROTOCOL_VERSION,
        capabilities: capabilities::all(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::infrastructure::providers::mock::{
        MockCommandExecutor, MockScreenCapture, MockSnapshotProvider,
    };

    fn dispatcher() -> RequestDispatcher {
        RequestDispatcher::new(
            Arc::new(MockScreenCapture::default()),
            Arc::new(MockSnapshotProvider::default()),
            Arc::new(MockCommandExecutor::default()),
        )
    }

    #[test]
    fn test_device_info_generates_id_when_unset() {
        let config = DeviceConfig::default();
        let a = device_info(&config);
        let b = device_info(&config);
        assert!(Uuid::parse_str(&a.device_id).is_ok());
        assert_ne!(a.device_id, b.device_id);
        assert_eq!(a.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_device_info_keeps_configured_id() {
        let mut config = DeviceConfig::default();
        config.device.device_id = "pixel-7".into();
        assert_eq!(device_info(&config).device_id, "pixel-7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_reachable_bridge_is_no_bridge_found() {
        // Arrange: every probe is refused.
        let mut prober = crate::infrastructure::discovery::MockProber::new();
        prober.expect_probe().returning(|_, _, _| {
            Err(crate::infrastructure::discovery::ProbeError::Connect(
                "refused".into(),
            ))
        });
        let mut config = DeviceConfig::default();
        config.discovery.timeout = Duration::from_millis(500);

        // Act
        let result = DeviceAgent::start_with_prober(config, dispatcher(), Arc::new(prober)).await;

        // Assert
        assert!(matches!(result, Err(AgentError::NoBridgeFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_discovery() {
        let mut config = DeviceConfig::default();
        config.queue_capacity = 0;

        let result = DeviceAgent::start(config, dispatcher()).await;

        assert!(matches!(result, Err(AgentError::Config(_))));
    }
}
