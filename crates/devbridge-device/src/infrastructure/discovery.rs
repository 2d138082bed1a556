//! Discovery: finds a reachable bridge without operator input.
//!
//! Strategies run in a fixed order under one global time budget:
//!
//! 1. **Explicit**: the configured address, probed directly.  If it answers,
//!    nothing else runs.
//! 2. **Default ports**: the bridge's default port on loopback hosts
//!    (including the Android emulator host aliases).
//! 3. **Dev ports**: common development ports on the same hosts.
//! 4. **Subnet sweep**: a small fixed set of hosts on common private subnets,
//!    default ports only.
//!
//! Within a strategy every candidate is probed concurrently and the first
//! success wins; the rest are dropped (and so cancelled).  The remaining
//! budget is recomputed before each strategy, and a strategy is never
//! started once the budget is spent.  Each probe is bounded by
//! `min(probe_timeout, remaining budget)`, so discovery that finds nothing
//! returns within roughly the budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use devbridge_core::protocol::{
    decode_envelope, encode_envelope, Envelope, MessageType, ServerInfo, WelcomePayload,
};
use futures_util::stream::FuturesUnordered;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::domain::{DeviceConfig, DEFAULT_BRIDGE_PORT};

/// Why a single probe did not find a bridge.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("probe timed out")]
    Timeout,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("invalid bridge address '{0}'")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Explicit,
    DefaultPorts,
    DevPorts,
    SubnetSweep,
}

/// A `host:port` pair to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
}

impl Candidate {
    fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("ws://[{}]:{}", self.host, self.port)
        } else {
            format!("ws://{}:{}", self.host, self.port)
        }
    }
}

/// The bridge discovery settled on.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredBridge {
    pub url: String,
    pub candidate: Candidate,
    pub info: ServerInfo,
    pub strategy: Strategy,
    pub probe_latency: Duration,
}

/// Checks whether a bridge answers at one address.
///
/// A probe succeeds once the WebSocket opens; `metadata_wait` bounds how long
/// it then waits for server metadata before settling for defaults.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(
        &self,
        host: &str,
        port: u16,
        metadata_wait: Duration,
    ) -> Result<ServerInfo, ProbeError>;
}

/// Probes over a real WebSocket: opens it, sends `DISCOVERY`, and takes
/// metadata from the reply or, failing that, from `WELCOME`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsProber;

#[async_trait]
impl Prober for WsProber {
    async fn probe(
        &self,
        host: &str,
        port: u16,
        metadata_wait: Duration,
    ) -> Result<ServerInfo, ProbeError> {
        let url = Candidate::new(host, port).url();
        let (mut ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ProbeError::Connect(e.to_string()))?;

        let mut info = ServerInfo {
            host: host.to_string(),
            port,
            version: String::new(),
            capabilities: Vec::new(),
        };

        let probe = Envelope::new(MessageType::Discovery, None);
        if let Ok(text) = encode_envelope(&probe) {
            let _ = ws.send(WsMessage::Text(text)).await;
        }

        let read_metadata = async {
            while let Some(Ok(msg)) = ws.next().await {
                let text = match msg {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let Ok(envelope) = decode_envelope(&text) else {
                    continue;
                };
                match envelope.kind {
                    MessageType::Welcome => {
                        if let Ok(welcome) = envelope.payload::<WelcomePayload>() {
                            info.version = welcome.server_version;
                            info.capabilities = welcome.capabilities;
                        }
                    }
                    MessageType::Discovery if envelope.id == probe.id => {
                        if let Ok(reply) = envelope.payload::<ServerInfo>() {
                            if !reply.version.is_empty() {
                                info.version = reply.version;
                            }
                            if !reply.capabilities.is_empty() {
                                info.capabilities = reply.capabilities;
                            }
                        }
                        break;
                    }
                    _ => {}
                }
            }
        };
        if tokio::time::timeout(metadata_wait, read_metadata).await.is_err() {
            debug!("{host}:{port} sent no discovery reply; assuming defaults");
        }

        let _ = ws.close(None).await;
        Ok(info)
    }
}

/// Where and how long to search.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub explicit: Option<String>,
    pub timeout: Duration,
    pub probe_timeout: Duration,
    pub metadata_wait: Duration,
    pub default_ports: Vec<u16>,
    pub dev_ports: Vec<u16>,
    pub loopback_hosts: Vec<String>,
    pub subnets: Vec<String>,
    pub subnet_hosts: Vec<u8>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::from(&DeviceConfig::default())
    }
}

impl From<&DeviceConfig> for DiscoveryConfig {
    fn from(config: &DeviceConfig) -> Self {
        let d = &config.discovery;
        Self {
            explicit: config.bridge_url.clone(),
            timeout: d.timeout,
            probe_timeout: d.probe_timeout,
            metadata_wait: d.metadata_wait,
            default_ports: d.default_ports.clone(),
            dev_ports: d.dev_ports.clone(),
            loopback_hosts: d.loopback_hosts.clone(),
            subnets: d.subnets.clone(),
            subnet_hosts: d.subnet_hosts.clone(),
        }
    }
}

/// Parses `ws://host:port[/path]`, `host:port`, or a bare host (default port).
///
/// # Errors
///
/// [`DiscoveryError::InvalidAddress`] for an empty host or a bad port.
pub fn parse_address(address: &str) -> Result<Candidate, DiscoveryError> {
    let invalid = || DiscoveryError::InvalidAddress(address.to_string());
    let rest = address
        .trim()
        .trim_start_matches("wss://")
        .trim_start_matches("ws://");
    let authority = rest.split('/').next().unwrap_or_default();

    let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => return Err(invalid()),
        }
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_BRIDGE_PORT,
    };
    Ok(Candidate::new(host, port))
}

pub struct Discovery {
    prober: Arc<dyn Prober>,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(prober: Arc<dyn Prober>, config: DiscoveryConfig) -> Self {
        Self { prober, config }
    }

    /// The candidates of each strategy, in the order they are tried.
    pub fn plan(&self) -> Vec<(Strategy, Vec<Candidate>)> {
        let c = &self.config;
        let mut plan = Vec::with_capacity(4);

        if let Some(address) = &c.explicit {
            match parse_address(address) {
                Ok(candidate) => plan.push((Strategy::Explicit, vec![candidate])),
                Err(e) => warn!("skipping configured bridge address: {e}"),
            }
        }

        let on_loopback = |ports: &[u16]| -> Vec<Candidate> {
            c.loopback_hosts
                .iter()
                .flat_map(|host| ports.iter().map(move |&port| Candidate::new(host.clone(), port)))
                .collect()
        };
        plan.push((Strategy::DefaultPorts, on_loopback(&c.default_ports)));

        let dev_ports: Vec<u16> = c
            .dev_ports
            .iter()
            .copied()
            .filter(|p| !c.default_ports.contains(p))
            .collect();
        plan.push((Strategy::DevPorts, on_loopback(&dev_ports)));

        let sweep: Vec<Candidate> = c
            .subnets
            .iter()
            .flat_map(|subnet| {
                c.subnet_hosts.iter().flat_map(move |octet| {
                    c.default_ports
                        .iter()
                        .map(move |&port| Candidate::new(format!("{subnet}.{octet}"), port))
                })
            })
            .collect();
        plan.push((Strategy::SubnetSweep, sweep));

        plan
    }

    /// Runs the strategies in order and returns the first bridge that
    /// answers, or `None` once every strategy failed or the budget ran out.
    pub async fn discover(&self) -> Option<DiscoveredBridge> {
        let started = Instant::now();
        for (strategy, candidates) in self.plan() {
            let remaining = self
                .config
                .timeout
                .checked_sub(started.elapsed())
                .filter(|r| !r.is_zero());
            let Some(remaining) = remaining else {
                info!("discovery budget of {:?} spent; giving up", self.config.timeout);
                return None;
            };
            if candidates.is_empty() {
                continue;
            }

            debug!("discovery: {strategy:?} with {} candidates", candidates.len());
            if let Some(found) = self.race(strategy, candidates, remaining).await {
                info!("discovered bridge at {} via {strategy:?}", found.url);
                return Some(found);
            }
            if strategy == Strategy::Explicit {
                warn!("configured bridge address did not answer; searching");
            }
        }
        info!("no bridge found after {:?}", started.elapsed());
        None
    }

    /// Probes every candidate at once; the first success wins.
    async fn race(
        &self,
        strategy: Strategy,
        candidates: Vec<Candidate>,
        remaining: Duration,
    ) -> Option<DiscoveredBridge> {
        let per_probe = self.config.probe_timeout.min(remaining);
        // An open socket must still report success before its candidate times out.
        let metadata_wait = self.config.metadata_wait.min(per_probe / 2);

        let mut probes: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|candidate| {
                let prober = Arc::clone(&self.prober);
                async move {
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(
                        per_probe,
                        prober.probe(&candidate.host, candidate.port, metadata_wait),
                    )
                    .await
                    .unwrap_or(Err(ProbeError::Timeout));
                    (candidate, outcome, started.elapsed())
                }
            })
            .collect();

        while let Some((candidate, outcome, latency)) = probes.next().await {
            match outcome {
                Ok(info) => {
                    return Some(DiscoveredBridge {
                        url: candidate.url(),
                        candidate,
                        info,
                        strategy,
                        probe_latency: latency,
                    })
                }
                Err(e) => debug!("probe {}:{} failed: {e}", candidate.host, candidate.port),
            }
        }
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
