//! DevBridge bridge: entry point.
//!
//! Listens for device agents over WebSocket and serves screenshot, context,
//! and command requests to them.
//!
//! # Usage
//!
//! ```text
//! devbridge [OPTIONS]
//!
//! Options:
//!   --config <PATH>               TOML config file
//!   --host <IP>                   Listen address [default: 0.0.0.0]
//!   --port <PORT>                 Listen port [default: 8347]
//!   --heartbeat-interval <SECS>   Ping interval [default: 15]
//!   --max-connections <N>         Connection limit [default: 32]
//!   --request-timeout <SECS>      Device request deadline [default: 30]
//!   --max-payload-mb <MB>         Largest accepted message [default: 64]
//! ```
//!
//! # Configuration precedence
//!
//! Built-in defaults, then the TOML file, then CLI flags / environment
//! variables.  A flag that is not given leaves the file's value alone.
//!
//! | Variable                       | Flag                   |
//! |--------------------------------|------------------------|
//! | `DEVBRIDGE_CONFIG`             | `--config`             |
//! | `DEVBRIDGE_HOST`               | `--host`               |
//! | `DEVBRIDGE_PORT`               | `--port`               |
//! | `DEVBRIDGE_HEARTBEAT_INTERVAL` | `--heartbeat-interval` |
//! | `DEVBRIDGE_MAX_CONNECTIONS`    | `--max-connections`    |
//! | `DEVBRIDGE_REQUEST_TIMEOUT`    | `--request-timeout`    |
//! | `DEVBRIDGE_MAX_PAYLOAD_MB`     | `--max-payload-mb`     |

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use devbridge_server::{Bridge, BridgeConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// DevBridge bridge server.
#[derive(Debug, Parser)]
#[command(
    name = "devbridge",
    about = "Bridge between tool-calling agents and running mobile apps",
    version
)]
struct Cli {
    /// Optional TOML config file; CLI flags override its values.
    #[arg(long, env = "DEVBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to listen on.
    #[arg(long, env = "DEVBRIDGE_HOST")]
    host: Option<IpAddr>,

    /// TCP port to listen on.
    #[arg(long, env = "DEVBRIDGE_PORT")]
    port: Option<u16>,

    /// Seconds between transport pings; silent connections are dropped after two.
    #[arg(long, env = "DEVBRIDGE_HEARTBEAT_INTERVAL")]
    heartbeat_interval: Option<u64>,

    #[arg(long, env = "DEVBRIDGE_MAX_CONNECTIONS")]
    max_connections: Option<usize>,

    /// Seconds to wait for a device to answer a request.
    #[arg(long, env = "DEVBRIDGE_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Largest accepted WebSocket message, in MiB.
    #[arg(long, env = "DEVBRIDGE_MAX_PAYLOAD_MB")]
    max_payload_mb: Option<usize>,
}

impl Cli {
    /// Builds the effective [`BridgeConfig`] from the file (if any) and flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// the combined values fail validation.
    fn into_bridge_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(host) = self.host {
            config.listen_addr = SocketAddr::new(host, config.listen_addr.port());
        }
        if let Some(port) = self.port {
            config.listen_addr.set_port(port);
        }
        if let Some(secs) = self.heartbeat_interval {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(n) = self.max_connections {
            config.max_connections = n;
        }
        if let Some(secs) = self.request_timeout {
            config.request_timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = self.max_payload_mb {
            config.max_payload_bytes = mb * 1024 * 1024;
        }

        config.validate().context("invalid bridge configuration")?;
        Ok(config)
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_bridge_config()?;
    info!(
        "DevBridge starting: listen={}, heartbeat={:?}, max_connections={}",
        config.listen_addr, config.heartbeat_interval, config.max_connections
    );

    let bridge = Bridge::start(config)
        .await
        .context("failed to start bridge")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("received Ctrl+C, shutting down");

    bridge.shutdown();
    info!("DevBridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
