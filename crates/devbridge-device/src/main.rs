//! DevBridge device agent: entry point.
//!
//! Runs a standalone agent that serves an image file as its screen and a
//! JSON file as its UI snapshot.  Useful for exercising a bridge without a
//! real app.
//!
//! # Usage
//!
//! ```text
//! devbridge-device [OPTIONS]
//!
//! Options:
//!   --config <PATH>              TOML config file
//!   --bridge-url <URL>           Bridge address; discovered when omitted
//!   --device-id <ID>             Stable device id [default: random]
//!   --device-name <NAME>         Display name
//!   --platform <NAME>            Platform label [default: host OS]
//!   --screenshot-file <PATH>     PNG/JPEG served as the screen
//!   --snapshot-file <PATH>       JSON UI snapshot
//!   --discovery-timeout <MS>     Discovery budget [default: 5000]
//! ```
//!
//! Every flag also reads a `DEVBRIDGE_*` environment variable of the same
//! name (`--bridge-url` ↔ `DEVBRIDGE_BRIDGE_URL`).  Flags override the file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use devbridge_device::application::{CommandExecutor, ScreenCapture, UiSnapshotProvider};
use devbridge_device::infrastructure::providers::{
    BuiltinCommands, FileScreenCapture, JsonSnapshotProvider, Unavailable,
};
use devbridge_device::{DeviceAgent, DeviceConfig, RequestDispatcher};
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// DevBridge device agent.
#[derive(Debug, Parser)]
#[command(
    name = "devbridge-device",
    about = "Standalone DevBridge device agent backed by files",
    version
)]
struct Cli {
    #[arg(long, env = "DEVBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// `ws://host:port` or `host:port`; verified first, then discovery.
    #[arg(long, env = "DEVBRIDGE_BRIDGE_URL")]
    bridge_url: Option<String>,

    #[arg(long, env = "DEVBRIDGE_DEVICE_ID")]
    device_id: Option<String>,

    #[arg(long, env = "DEVBRIDGE_DEVICE_NAME")]
    device_name: Option<String>,

    #[arg(long, env = "DEVBRIDGE_PLATFORM")]
    platform: Option<String>,

    /// PNG or JPEG file served as the current screen.
    #[arg(long, env = "DEVBRIDGE_SCREENSHOT_FILE")]
    screenshot_file: Option<PathBuf>,

    /// JSON file holding the UI snapshot.
    #[arg(long, env = "DEVBRIDGE_SNAPSHOT_FILE")]
    snapshot_file: Option<PathBuf>,

    /// Global discovery budget in milliseconds.
    #[arg(long, env = "DEVBRIDGE_DISCOVERY_TIMEOUT")]
    discovery_timeout: Option<u64>,
}

impl Cli {
    /// Builds the effective [`DeviceConfig`] from the file (if any) and flags.
    fn into_device_config(self) -> anyhow::Result<DeviceConfig> {
        let mut config = match &self.config {
            Some(path) => DeviceConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => DeviceConfig::default(),
        };

        if self.bridge_url.is_some() {
            config.bridge_url = self.bridge_url;
        }
        if let Some(id) = self.device_id {
            config.device.device_id = id;
        }
        if let Some(name) = self.device_name {
            config.device.name = name;
        }
        if let Some(platform) = self.platform {
            config.device.platform = platform;
        }
        if self.screenshot_file.is_some() {
            config.screenshot_file = self.screenshot_file;
        }
        if self.snapshot_file.is_some() {
            config.snapshot_file = self.snapshot_file;
        }
        if let Some(ms) = self.discovery_timeout {
            config.discovery.timeout = Duration::from_millis(ms);
        }

        config.validate().context("invalid device configuration")?;
        Ok(config)
    }
}

fn build_dispatcher(config: &DeviceConfig) -> RequestDispatcher {
    let capture: Arc<dyn ScreenCapture> = match &config.screenshot_file {
        Some(path) => Arc::new(FileScreenCapture::new(path.clone())),
        None => Arc::new(Unavailable),
    };
    let snapshots: Arc<dyn UiSnapshotProvider> = match &config.snapshot_file {
        Some(path) => Arc::new(JsonSnapshotProvider::new(path.clone())),
        None => Arc::new(Unavailable),
    };
    let commands: Arc<dyn CommandExecutor> = Arc::new(BuiltinCommands);
    RequestDispatcher::new(capture, snapshots, commands)
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_device_config()?;
    info!(
        "DevBridge device agent starting: bridge={}, discovery budget={:?}",
        config.bridge_url.as_deref().unwrap_or("<discover>"),
        config.discovery.timeout
    );

    let dispatcher = build_dispatcher(&config);
    let agent = DeviceAgent::start(config, dispatcher)
        .await
        .context("failed to start device agent")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("received Ctrl+C, shutting down");

    agent.shutdown();
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_without_flags_yields_default_config() {
        let config = Cli::parse_from(["devbridge-device"]).into_device_config().unwrap();
        assert_eq!(config.bridge_url, None);
        assert_eq!(config.discovery.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_cli_identity_flags() {
        let cli = Cli::parse_from([
            "devbridge-device",
            "--device-id",
            "pixel-7",
            "--device-name",
            "Pixel 7",
            "--platform",
            "android",
        ]);
        let config = cli.into_device_config().unwrap();
        assert_eq!(config.device.device_id, "pixel-7");
        assert_eq!(config.device.name, "Pixel 7");
        assert_eq!(config.device.platform, "android");
    }

    #[test]
    fn test_cli_bridge_url_and_discovery_budget() {
        let cli = Cli::parse_from([
            "devbridge-device",
            "--bridge-url",
            "ws://10.0.2.2:8347",
            "--discovery-timeout",
            "1200",
        ]);
        let config = cli.into_device_config().unwrap();
        assert_eq!(config.bridge_url.as_deref(), Some("ws://10.0.2.2:8347"));
        assert_eq!(config.discovery.timeout, Duration::from_millis(1200));
    }

    #[test]
    fn test_cli_non_numeric_timeout_is_rejected_by_parser() {
        let result = Cli::try_parse_from(["devbridge-device", "--discovery-timeout", "soon"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["devbridge-device", "--config", "/definitely/not/here.toml"]);
        assert!(cli.into_device_config().is_err());
    }
}
