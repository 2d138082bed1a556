//! Typed payloads carried in the `data` field of each envelope type.
//!
//! All payloads serialize as camelCase JSON so device SDKs written in any
//! language can read them without a schema compiler.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Protocol constants ────────────────────────────────────────────────────────

/// Current envelope protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Capability names advertised in `WELCOME` and discovery replies.
pub mod capabilities {
    pub const SCREENSHOT: &str = "screenshot";
    pub const CONTEXT: &str = "context";
    pub const COMMAND: &str = "command";
    pub const TELEMETRY: &str = "telemetry";

    /// Everything the bridge supports.
    pub fn all() -> Vec<String> {
        [SCREENSHOT, CONTEXT, COMMAND, TELEMETRY]
            .iter()
            .map(|s| (*s).to_string())
            .collect()
    }
}

/// Names of device-originated `COMMAND`s that carry passive telemetry.
pub mod telemetry {
    pub const ROUTE_CHANGE: &str = "route_change";
    pub const INTERACTION: &str = "interaction";

    pub fn is_telemetry(name: &str) -> bool {
        name == ROUTE_CHANGE || name == INTERACTION
    }
}

// ── Handshake & discovery ─────────────────────────────────────────────────────

/// Sent by the bridge as the first envelope on every accepted connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub connection_id: String,
    pub server_version: String,
    pub protocol_version: u32,
    pub capabilities: Vec<String>,
}

/// Bridge metadata returned to a discovery probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// What a device reports about itself after the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub protocol_version: u32,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// `HEARTBEAT.data`; the first heartbeat after `WELCOME` carries `device`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
}

// ── Screenshot ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
        }
    }
}

/// Capture options; also part of the screenshot cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotOptions {
    /// 1–100; ignored for PNG.
    #[serde(default = "default_quality")]
    pub quality: u8,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

fn default_quality() -> u8 {
    80
}

impl Default for ScreenshotOptions {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            format: ImageFormat::Png,
            width: None,
            height: None,
        }
    }
}

/// `SCREENSHOT_REQUEST.data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(flatten)]
    pub options: ScreenshotOptions,
}

/// `SCREENSHOT_RESPONSE.data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenshotPayload {
    /// Base64 (standard alphabet, padded) encoded image bytes.
    pub image: String,
    pub format: ImageFormat,
    pub byte_length: usize,
    pub captured_at: i64,
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Options for a structured UI snapshot; also part of the context cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextOptions {
    #[serde(default = "default_true")]
    pub include_tree: bool,
    #[serde(default = "default_true")]
    pub include_interactions: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            include_tree: true,
            include_interactions: true,
        }
    }
}

/// `CONTEXT_REQUEST.data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(flatten)]
    pub options: ContextOptions,
}

/// One user interaction observed by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    /// e.g. `"tap"`, `"scroll"`, `"input"`.
    pub kind: String,
    #[serde(default)]
    pub target: String,
    pub timestamp: i64,
}

/// `CONTEXT_RESPONSE.data`: the structured UI snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    #[serde(default)]
    pub route: String,
    #[serde(default)]
    pub route_params: Value,
    #[serde(default)]
    pub component_tree: Value,
    #[serde(default)]
    pub recent_interactions: Vec<Interaction>,
    /// Set when the component tree was compressed by the bridge.
    #[serde(default)]
    pub truncated: bool,
}

/// Data of a `route_change` telemetry command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteChange {
    pub route: String,
    #[serde(default)]
    pub params: Value,
}

// ── Command ───────────────────────────────────────────────────────────────────

/// `COMMAND.data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

/// `COMMAND_RESPONSE.data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    #[serde(default)]
    pub result: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_screenshot_request_flattens_options() {
        // Arrange
        let req = ScreenshotRequest {
            target_id: Some("dev-1".to_string()),
            options: ScreenshotOptions {
                quality: 50,
                format: ImageFormat::Jpeg,
                width: Some(320),
                height: None,
            },
        };

        // Act
        let value = serde_json::to_value(&req).unwrap();

        // Assert
        assert_eq!(
            value,
            json!({"targetId": "dev-1", "quality": 50, "format": "jpeg", "width": 320})
        );
    }

    #[test]
    fn test_screenshot_request_defaults_from_empty_object() {
        let req: ScreenshotRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.options, ScreenshotOptions::default());
        assert_eq!(req.options.quality, 80);
        assert!(req.target_id.is_none());
    }

    #[test]
    fn test_context_options_default_to_everything() {
        let opts: ContextOptions = serde_json::from_value(json!({})).unwrap();
        assert!(opts.include_tree);
        assert!(opts.include_interactions);
    }

    #[test]
    fn test_welcome_payload_uses_camel_case() {
        let welcome = WelcomePayload {
            connection_id: "c1".to_string(),
            server_version: "0.1.0".to_string(),
            protocol_version: PROTOCOL_VERSION,
            capabilities: capabilities::all(),
        };
        let value = serde_json::to_value(&welcome).unwrap();
        assert_eq!(value["connectionId"], "c1");
        assert_eq!(value["serverVersion"], "0.1.0");
        assert_eq!(value["capabilities"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_server_info_tolerates_partial_metadata() {
        let info: ServerInfo = serde_json::from_value(json!({"version": "2.0"})).unwrap();
        assert_eq!(info.version, "2.0");
        assert!(info.capabilities.is_empty());
    }

    #[test]
    fn test_telemetry_names_are_recognised() {
        assert!(telemetry::is_telemetry("route_change"));
        assert!(telemetry::is_telemetry("interaction"));
        assert!(!telemetry::is_telemetry("reload"));
    }
}
