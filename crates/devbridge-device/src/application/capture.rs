//! Native collaborator traits: where frames, snapshots, and command results
//! come from.
//!
//! The agent never rasterizes or walks a widget tree itself.  A host app
//! plugs in implementations of these traits; the infrastructure layer ships
//! file-backed ones for the standalone binary and recording mocks for tests.

use async_trait::async_trait;
use devbridge_core::protocol::{ContextOptions, ContextSnapshot, ErrorCode, ScreenshotOptions};
use serde_json::Value;
use thiserror::Error;

/// Why a capture or snapshot could not be produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CaptureError {
    /// The OS or the user has not granted capture permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// This platform or provider cannot produce the requested output.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("capture failed: {0}")]
    Failed(String),
}

impl CaptureError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CaptureError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            CaptureError::Unsupported(_) => ErrorCode::Unsupported,
            CaptureError::Failed(_) => ErrorCode::CaptureFailed,
        }
    }
}

/// Why a command could not be run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("command '{name}' failed: {reason}")]
    Failed { name: String, reason: String },
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CommandError::Unknown(_) => ErrorCode::Unsupported,
            CommandError::Failed { .. } => ErrorCode::CommandFailed,
        }
    }
}

/// Produces encoded image bytes of the current screen.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self, options: &ScreenshotOptions) -> Result<Vec<u8>, CaptureError>;
}

/// Produces a structured snapshot of the current UI.
#[async_trait]
pub trait UiSnapshotProvider: Send + Sync {
    async fn snapshot(&self, options: &ContextOptions) -> Result<ContextSnapshot, CaptureError>;
}

/// Runs an app-defined named command.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, name: &str, params: &Value) -> Result<Value, CommandError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_errors_map_to_stable_codes() {
        assert_eq!(
            CaptureError::PermissionDenied("x".into()).code().as_str(),
            "PERMISSION_DENIED"
        );
        assert_eq!(CaptureError::Unsupported("x".into()).code().as_str(), "UNSUPPORTED");
        assert_eq!(CaptureError::Failed("x".into()).code().as_str(), "CAPTURE_FAILED");
    }

    #[test]
    fn test_command_errors_map_to_stable_codes() {
        assert_eq!(CommandError::Unknown("warp".into()).code().as_str(), "UNSUPPORTED");
        let failed = CommandError::Failed {
            name: "reload".into(),
            reason: "busy".into(),
        };
        assert_eq!(failed.code().as_str(), "COMMAND_FAILED");
        assert!(failed.to_string().contains("reload"));
    }
}
