//! Stable error codes carried in `ERROR` envelopes and public API failures.
//!
//! Callers match on these strings, so existing codes must never be renamed.

use serde::{Deserialize, Serialize};

/// Every error code the bridge or a device may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The frame could not be decoded as an envelope.
    InvalidMessage,
    /// The envelope type has no registered handler.
    UnknownMessageType,
    /// No matching response arrived before the deadline.
    Timeout,
    /// The connection owning the request went away.
    Disconnected,
    /// The request could not be written to the connection.
    SendFailed,
    /// No connected device matches the requested target.
    DeviceUnavailable,
    /// The device refused to capture (missing OS permission).
    PermissionDenied,
    /// The device cannot perform the request (format, platform).
    Unsupported,
    /// Screen capture failed for another reason.
    CaptureFailed,
    /// A command handler on the device failed.
    CommandFailed,
    /// The bridge is at its connection limit.
    ConnectionLimit,
    /// Anything else; always a bug or an environment fault.
    InternalError,
}

impl ErrorCode {
    /// The wire string, e.g. `"DEVICE_UNAVAILABLE"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Disconnected => "DISCONNECTED",
            ErrorCode::SendFailed => "SEND_FAILED",
            ErrorCode::DeviceUnavailable => "DEVICE_UNAVAILABLE",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::CaptureFailed => "CAPTURE_FAILED",
            ErrorCode::CommandFailed => "COMMAND_FAILED",
            ErrorCode::ConnectionLimit => "CONNECTION_LIMIT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
