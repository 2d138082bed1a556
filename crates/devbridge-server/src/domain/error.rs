//! Error taxonomy for everything that crosses the bridge's public API.
//!
//! Every variant maps to a stable [`ErrorCode`] string plus a human-readable
//! message, so callers (and the outward agent adapter) never see an
//! unlabeled failure.  A cache miss is not an error and has no variant here.

use devbridge_core::protocol::{ErrorCode, ErrorPayload};
use thiserror::Error;

/// Why an issued request ended without a matching response.
///
/// The correlator never retries; retry is the caller's policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// No matching response arrived before the deadline.
    #[error("request {id} timed out after {timeout_ms}ms")]
    Timeout { id: String, timeout_ms: u64 },

    /// The owning connection closed while the request was pending.
    #[error("connection {connection_id} closed while request {id} was pending")]
    Disconnected { id: String, connection_id: String },

    /// The request could not be written to the connection.
    #[error("failed to send request {id} to connection {connection_id}")]
    SendFailed { id: String, connection_id: String },
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::Timeout { .. } => ErrorCode::Timeout,
            RequestError::Disconnected { .. } => ErrorCode::Disconnected,
            RequestError::SendFailed { .. } => ErrorCode::SendFailed,
        }
    }
}

/// Failure returned by the bridge's public operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BridgeError {
    #[error(transparent)]
    Request(#[from] RequestError),

    /// No open connection matches the requested target.
    #[error("no connected device matches target '{target}'")]
    DeviceUnavailable { target: String },

    /// The device answered with an `ERROR` envelope.
    #[error("device error {code}: {message}")]
    Device { code: String, message: String },

    /// The device answered with a payload of the wrong shape.
    #[error("malformed response from device: {0}")]
    Protocol(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// The stable code string reported to callers.
    pub fn code(&self) -> &str {
        match self {
            BridgeError::Request(e) => e.code().as_str(),
            BridgeError::DeviceUnavailable { .. } => ErrorCode::DeviceUnavailable.as_str(),
            BridgeError::Device { code, .. } => code,
            BridgeError::Protocol(_) => ErrorCode::InvalidMessage.as_str(),
            BridgeError::Internal(_) => ErrorCode::InternalError.as_str(),
        }
    }

    /// Converts the failure into the error object of an `ERROR` envelope.
    pub fn to_error_payload(&self) -> ErrorPayload {
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            details: None,
        }
    }

    /// Reads the device's error object back into a `BridgeError`.
    pub fn from_error_payload(payload: &ErrorPayload) -> Self {
        BridgeError::Device {
            code: payload.code.clone(),
            message: payload.message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_errors_map_to_stable_codes() {
        let timeout = BridgeError::from(RequestError::Timeout {
            id: "r1".to_string(),
            timeout_ms: 100,
        });
        let gone = BridgeError::from(RequestError::Disconnected {
            id: "r1".to_string(),
            connection_id: "c1".to_string(),
        });
        let send = BridgeError::from(RequestError::SendFailed {
            id: "r1".to_string(),
            connection_id: "c1".to_string(),
        });
        assert_eq!(timeout.code(), "TIMEOUT");
        assert_eq!(gone.code(), "DISCONNECTED");
        assert_eq!(send.code(), "SEND_FAILED");
    }

    #[test]
    fn test_device_unavailable_code_and_message() {
        let err = BridgeError::DeviceUnavailable {
            target: "pixel".to_string(),
        };
        let payload = err.to_error_payload();
        assert_eq!(payload.code, "DEVICE_UNAVAILABLE");
        assert!(payload.message.contains("pixel"));
    }

    #[test]
    fn test_device_error_keeps_device_code() {
        let payload = ErrorPayload::new(ErrorCode::PermissionDenied, "no permission");
        let err = BridgeError::from_error_payload(&payload);
        assert_eq!(err.code(), "PERMISSION_DENIED");
        assert_eq!(err.to_error_payload().code, "PERMISSION_DENIED");
    }
}
