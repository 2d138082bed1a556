//! The envelope: the typed, identified message unit exchanged over a connection.
//!
//! Wire format (one WebSocket text frame per envelope):
//! ```text
//! {"type":"SCREENSHOT_REQUEST","id":"…","timestamp":1700000000000,"data":{…}}
//! {"type":"ERROR","id":"…","timestamp":1700000000000,"error":{"code":"TIMEOUT","message":"…"}}
//! ```
//!
//! # Pairing rule
//!
//! A response envelope's `id` MUST equal the `id` of the envelope it answers.
//! Nothing else (type, payload fields, arrival order) is used to pair a
//! response with its request.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::error_code::ErrorCode;

/// Errors that can occur while encoding or decoding an envelope.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The frame is not valid JSON or does not have the envelope shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// The envelope decoded but carries an empty `id`.
    #[error("envelope id must not be empty")]
    MissingId,

    /// A binary frame did not contain UTF-8 text.
    #[error("binary frame is not valid UTF-8")]
    InvalidUtf8,

    /// The envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    /// The `data` field could not be read as the expected payload type.
    #[error("invalid {kind:?} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
}

// ── Message types ─────────────────────────────────────────────────────────────

/// All envelope types understood by the bridge and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    ScreenshotRequest,
    ScreenshotResponse,
    ContextRequest,
    ContextResponse,
    Command,
    CommandResponse,
    Heartbeat,
    Error,
    Welcome,
    Discovery,
    /// Any type string this build does not recognise.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Returns `true` for the types that resolve a pending request.
    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::ScreenshotResponse
                | MessageType::ContextResponse
                | MessageType::CommandResponse
                | MessageType::Error
        )
    }

    /// Returns `true` for the types that expect an answer echoing their id.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::ScreenshotRequest | MessageType::ContextRequest | MessageType::Command
        )
    }

    /// The response type a device answers this request type with, if any.
    pub fn response_type(self) -> Option<MessageType> {
        match self {
            MessageType::ScreenshotRequest => Some(MessageType::ScreenshotResponse),
            MessageType::ContextRequest => Some(MessageType::ContextResponse),
            MessageType::Command => Some(MessageType::CommandResponse),
            MessageType::Discovery => Some(MessageType::Discovery),
            _ => None,
        }
    }

    /// The wire name, e.g. `"SCREENSHOT_REQUEST"`.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ScreenshotRequest => "SCREENSHOT_REQUEST",
            MessageType::ScreenshotResponse => "SCREENSHOT_RESPONSE",
            MessageType::ContextRequest => "CONTEXT_REQUEST",
            MessageType::ContextResponse => "CONTEXT_RESPONSE",
            MessageType::Command => "COMMAND",
            MessageType::CommandResponse => "COMMAND_RESPONSE",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Error => "ERROR",
            MessageType::Welcome => "WELCOME",
            MessageType::Discovery => "DISCOVERY",
            MessageType::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

/// Structured failure carried by an `ERROR` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable, machine-readable code (see [`ErrorCode`]).
    pub code: String,
    /// Human-readable description.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Unique per issuer; echoed verbatim by whoever answers.
    pub id: String,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Envelope {
    /// Creates an envelope with a freshly generated id and the current time.
    pub fn new(kind: MessageType, data: Option<Value>) -> Self {
        Self {
            kind,
            id: new_envelope_id(),
            timestamp: now_millis(),
            data,
            error: None,
        }
    }

    /// Creates the answer to `request`: same id, new type and payload.
    pub fn reply_to(request: &Envelope, kind: MessageType, data: Option<Value>) -> Self {
        Self {
            kind,
            id: request.id.clone(),
            timestamp: now_millis(),
            data,
            error: None,
        }
    }

    /// Creates an `ERROR` envelope carrying `id` (the id of the envelope it answers).
    pub fn error(id: impl Into<String>, error: ErrorPayload) -> Self {
        Self {
            kind: MessageType::Error,
            id: id.into(),
            timestamp: now_millis(),
            data: None,
            error: Some(error),
        }
    }

    /// Serializes `payload` into a new envelope of type `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] if the payload cannot be serialized.
    pub fn with_payload<T: Serialize>(kind: MessageType, payload: &T) -> Result<Self, ProtocolError> {
        let data = serde_json::to_value(payload).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::new(kind, Some(data)))
    }

    /// Reads `data` as a typed payload.
    ///
    /// A missing `data` field is read as JSON `null`, so payload types whose
    /// fields all have defaults still decode.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] if the payload has the wrong shape.
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = self.data.clone().unwrap_or(Value::Null);
        let value = if value.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            value
        };
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind,
            reason: e.to_string(),
        })
    }

    /// Reads `data.targetId` if present.
    pub fn target_id(&self) -> Option<&str> {
        self.data
            .as_ref()
            .and_then(|d| d.get("targetId"))
            .and_then(Value::as_str)
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

/// Encodes an envelope as JSON text.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
///
/// # Examples
///
/// ```rust
/// use devbridge_core::protocol::{decode_envelope, encode_envelope, Envelope, MessageType};
///
/// let env = Envelope::new(MessageType::Heartbeat, None);
/// let text = encode_envelope(&env).unwrap();
/// assert_eq!(decode_envelope(&text).unwrap(), env);
/// ```
pub fn encode_envelope(envelope: &Envelope) -> Result<String, ProtocolError> {
    serde_json::to_string(envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

/// Decodes one envelope from JSON text.
///
/// # Errors
///
/// Returns [`ProtocolError::Malformed`] for anything that is not an envelope
/// and [`ProtocolError::MissingId`] for an envelope with an empty id.
pub fn decode_envelope(text: &str) -> Result<Envelope, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if envelope.id.is_empty() {
        return Err(ProtocolError::MissingId);
    }
    Ok(envelope)
}

/// Decodes an envelope carried in a binary frame (UTF-8 JSON).
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidUtf8`] if the bytes are not UTF-8, otherwise
/// the same errors as [`decode_envelope`].
pub fn decode_envelope_bytes(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    decode_envelope(text)
}

/// Returns a new globally unique envelope id.
pub fn new_envelope_id() -> String {
    Uuid::new_v4().to_string()
}

/// Returns the current time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
