//! Protocol module containing the envelope codec, payload types, and error codes.

pub mod envelope;
pub mod error_code;
pub mod messages;

pub use envelope::{
    decode_envelope, decode_envelope_bytes, encode_envelope, new_envelope_id, now_millis,
    Envelope, ErrorPayload, MessageType, ProtocolError,
};
pub use error_code::ErrorCode;
pub use messages::*;
