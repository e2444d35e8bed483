//! Error types for the protocol layer.
//!
//! A `ProtocolError` means the bytes or the key/value block we were
//! handed could not be understood. It never describes a signon outcome;
//! those travel as [`SignonFailureNotice`](crate::SignonFailureNotice)
//! data.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a Rust type into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed: malformed JSON, missing fields, wrong
    /// types or a truncated frame.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message decoded but violates a protocol rule, e.g. a
    /// handshake key is missing or a command tag is malformed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
