//! Codec trait and implementations for serializing/deserializing envelopes.
//!
//! The endpoints don't care how an [`Envelope`](crate::Envelope) is laid
//! out on the wire; they hold something that implements [`Codec`] and
//! call it at the transport boundary. [`JsonCodec`] is the default and
//! keeps frames readable in browser DevTools and logs.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// Encodes values to frame bytes and decodes them back.
///
/// `Send + Sync + 'static` because one codec instance is shared by every
/// connection task of an endpoint.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value can't be represented
    /// in this format.
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError>;
}

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Behind the `json` feature flag (enabled by default).
///
/// ## Example
///
/// ```rust
/// use tether_protocol::{Codec, Envelope, JsonCodec, UpwardDuty};
///
/// let codec = JsonCodec;
/// let ping = Envelope::new(UpwardDuty::Ping { counter: 3 });
///
/// let bytes = codec.encode(&ping).unwrap();
/// let decoded: Envelope<UpwardDuty> = codec.decode(&bytes).unwrap();
/// assert_eq!(ping, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{DownwardDuty, Envelope, UpwardDuty};

    #[test]
    fn test_decode_garbage_returns_decode_error() {
        let result: Result<Envelope<UpwardDuty>, _> =
            JsonCodec.decode(b"{not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_decode_wrong_direction_returns_decode_error() {
        // A downward duty is not a valid upward duty.
        let bytes = JsonCodec
            .encode(&Envelope::new(DownwardDuty::Pong { counter: 1 }))
            .unwrap();
        let result: Result<Envelope<UpwardDuty>, _> = JsonCodec.decode(&bytes);
        assert!(result.is_err());
    }
}
