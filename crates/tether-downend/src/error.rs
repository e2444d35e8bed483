//! Error types for the Downend.

use tether_protocol::ProtocolError;
use tether_transport::TransportError;

/// Errors reported by the [`DownendConnector`](crate::DownendConnector).
///
/// Connection trouble after the first attempt never surfaces here: the
/// connector reconnects and reports it through the
/// [`StateWatcher`](crate::StateWatcher) instead.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// The call is not allowed in the connector's current state, e.g. a
    /// second `start()`.
    #[error("invalid connector state: {0}")]
    InvalidState(&'static str),

    /// The first connection attempt could not open the transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The Upend sent something the Downend could not understand.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The Upend refused the handshake.
    #[error("rejected by upend: {0}")]
    Rejected(String),

    /// The user cancelled signon.
    #[error("signon cancelled")]
    Cancelled,

    /// `stop()` ran before the first attempt finished.
    #[error("connector stopped")]
    Stopped,
}
