//! Unified error type for Tether.

use tether_downend::ConnectorError;
use tether_protocol::ProtocolError;
use tether_session::SessionError;
use tether_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `tether` meta-crate, you deal with this single error
/// type instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant lets `?` convert sub-crate errors.
///
/// Signon failures are not errors: they travel to the Downend as a
/// [`SignonFailureNotice`](tether_protocol::SignonFailureNotice).
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    /// A transport-level error (bind, accept, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, bad handshake).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The session supervisor is gone or refused a transition.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Misuse or failure of a Downend connector.
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}
