//! Error types for the session layer.

use tether_protocol::{SessionIdentifier, SignonFailure};
use tether_transport::ConnectionId;

/// Errors raised by the session book and the supervisor.
///
/// User-facing signon problems travel as
/// [`SignonFailureNotice`](tether_protocol::SignonFailureNotice) instead;
/// [`SessionError::signon_failure`] maps between the two.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session with this identifier is in the book.
    #[error("unknown session {0}")]
    UnknownSession(SessionIdentifier),

    /// The session is already bound to a live (or binding) channel.
    #[error("session {0} is already active")]
    SessionAlreadyActive(SessionIdentifier),

    /// The identifier is already in the book.
    #[error("session {0} already exists")]
    SessionAlreadyExists(SessionIdentifier),

    /// The channel already carries another session.
    #[error("channel {0} already carries a session")]
    ChannelInUse(ConnectionId),

    /// The requested transition does not start from the session's state.
    #[error("session {id} cannot make this transition from {state}")]
    InvalidTransition {
        id: SessionIdentifier,
        state: &'static str,
    },

    /// The supervisor task has stopped.
    #[error("session supervisor is not running")]
    SupervisorUnavailable,
}

impl SessionError {
    /// The signon failure a client should be told about.
    pub fn signon_failure(&self) -> SignonFailure {
        match self {
            Self::UnknownSession(_) => SignonFailure::UnknownSession,
            Self::SessionAlreadyActive(_) | Self::ChannelInUse(_) => {
                SignonFailure::SessionAlreadyActive
            }
            Self::SessionAlreadyExists(_) => SignonFailure::SessionAlreadyExists,
            Self::InvalidTransition { .. } | Self::SupervisorUnavailable => {
                SignonFailure::InternalError
            }
        }
    }
}
