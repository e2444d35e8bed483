//! Connector states and the hooks that observe them.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tether_protocol::{SessionIdentifier, SignonFailureNotice};

/// Lifecycle of a [`DownendConnector`](crate::DownendConnector).
///
/// ```text
/// Stopped → Connecting → Connected → SignedIn → Stopping → Stopped
///               ↑            │           │
///               └────────────┴───────────┘  (connection lost)
/// ```
///
/// `SignedIn` is skipped when the Upend does not require authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorState {
    Stopped,
    Connecting,
    Connected,
    SignedIn,
    Stopping,
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "STOPPED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::SignedIn => "SIGNED_IN",
            Self::Stopping => "STOPPING",
        })
    }
}

/// Finer-grained happenings reported next to state changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// The transport is up and the Upend accepted the handshake.
    TransportConnected { remote_address: Option<SocketAddr> },
    /// The transport dropped (or could not be opened).
    TransportLost { reason: String },
    /// The next attempt starts after `delay`.
    ReconnectScheduled { delay: Duration },
    SignedIn { session_id: SessionIdentifier },
    SignonFailed { notice: SignonFailureNotice },
    /// The Upend removed the session.
    Kicked { reason: String },
    /// The Upend refused the handshake; the connector stops.
    Rejected { reason: String },
}

/// Receives every state transition of one connector.
///
/// Called from the connector task; keep it quick.
pub trait StateWatcher: Send + Sync + 'static {
    fn state_changed(&self, previous: ConnectorState, current: ConnectorState);

    fn event(&self, _event: &ConnectorEvent) {}
}

/// A watcher that ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreStates;

impl StateWatcher for IgnoreStates {
    fn state_changed(&self, _previous: ConnectorState, _current: ConnectorState) {}
}
