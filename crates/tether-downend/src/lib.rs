//! The Downend: the client endpoint of Tether.
//!
//! A [`DownendConnector`] dials the Upend through any
//! [`Dialer`](tether_transport::Dialer), runs the handshake and the signon
//! sub-protocol, and keeps the connection alive:
//!
//! - **Signon** asks a [`SignonMaterializer`] for the credential and, when
//!   the Upend wants one, a secondary code. After a reconnect the stored
//!   session is resumed with `Resignon` and nobody is prompted.
//! - **Keepalive** sends `Ping` on the negotiated interval; a missing
//!   `Pong` counts as a dead connection.
//! - **Reconnection** waits a random delay within the negotiated range
//!   before dialing again.
//! - **Command tracking** hands every command a [`CommandTag`] and a
//!   [`Tracker`] kept by the [`TrackerCurator`] until its outcome (or a
//!   timeout) arrives.
//!
//! Every state change is reported to a [`StateWatcher`].
//!
//! [`CommandTag`]: tether_protocol::CommandTag

mod config;
mod connector;
mod error;
mod materializer;
mod signon;
mod tracker;
mod watcher;

pub use config::DownendConfig;
pub use connector::DownendConnector;
pub use error::ConnectorError;
pub use materializer::{FixedSignon, SignonMaterializer};
pub use tracker::{CommandInFlightStatus, Tracker, TrackerCurator, TrackerHandle};
pub use watcher::{ConnectorEvent, ConnectorState, IgnoreStates, StateWatcher};
