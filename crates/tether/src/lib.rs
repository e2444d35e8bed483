//! # Tether
//!
//! Authenticated client/server sessions that survive reconnects.
//!
//! The **Upend** ([`UpendServer`]) accepts connections, runs the handshake
//! and signon (with optional out-of-band secondary authentication), keeps
//! sessions alive while their Downend is briefly away, and hands each
//! application command to your [`CommandHandler`].
//!
//! The **Downend** ([`DownendConnector`](tether_downend::DownendConnector))
//! dials the Upend, signs on, resumes its session after a drop without
//! prompting, and tracks every command until its outcome arrives.
//!
//! ```text
//! Downend                               Upend
//! DownendConnector ── Transport ──→ handler ─→ SessionSupervisor ─→ SessionAuthority
//!   TrackerCurator  ←─ outcomes ───   │                          ─→ SecondaryAuthenticator
//!                                     └─→ CommandHandler
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether::prelude::*;
//!
//! // Implement SessionAuthority and CommandHandler, then:
//! // let server = UpendServer::builder()
//! //     .bind("0.0.0.0:9000")
//! //     .build(MyAuthority, NoSecondaryAuthentication, MyCommands)
//! //     .await?;
//! // server.run().await
//! ```

mod command;
mod config;
mod error;
mod handler;
mod registry;
mod server;
pub mod telemetry;

pub use command::{CommandHandler, SessionContext};
pub use config::UpendConfig;
pub use error::TetherError;
pub use server::{UpendServer, UpendServerBuilder};

pub use tether_downend as downend;
pub use tether_protocol as protocol;
pub use tether_session as session;
pub use tether_transport as transport;

/// Everything needed to run an Upend or a Downend.
pub mod prelude {
    pub use crate::{
        CommandHandler, SessionContext, TetherError, UpendConfig, UpendServer, UpendServerBuilder,
    };
    pub use tether_downend::{
        CommandInFlightStatus, ConnectorError, ConnectorEvent, ConnectorState, DownendConfig,
        DownendConnector, FixedSignon, IgnoreStates, SignonMaterializer, StateWatcher, Tracker,
        TrackerCurator,
    };
    pub use tether_protocol::{
        CommandOutcome, CommandTag, Credential, SecondaryAuthFailure, SecondaryCode,
        SecondaryToken, SessionIdentifier, SignonFailure, SignonFailureNotice, TimeBoundary,
    };
    pub use tether_session::{
        AuthorityError, NoSecondaryAuthentication, SecondaryAuthenticator, SessionAuthority,
        SessionSupervisor, SupervisorConfig, UserProfile,
    };
    pub use tether_transport::{WebSocketDialer, WebSocketTransport};
}
