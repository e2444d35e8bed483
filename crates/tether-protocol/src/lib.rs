//! Wire protocol for Tether.
//!
//! This crate defines what the Downend (client) and the Upend (server)
//! say to each other:
//!
//! - **Identity types** ([`SessionIdentifier`], [`SecondaryToken`],
//!   [`CommandTag`], ...) shared by both endpoints.
//! - **Duties** ([`UpwardDuty`], [`DownwardDuty`]): one explicit variant
//!   per request, carried in an [`Envelope`] that may hold a correlation
//!   tag.
//! - **Handshake** ([`HandshakeMetadata`], [`HandshakeTerms`],
//!   [`TimeBoundary`]): the key/value block the Upend sends once per
//!   connection.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how envelopes become
//!   bytes.
//! - **Pipeline** ([`Pipeline`]): ordered pure stages that may forward,
//!   answer or drop a message before it reaches the endpoint logic.
//!
//! ```text
//! Transport (frames) → Codec (Envelope) → Pipeline → Session / Connector
//! ```

mod codec;
mod duty;
mod error;
mod handshake;
mod identity;
pub mod pipeline;

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use duty::{
    CommandOutcome, DownwardDuty, DownwardDutyReceiver, Envelope, UpwardDuty,
};
pub use error::ProtocolError;
pub use handshake::{
    keys, HandshakeMetadata, HandshakeTerms, MetadataValue, TimeBoundary,
};
pub use identity::{
    CommandTag, Credential, SecondaryAuthFailure, SecondaryCode,
    SecondaryToken, SessionIdentifier, SignonFailure, SignonFailureNotice,
};
pub use pipeline::{Direction, Pipeline, Verdict};

/// The current protocol version. A Downend must announce it in its
/// `Hello` or the Upend rejects the connection.
pub const PROTOCOL_VERSION: u32 = 1;
