//! Duties: the requests each endpoint asks the other to perform.
//!
//! Every duty is one explicit enum variant carrying its arguments as
//! named fields. `#[serde(tag = "type")]` produces internally tagged JSON:
//!
//! ```text
//! { "tag": "dn-4", "duty": { "type": "Command", "payload": [1, 2] } }
//! ```
//!
//! Upward duties flow Downend → Upend, downward duties the other way.

use serde::{Deserialize, Serialize};

use crate::{
    CommandTag, Credential, HandshakeMetadata, SecondaryCode, SecondaryToken,
    SessionIdentifier, SignonFailureNotice,
};

/// Final result of one application command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandOutcome {
    Succeeded { payload: Vec<u8> },
    Failed { message: String },
}

impl CommandOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Downend → Upend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpwardDuty {
    /// First frame on every connection.
    Hello { version: u32 },
    PrimarySignon { credential: Credential },
    SecondarySignon {
        token: SecondaryToken,
        code: SecondaryCode,
    },
    /// Resume a session after a reconnect, without credentials.
    Resignon { session_id: SessionIdentifier },
    Signout,
    Ping { counter: u64 },
    /// Application command; the envelope tag correlates the outcome.
    Command { payload: Vec<u8> },
}

/// Upend → Downend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DownwardDuty {
    Welcome { metadata: HandshakeMetadata },
    /// The handshake was refused; the Upend closes right after.
    Rejected { reason: String },
    SecondarySignonNeeded {
        user: String,
        token: SecondaryToken,
    },
    SessionValid { session_id: SessionIdentifier },
    SignonFailed { notice: SignonFailureNotice },
    Pong { counter: u64 },
    /// The session was removed by the Upend; the channel closes next.
    Kicked { reason: String },
    CommandOutcome { outcome: CommandOutcome },
}

/// The top-level wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<D> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<CommandTag>,
    pub duty: D,
}

impl<D> Envelope<D> {
    /// An untagged envelope.
    pub fn new(duty: D) -> Self {
        Self { tag: None, duty }
    }

    pub fn tagged(tag: CommandTag, duty: D) -> Self {
        Self {
            tag: Some(tag),
            duty,
        }
    }
}

/// Receives downward duties, one method per variant.
///
/// [`Envelope::call_receiver`] is the dispatch; implementors never match
/// on [`DownwardDuty`] themselves.
pub trait DownwardDutyReceiver {
    fn welcome(&mut self, metadata: HandshakeMetadata);
    fn rejected(&mut self, reason: String);
    fn secondary_signon_needed(&mut self, user: String, token: SecondaryToken);
    fn session_valid(&mut self, session_id: SessionIdentifier);
    fn signon_failed(&mut self, notice: SignonFailureNotice);
    fn pong(&mut self, counter: u64);
    fn kicked(&mut self, reason: String);
    fn command_outcome(&mut self, tag: Option<CommandTag>, outcome: CommandOutcome);
}

impl Envelope<DownwardDuty> {
    /// Hands this envelope's duty to the matching receiver method.
    pub fn call_receiver<R: DownwardDutyReceiver + ?Sized>(self, receiver: &mut R) {
        match self.duty {
            DownwardDuty::Welcome { metadata } => receiver.welcome(metadata),
            DownwardDuty::Rejected { reason } => receiver.rejected(reason),
            DownwardDuty::SecondarySignonNeeded { user, token } => {
                receiver.secondary_signon_needed(user, token)
            }
            DownwardDuty::SessionValid { session_id } => {
                receiver.session_valid(session_id)
            }
            DownwardDuty::SignonFailed { notice } => receiver.signon_failed(notice),
            DownwardDuty::Pong { counter } => receiver.pong(counter),
            DownwardDuty::Kicked { reason } => receiver.kicked(reason),
            DownwardDuty::CommandOutcome { outcome } => {
                receiver.command_outcome(self.tag, outcome)
            }
        }
    }
}
