//! Signon sub-protocol, as a pure state machine.
//!
//! The machine consumes downward duties (through
//! [`DownwardDutyReceiver`]) and the user's answers, and emits
//! [`SignonAction`]s for the connector to carry out. It never touches the
//! transport, which keeps every branch unit-testable.
//!
//! ```text
//!  Welcome ─┬─ auth not required ─────────────────────────→ Open
//!           ├─ stored session ──→ Resignon ──SessionValid──→ SignedIn
//!           │                        │ SignonFailed (forget id)
//!           │                        ↓
//!           └─ no session ──────→ Primary ──SessionValid──→ SignedIn
//!                                    │ SecondarySignonNeeded
//!                                    ↓
//!                                Secondary ──SessionValid──→ SignedIn
//! ```

use tether_protocol::{
    CommandOutcome, CommandTag, Credential, DownwardDutyReceiver, HandshakeMetadata,
    HandshakeTerms, PROTOCOL_VERSION, ProtocolError, SecondaryCode, SecondaryToken,
    SessionIdentifier, SignonFailure, SignonFailureNotice, UpwardDuty,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    AwaitingWelcome,
    /// Waiting for the user's credential or the answer to it.
    Primary,
    Secondary { user: String, token: SecondaryToken },
    Resignon,
    SignedIn,
    /// The Upend does not require authentication.
    Open,
}

/// Why the connection must end.
#[derive(Debug)]
pub(crate) enum Disconnect {
    Kicked(String),
    Rejected(String),
    Invalid(ProtocolError),
}

#[derive(Debug)]
pub(crate) enum SignonAction {
    Negotiated(HandshakeTerms),
    Send(UpwardDuty),
    PromptCredential,
    PromptSecondaryCode { user: String, token: SecondaryToken },
    Problem(SignonFailureNotice),
    SignedIn(SessionIdentifier),
    /// Commands may flow without signing in.
    Ready,
    Pong(u64),
    Outcome { tag: CommandTag, outcome: CommandOutcome },
    Disconnect(Disconnect),
}

pub(crate) struct SignonMachine {
    phase: Phase,
    /// Survives reconnections; forgotten on kick or failed resignon.
    session_id: Option<SessionIdentifier>,
    actions: Vec<SignonAction>,
}

impl SignonMachine {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::AwaitingWelcome,
            session_id: None,
            actions: Vec::new(),
        }
    }

    /// A fresh transport is up. Returns the `Hello` to send.
    pub(crate) fn connection_opened(&mut self) -> UpwardDuty {
        self.phase = Phase::AwaitingWelcome;
        self.actions.clear();
        UpwardDuty::Hello {
            version: PROTOCOL_VERSION,
        }
    }

    pub(crate) fn credential_entered(&mut self, credential: Credential) -> UpwardDuty {
        self.phase = Phase::Primary;
        UpwardDuty::PrimarySignon { credential }
    }

    pub(crate) fn code_entered(&mut self, token: SecondaryToken, code: SecondaryCode) -> UpwardDuty {
        UpwardDuty::SecondarySignon { token, code }
    }

    /// Whether commands may be sent now.
    pub(crate) fn is_ready(&self) -> bool {
        matches!(self.phase, Phase::SignedIn | Phase::Open)
    }

    pub(crate) fn session_id(&self) -> Option<&SessionIdentifier> {
        self.session_id.as_ref()
    }

    pub(crate) fn take_actions(&mut self) -> Vec<SignonAction> {
        std::mem::take(&mut self.actions)
    }

    fn push(&mut self, action: SignonAction) {
        self.actions.push(action);
    }
}

impl DownwardDutyReceiver for SignonMachine {
    fn welcome(&mut self, metadata: HandshakeMetadata) {
        if self.phase != Phase::AwaitingWelcome {
            tracing::debug!("ignoring repeated welcome");
            return;
        }
        let terms = match HandshakeTerms::from_metadata(&metadata) {
            Ok(terms) => terms,
            Err(error) => {
                self.push(SignonAction::Disconnect(Disconnect::Invalid(error)));
                return;
            }
        };
        if terms.protocol_version != PROTOCOL_VERSION {
            self.push(SignonAction::Disconnect(Disconnect::Rejected(format!(
                "upend speaks protocol {}, we speak {PROTOCOL_VERSION}",
                terms.protocol_version
            ))));
            return;
        }

        let authentication_required = terms.authentication_required;
        self.push(SignonAction::Negotiated(terms));
        if !authentication_required {
            self.phase = Phase::Open;
            self.push(SignonAction::Ready);
            return;
        }
        match self.session_id.clone() {
            Some(session_id) => {
                self.phase = Phase::Resignon;
                self.push(SignonAction::Send(UpwardDuty::Resignon { session_id }));
            }
            None => {
                self.phase = Phase::Primary;
                self.push(SignonAction::PromptCredential);
            }
        }
    }

    fn rejected(&mut self, reason: String) {
        self.push(SignonAction::Disconnect(Disconnect::Rejected(reason)));
    }

    fn secondary_signon_needed(&mut self, user: String, token: SecondaryToken) {
        if self.phase != Phase::Primary {
            tracing::debug!(phase = ?self.phase, "unexpected secondary signon request");
            return;
        }
        self.phase = Phase::Secondary {
            user: user.clone(),
            token: token.clone(),
        };
        self.push(SignonAction::PromptSecondaryCode { user, token });
    }

    fn session_valid(&mut self, session_id: SessionIdentifier) {
        match self.phase {
            Phase::Primary | Phase::Secondary { .. } | Phase::Resignon => {
                self.session_id = Some(session_id.clone());
                self.phase = Phase::SignedIn;
                self.push(SignonAction::SignedIn(session_id));
            }
            _ => tracing::debug!(phase = ?self.phase, "unexpected session confirmation"),
        }
    }

    fn signon_failed(&mut self, notice: SignonFailureNotice) {
        match std::mem::replace(&mut self.phase, Phase::Primary) {
            Phase::Resignon => {
                // The old session is gone; fall back to a full signon.
                tracing::info!(%notice, "resignon refused, signing on again");
                self.session_id = None;
                self.push(SignonAction::PromptCredential);
            }
            Phase::Secondary { user, token }
                if matches!(
                    notice.failure,
                    SignonFailure::InvalidSecondaryCode | SignonFailure::MissingSecondaryCode
                ) =>
            {
                self.phase = Phase::Secondary {
                    user: user.clone(),
                    token: token.clone(),
                };
                self.push(SignonAction::Problem(notice));
                self.push(SignonAction::PromptSecondaryCode { user, token });
            }
            Phase::Primary | Phase::Secondary { .. } => {
                self.push(SignonAction::Problem(notice));
                self.push(SignonAction::PromptCredential);
            }
            other => {
                tracing::debug!(phase = ?other, %notice, "unexpected signon failure");
                self.phase = other;
            }
        }
    }

    fn pong(&mut self, counter: u64) {
        self.push(SignonAction::Pong(counter));
    }

    fn kicked(&mut self, reason: String) {
        self.session_id = None;
        self.push(SignonAction::Disconnect(Disconnect::Kicked(reason)));
    }

    fn command_outcome(&mut self, tag: Option<CommandTag>, outcome: CommandOutcome) {
        match tag {
            Some(tag) => self.push(SignonAction::Outcome { tag, outcome }),
            None => tracing::debug!("dropping untagged command outcome"),
        }
    }
}
