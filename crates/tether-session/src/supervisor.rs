//! The session supervisor: one task that owns the session book.
//!
//! Connection handlers never touch the book. They send a command through
//! a [`SessionSupervisor`] handle and await the oneshot reply:
//!
//! ```text
//!  conn task ──PrimarySignon──→ ┌────────────┐ ──spawn──→ authority.check_credential
//!  conn task ──Resignon───────→ │ supervisor │ ←─────────  Continuation::CredentialChecked
//!  conn task ──Closed─────────→ │   actor    │ ──spawn──→ authority.register_session
//!  sweeper tick ──────────────→ └────────────┘ ←─────────  Continuation::Registered
//! ```
//!
//! Calls to the authority and the secondary provider can be slow, so they
//! run on spawned tasks; their results come back as continuations on a
//! second channel and every state change still happens on the actor
//! task, one message at a time.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tether_protocol::{
    Credential, SecondaryAuthFailure, SecondaryCode, SecondaryToken, SessionIdentifier,
    SignonFailure, SignonFailureNotice,
};
use tether_transport::ConnectionId;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::auth::{AuthorityError, ChannelCloser, SecondaryAuthenticator, SessionAuthority, UserProfile};
use crate::book::{ChannelBinding, Session, SessionBook, SessionState};
use crate::counter::{FailedSignonCounter, SignonAttempt};
use crate::taboo::{self, TabooGenerator};
use crate::{SessionError, SupervisorConfig};

/// Result of a primary signon that passed the credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimarySignonOutcome {
    /// The user has a phone number; a code is on its way.
    NeedSecondarySignon { user: String, token: SecondaryToken },
    /// No secondary step needed; the session is active.
    SessionAttributed(SessionIdentifier),
}

type Reply<T> = oneshot::Sender<Result<T, SignonFailureNotice>>;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

enum SupervisorCommand {
    PrimarySignon {
        credential: Credential,
        binding: ChannelBinding,
        reply: Reply<PrimarySignonOutcome>,
    },
    SecondarySignon {
        token: SecondaryToken,
        code: SecondaryCode,
        binding: ChannelBinding,
        reply: Reply<SessionIdentifier>,
    },
    Reuse {
        id: SessionIdentifier,
        binding: ChannelBinding,
        reply: Reply<()>,
    },
    Closed {
        channel: ConnectionId,
    },
    Signout {
        id: SessionIdentifier,
        reply: oneshot::Sender<bool>,
    },
    Kickout {
        id: SessionIdentifier,
        reason: String,
        reply: oneshot::Sender<bool>,
    },
    KickoutAll {
        reason: String,
        reply: oneshot::Sender<usize>,
    },
    RecordSignonFailure {
        login: String,
        attempt: SignonAttempt,
        reply: oneshot::Sender<FailedSignonCounter>,
    },
    SignonFailures {
        login: String,
        reply: oneshot::Sender<FailedSignonCounter>,
    },
    ChallengeLogin {
        token: SecondaryToken,
        reply: oneshot::Sender<Option<String>>,
    },
    ResetSignonFailures {
        login: String,
    },
    GetSession {
        id: SessionIdentifier,
        reply: oneshot::Sender<Option<Session>>,
    },
    SessionCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Results of spawned collaborator calls, fed back into the actor.
enum Continuation {
    CredentialChecked {
        login: String,
        binding: ChannelBinding,
        result: Result<UserProfile, SignonFailure>,
        reply: Reply<PrimarySignonOutcome>,
    },
    ChallengeIssued {
        login: String,
        result: Result<SecondaryToken, SecondaryAuthFailure>,
        reply: Reply<PrimarySignonOutcome>,
    },
    CodeVerified {
        token: SecondaryToken,
        login: String,
        binding: ChannelBinding,
        result: Result<bool, SecondaryAuthFailure>,
        reply: Reply<SessionIdentifier>,
    },
    Registered {
        id: SessionIdentifier,
        login: String,
        channel: ConnectionId,
        result: Result<(), AuthorityError>,
        reply: AttributionReply,
    },
}

/// Whoever waits for a session to become active.
enum AttributionReply {
    Primary(Reply<PrimarySignonOutcome>),
    Secondary(Reply<SessionIdentifier>),
    Reuse(Reply<()>),
}

impl AttributionReply {
    fn is_reuse(&self) -> bool {
        matches!(self, Self::Reuse(_))
    }

    /// Whether the requesting connection stopped waiting.
    fn is_closed(&self) -> bool {
        match self {
            Self::Primary(reply) => reply.is_closed(),
            Self::Secondary(reply) => reply.is_closed(),
            Self::Reuse(reply) => reply.is_closed(),
        }
    }

    /// Returns false when nobody was left to hear it.
    fn succeed(self, id: SessionIdentifier) -> bool {
        match self {
            Self::Primary(reply) => reply
                .send(Ok(PrimarySignonOutcome::SessionAttributed(id)))
                .is_ok(),
            Self::Secondary(reply) => reply.send(Ok(id)).is_ok(),
            Self::Reuse(reply) => reply.send(Ok(())).is_ok(),
        }
    }

    fn fail(self, notice: SignonFailureNotice) {
        match self {
            Self::Primary(reply) => {
                let _ = reply.send(Err(notice));
            }
            Self::Secondary(reply) => {
                let _ = reply.send(Err(notice));
            }
            Self::Reuse(reply) => {
                let _ = reply.send(Err(notice));
            }
        }
    }
}

struct Challenge {
    login: String,
    deadline: Instant,
}

/// Failure counts for one login and when the latest one happened.
struct FailureRecord {
    counter: FailedSignonCounter,
    last_failure: Instant,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable handle to the supervisor task.
///
/// Signon methods report problems as [`SignonFailureNotice`] ready to be
/// sent to the client; a stopped supervisor shows up as
/// [`SignonFailure::InternalError`] there and as
/// [`SessionError::SupervisorUnavailable`] everywhere else.
#[derive(Clone)]
pub struct SessionSupervisor {
    sender: mpsc::Sender<SupervisorCommand>,
}

impl SessionSupervisor {
    /// Spawns the supervisor task on the current Tokio runtime.
    ///
    /// The task stops once every handle is dropped or after
    /// [`shutdown`](Self::shutdown).
    pub fn spawn<A, S>(
        config: SupervisorConfig,
        authority: A,
        secondary: S,
        closer: Arc<dyn ChannelCloser>,
    ) -> Self
    where
        A: SessionAuthority,
        S: SecondaryAuthenticator,
    {
        let config = config.validated();
        let (sender, receiver) = mpsc::channel(config.command_buffer);
        let (continuations, continuation_receiver) = mpsc::unbounded_channel();

        let actor = SupervisorActor {
            taboo: taboo::session_identifiers(config.taboo_ring_size),
            config,
            book: SessionBook::new(),
            counters: HashMap::new(),
            challenges: HashMap::new(),
            closed_while_binding: HashSet::new(),
            forgotten_while_registering: HashSet::new(),
            authority: Arc::new(authority),
            secondary: Arc::new(secondary),
            closer,
            receiver,
            continuations,
            continuation_receiver,
        };
        tokio::spawn(actor.run());

        Self { sender }
    }

    /// Checks a credential; creates a session directly when the user has
    /// no phone number, otherwise starts a secondary challenge.
    pub async fn attempt_primary_signon(
        &self,
        credential: Credential,
        binding: ChannelBinding,
    ) -> Result<PrimarySignonOutcome, SignonFailureNotice> {
        self.signon_request(|reply| SupervisorCommand::PrimarySignon {
            credential,
            binding,
            reply,
        })
        .await
    }

    /// Answers a secondary challenge; on success the new session is active.
    pub async fn attempt_secondary_signon(
        &self,
        token: SecondaryToken,
        code: SecondaryCode,
        binding: ChannelBinding,
    ) -> Result<SessionIdentifier, SignonFailureNotice> {
        self.signon_request(|reply| SupervisorCommand::SecondarySignon {
            token,
            code,
            binding,
            reply,
        })
        .await
    }

    /// Rebinds an orphaned session to a new channel.
    pub async fn try_reuse(
        &self,
        id: SessionIdentifier,
        binding: ChannelBinding,
    ) -> Result<(), SignonFailureNotice> {
        self.signon_request(|reply| SupervisorCommand::Reuse { id, binding, reply })
            .await
    }

    /// Reports that a channel closed. Its active session becomes orphaned.
    pub async fn closed(&self, channel: ConnectionId) -> Result<(), SessionError> {
        self.sender
            .send(SupervisorCommand::Closed { channel })
            .await
            .map_err(|_| SessionError::SupervisorUnavailable)
    }

    /// Ends a session at the client's request. Returns whether it existed.
    pub async fn signout(&self, id: SessionIdentifier) -> Result<bool, SessionError> {
        self.request(|reply| SupervisorCommand::Signout { id, reply })
            .await
    }

    /// Removes a session and closes its channel. Returns whether it existed.
    pub async fn kickout(
        &self,
        id: SessionIdentifier,
        reason: impl Into<String>,
    ) -> Result<bool, SessionError> {
        let reason = reason.into();
        self.request(|reply| SupervisorCommand::Kickout { id, reason, reply })
            .await
    }

    /// Kicks out every session. Returns how many there were.
    pub async fn kickout_all(&self, reason: impl Into<String>) -> Result<usize, SessionError> {
        let reason = reason.into();
        self.request(|reply| SupervisorCommand::KickoutAll { reason, reply })
            .await
    }

    /// Counts one failed attempt for `login` and returns the new counts.
    pub async fn record_signon_failure(
        &self,
        login: impl Into<String>,
        attempt: SignonAttempt,
    ) -> Result<FailedSignonCounter, SessionError> {
        let login = login.into();
        self.request(|reply| SupervisorCommand::RecordSignonFailure {
            login,
            attempt,
            reply,
        })
        .await
    }

    pub async fn signon_failures(
        &self,
        login: impl Into<String>,
    ) -> Result<FailedSignonCounter, SessionError> {
        let login = login.into();
        self.request(|reply| SupervisorCommand::SignonFailures { login, reply })
            .await
    }

    /// The login a live secondary challenge was issued for.
    pub async fn challenge_login(
        &self,
        token: SecondaryToken,
    ) -> Result<Option<String>, SessionError> {
        self.request(|reply| SupervisorCommand::ChallengeLogin { token, reply })
            .await
    }

    /// Unlocks `login`.
    pub async fn reset_signon_failures(
        &self,
        login: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.sender
            .send(SupervisorCommand::ResetSignonFailures {
                login: login.into(),
            })
            .await
            .map_err(|_| SessionError::SupervisorUnavailable)
    }

    /// A snapshot of one session.
    pub async fn session(&self, id: SessionIdentifier) -> Result<Option<Session>, SessionError> {
        self.request(|reply| SupervisorCommand::GetSession { id, reply })
            .await
    }

    pub async fn session_count(&self) -> Result<usize, SessionError> {
        self.request(|reply| SupervisorCommand::SessionCount { reply })
            .await
    }

    /// Stops the supervisor task. Pending replies are dropped.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.sender
            .send(SupervisorCommand::Shutdown)
            .await
            .map_err(|_| SessionError::SupervisorUnavailable)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SupervisorCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(command(reply))
            .await
            .map_err(|_| SessionError::SupervisorUnavailable)?;
        response.await.map_err(|_| SessionError::SupervisorUnavailable)
    }

    async fn signon_request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> SupervisorCommand,
    ) -> Result<T, SignonFailureNotice> {
        match self.request(command).await {
            Ok(result) => result,
            Err(error) => Err(SignonFailureNotice::new(
                SignonFailure::InternalError,
                error.to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct SupervisorActor<A, S> {
    config: SupervisorConfig,
    book: SessionBook,
    /// Dropped once `failed_signon_window` passes without a new failure.
    counters: HashMap<String, FailureRecord>,
    challenges: HashMap<SecondaryToken, Challenge>,
    /// Channels that closed while their session was still binding.
    closed_while_binding: HashSet<ConnectionId>,
    /// Sessions signed out or kicked out before their registration came
    /// back. The authority signout waits for the registration.
    forgotten_while_registering: HashSet<SessionIdentifier>,
    taboo: TabooGenerator<SessionIdentifier>,
    authority: Arc<A>,
    secondary: Arc<S>,
    closer: Arc<dyn ChannelCloser>,
    receiver: mpsc::Receiver<SupervisorCommand>,
    continuations: mpsc::UnboundedSender<Continuation>,
    continuation_receiver: mpsc::UnboundedReceiver<Continuation>,
}

impl<A, S> SupervisorActor<A, S>
where
    A: SessionAuthority,
    S: SecondaryAuthenticator,
{
    async fn run(mut self) {
        tracing::info!(
            maximum_inactivity = ?self.config.maximum_inactivity,
            "session supervisor started"
        );
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(SupervisorCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(continuation) = self.continuation_receiver.recv() => {
                    self.handle_continuation(continuation);
                }
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        tracing::info!(sessions = self.book.len(), "session supervisor stopped");
    }

    fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::PrimarySignon {
                credential,
                binding,
                reply,
            } => self.primary_signon(credential, binding, reply),
            SupervisorCommand::SecondarySignon {
                token,
                code,
                binding,
                reply,
            } => self.secondary_signon(token, code, binding, reply),
            SupervisorCommand::Reuse { id, binding, reply } => match self.book.reuse(&id, binding) {
                Ok(login) => {
                    tracing::debug!(%id, channel = %binding.channel, "session reuse started");
                    self.register(id, login, binding.channel, AttributionReply::Reuse(reply));
                }
                Err(error) => {
                    tracing::debug!(%id, %error, "session reuse refused");
                    let _ = reply.send(Err(notice_for(&error)));
                }
            },
            SupervisorCommand::Closed { channel } => self.channel_closed(channel),
            SupervisorCommand::Signout { id, reply } => {
                let existed = self.forget(&id).is_some();
                if existed {
                    tracing::info!(%id, "session signed out");
                }
                let _ = reply.send(existed);
            }
            SupervisorCommand::Kickout { id, reason, reply } => {
                let _ = reply.send(self.kickout(&id, &reason));
            }
            SupervisorCommand::KickoutAll { reason, reply } => {
                let kicked = self
                    .book
                    .ids()
                    .iter()
                    .filter(|id| self.kickout(id, &reason))
                    .count();
                self.challenges.clear();
                tracing::info!(kicked, %reason, "all sessions kicked out");
                let _ = reply.send(kicked);
            }
            SupervisorCommand::RecordSignonFailure {
                login,
                attempt,
                reply,
            } => {
                let _ = reply.send(self.record_failure(login, attempt));
            }
            SupervisorCommand::SignonFailures { login, reply } => {
                let _ = reply.send(self.counter(&login));
            }
            SupervisorCommand::ChallengeLogin { token, reply } => {
                let now = Instant::now();
                let login = self
                    .challenges
                    .get(&token)
                    .filter(|challenge| challenge.deadline > now)
                    .map(|challenge| challenge.login.clone());
                let _ = reply.send(login);
            }
            SupervisorCommand::ResetSignonFailures { login } => {
                self.counters.remove(&login);
                self.reset_authority_failures(login);
            }
            SupervisorCommand::GetSession { id, reply } => {
                let _ = reply.send(self.book.get(&id).cloned());
            }
            SupervisorCommand::SessionCount { reply } => {
                let _ = reply.send(self.book.len());
            }
            SupervisorCommand::Shutdown => {}
        }
    }

    fn handle_continuation(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::CredentialChecked {
                login,
                binding,
                result,
                reply,
            } => self.credential_checked(login, binding, result, reply),
            Continuation::ChallengeIssued {
                login,
                result,
                reply,
            } => match result {
                Ok(token) => {
                    let deadline = Instant::now() + self.config.secondary_token_validity;
                    self.challenges.insert(
                        token.clone(),
                        Challenge {
                            login: login.clone(),
                            deadline,
                        },
                    );
                    tracing::debug!(%login, "secondary challenge issued");
                    let _ = reply.send(Ok(PrimarySignonOutcome::NeedSecondarySignon {
                        user: login,
                        token,
                    }));
                }
                Err(cause) => {
                    tracing::warn!(%login, %cause, "secondary authentication request failed");
                    let _ = reply.send(Err(SignonFailure::SecondaryAuthentication(cause).into()));
                }
            },
            Continuation::CodeVerified {
                token,
                login,
                binding,
                result,
                reply,
            } => self.code_verified(token, login, binding, result, reply),
            Continuation::Registered {
                id,
                login,
                channel,
                result,
                reply,
            } => self.registered(id, login, channel, result, reply),
        }
    }

    // -- primary ------------------------------------------------------------

    fn primary_signon(
        &mut self,
        credential: Credential,
        binding: ChannelBinding,
        reply: Reply<PrimarySignonOutcome>,
    ) {
        if self.counter(&credential.login).has_reached_limit() {
            tracing::warn!(login = %credential.login, "signon refused for locked login");
            let _ = reply.send(Err(SignonFailure::Locked.into()));
            return;
        }

        let authority = Arc::clone(&self.authority);
        let continuations = self.continuations.clone();
        tokio::spawn(async move {
            let result = authority.check_credential(&credential).await;
            let _ = continuations.send(Continuation::CredentialChecked {
                login: credential.login,
                binding,
                result,
                reply,
            });
        });
    }

    fn credential_checked(
        &mut self,
        login: String,
        binding: ChannelBinding,
        result: Result<UserProfile, SignonFailure>,
        reply: Reply<PrimarySignonOutcome>,
    ) {
        let profile = match result {
            Ok(profile) => profile,
            Err(failure) => {
                tracing::debug!(%login, ?failure, "credential check failed");
                let _ = reply.send(Err(failure.into()));
                return;
            }
        };

        match profile.phone_number {
            None => self.attribute(profile.login, binding, AttributionReply::Primary(reply)),
            Some(phone_number) => {
                let secondary = Arc::clone(&self.secondary);
                let continuations = self.continuations.clone();
                let login = profile.login;
                tokio::spawn(async move {
                    let result = secondary.request_authentication(&phone_number).await;
                    let _ = continuations.send(Continuation::ChallengeIssued {
                        login,
                        result,
                        reply,
                    });
                });
            }
        }
    }

    // -- secondary ----------------------------------------------------------

    fn secondary_signon(
        &mut self,
        token: SecondaryToken,
        code: SecondaryCode,
        binding: ChannelBinding,
        reply: Reply<SessionIdentifier>,
    ) {
        let now = Instant::now();
        let login = match self.challenges.get(&token) {
            Some(challenge) if challenge.deadline > now => challenge.login.clone(),
            Some(_) => {
                self.challenges.remove(&token);
                tracing::debug!("secondary token expired");
                let _ = reply.send(Err(SignonFailure::UnknownSecondaryToken.into()));
                return;
            }
            None => {
                let _ = reply.send(Err(SignonFailure::UnknownSecondaryToken.into()));
                return;
            }
        };
        if self.counter(&login).has_reached_limit() {
            self.challenges.remove(&token);
            tracing::warn!(%login, "secondary signon refused for locked login");
            let _ = reply.send(Err(SignonFailure::Locked.into()));
            return;
        }
        if code.is_blank() {
            let _ = reply.send(Err(SignonFailure::MissingSecondaryCode.into()));
            return;
        }

        let secondary = Arc::clone(&self.secondary);
        let continuations = self.continuations.clone();
        tokio::spawn(async move {
            let result = secondary.verify_secondary_code(&token, &code).await;
            let _ = continuations.send(Continuation::CodeVerified {
                token,
                login,
                binding,
                result,
                reply,
            });
        });
    }

    fn code_verified(
        &mut self,
        token: SecondaryToken,
        login: String,
        binding: ChannelBinding,
        result: Result<bool, SecondaryAuthFailure>,
        reply: Reply<SessionIdentifier>,
    ) {
        match result {
            Ok(true) => {
                // Gone means kicked out or swept while the provider answered.
                if self.challenges.remove(&token).is_none() {
                    let _ = reply.send(Err(SignonFailure::UnknownSecondaryToken.into()));
                    return;
                }
                // Wrong guesses from other connections may have locked the
                // login while this code was being checked.
                if self.counter(&login).has_reached_limit() {
                    tracing::warn!(%login, "secondary signon refused for locked login");
                    let _ = reply.send(Err(SignonFailure::Locked.into()));
                    return;
                }
                self.attribute(login, binding, AttributionReply::Secondary(reply));
            }
            Ok(false) => {
                tracing::debug!(%login, "secondary code rejected");
                let _ = reply.send(Err(SignonFailure::InvalidSecondaryCode.into()));
            }
            Err(cause) => {
                self.challenges.remove(&token);
                tracing::warn!(%login, %cause, "secondary code verification failed");
                let _ = reply.send(Err(SignonFailure::SecondaryAuthentication(cause).into()));
            }
        }
    }

    // -- attribution --------------------------------------------------------

    /// Creates a `Pending` session and starts its registration.
    fn attribute(&mut self, login: String, binding: ChannelBinding, reply: AttributionReply) {
        if reply.is_closed() {
            tracing::debug!(
                %login,
                channel = %binding.channel,
                "requester gone, no session created"
            );
            return;
        }
        let id = self.taboo.generate();
        if let Err(error) = self.book.create(id.clone(), login.clone(), binding, Instant::now()) {
            tracing::warn!(%login, %error, "session creation failed");
            reply.fail(notice_for(&error));
            return;
        }
        tracing::debug!(%id, %login, channel = %binding.channel, "session pending");
        self.register(id, login, binding.channel, reply);
    }

    fn register(
        &mut self,
        id: SessionIdentifier,
        login: String,
        channel: ConnectionId,
        reply: AttributionReply,
    ) {
        let authority = Arc::clone(&self.authority);
        let continuations = self.continuations.clone();
        tokio::spawn(async move {
            let result = authority.register_session(&id, &login).await;
            let _ = continuations.send(Continuation::Registered {
                id,
                login,
                channel,
                result,
                reply,
            });
        });
    }

    fn registered(
        &mut self,
        id: SessionIdentifier,
        login: String,
        channel: ConnectionId,
        result: Result<(), AuthorityError>,
        reply: AttributionReply,
    ) {
        let closed_meanwhile = self.closed_while_binding.remove(&channel);

        if self.forgotten_while_registering.remove(&id) {
            // The authority holds the session unless a fresh registration
            // failed outright.
            let held = reply.is_reuse()
                || matches!(result, Ok(()) | Err(AuthorityError::AlreadyRegistered(_)));
            tracing::info!(%id, "session removed during registration");
            if held {
                self.spawn_signout(id);
            }
            reply.fail(SignonFailure::UnknownSession.into());
            return;
        }

        if let Err(error) = result {
            if !matches!(error, AuthorityError::AlreadyRegistered(_)) {
                tracing::warn!(%id, %error, "session registration failed");
                if reply.is_reuse() {
                    self.book.revert_reuse(&id, Instant::now());
                } else {
                    self.book.remove(&id);
                }
                reply.fail(SignonFailureNotice::new(
                    SignonFailure::InternalError,
                    "session registration failed",
                ));
                return;
            }
        }

        if let Err(error) = self.book.activate(&id, channel) {
            tracing::warn!(%id, %error, "session could not be activated");
            self.spawn_signout(id);
            reply.fail(notice_for(&error));
            return;
        }

        tracing::info!(%id, %login, %channel, "session active");
        if !reply.is_reuse() {
            self.counters.remove(&login);
            self.reset_authority_failures(login);
        }
        // An undelivered reply means the connection went away before it
        // learned the session, possibly before its closed notice could
        // find the session.
        let delivered = reply.succeed(id);
        if closed_meanwhile || !delivered {
            self.channel_closed(channel);
        }
    }

    // -- teardown -----------------------------------------------------------

    fn channel_closed(&mut self, channel: ConnectionId) {
        if let Some(id) = self.book.remove_channel(channel, Instant::now()) {
            tracing::info!(%id, %channel, "session orphaned");
        } else if self.book.by_channel(channel).is_some() {
            self.closed_while_binding.insert(channel);
        }
    }

    /// Removes a session, closes its channel and signs it out.
    fn kickout(&mut self, id: &SessionIdentifier, reason: &str) -> bool {
        let Some(session) = self.forget(id) else {
            return false;
        };
        if let Some(channel) = session.state.channel() {
            self.closer.close(channel, reason);
        }
        tracing::info!(%id, %reason, "session kicked out");
        true
    }

    /// Removes a session from the book and signs it out at the authority.
    ///
    /// A session still registering is signed out once its registration
    /// comes back, see [`registered`](Self::registered).
    fn forget(&mut self, id: &SessionIdentifier) -> Option<Session> {
        let session = self.book.remove(id)?;
        if let Some(channel) = session.state.channel() {
            self.closed_while_binding.remove(&channel);
        }
        match session.state {
            SessionState::Pending { .. } | SessionState::Reusing { .. } => {
                self.forgotten_while_registering.insert(id.clone());
            }
            SessionState::Active { .. } | SessionState::Orphaned { .. } => {
                self.spawn_signout(id.clone());
            }
        }
        Some(session)
    }

    fn sweep(&mut self, now: Instant) {
        for session in self.book.sweep(now, self.config.maximum_inactivity) {
            tracing::info!(id = %session.id, user = %session.user, "orphaned session expired");
            self.spawn_signout(session.id);
        }
        self.challenges.retain(|_, challenge| challenge.deadline > now);

        let window = self.config.failed_signon_window;
        self.counters.retain(|login, record| {
            let live = now.saturating_duration_since(record.last_failure) < window;
            if !live {
                tracing::debug!(%login, "signon failures expired");
            }
            live
        });
    }

    // -- helpers ------------------------------------------------------------

    /// Current counts for `login`; fresh once the window has passed.
    fn counter(&self, login: &str) -> FailedSignonCounter {
        let now = Instant::now();
        let window = self.config.failed_signon_window;
        self.counters
            .get(login)
            .filter(|record| now.saturating_duration_since(record.last_failure) < window)
            .map(|record| record.counter.clone())
            .unwrap_or_else(|| FailedSignonCounter::new(self.config.failed_signon_limit))
    }

    fn record_failure(&mut self, login: String, attempt: SignonAttempt) -> FailedSignonCounter {
        let counter = self.counter(&login).increment(attempt);
        if counter.has_reached_limit() {
            tracing::warn!(%login, ?attempt, "login locked after repeated signon failures");
        }
        self.counters.insert(
            login,
            FailureRecord {
                counter: counter.clone(),
                last_failure: Instant::now(),
            },
        );
        counter
    }

    fn spawn_signout(&self, id: SessionIdentifier) {
        let authority = Arc::clone(&self.authority);
        tokio::spawn(async move {
            if let Err(error) = authority.signout(&id).await {
                tracing::warn!(%id, %error, "authority signout failed");
            }
        });
    }

    fn reset_authority_failures(&self, login: String) {
        let authority = Arc::clone(&self.authority);
        tokio::spawn(async move {
            if let Err(error) = authority.reset_signon_failures(&login).await {
                tracing::warn!(%login, %error, "authority failure reset failed");
            }
        });
    }
}

fn notice_for(error: &SessionError) -> SignonFailureNotice {
    error.signon_failure().into()
}
