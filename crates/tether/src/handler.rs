//! Per-connection handler: handshake, signon and command routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive `Hello` → check the version → send `Welcome` or `Rejected`
//!   2. Loop: receive envelopes → pipeline (pings, untagged commands) →
//!      signon duties go to the supervisor, commands to the handler, one
//!      at a time and without blocking the loop
//!   3. On close or kick: tell the supervisor the channel is gone

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tether_protocol::{
    Codec, CommandOutcome, CommandTag, Credential, Direction, DownwardDuty, Envelope,
    PROTOCOL_VERSION, ProtocolError, SecondaryCode, SecondaryToken, SessionIdentifier,
    SignonFailure, SignonFailureNotice, UpwardDuty, Verdict,
};
use tether_session::{ChannelBinding, PrimarySignonOutcome, SignonAttempt};
use tether_transport::{Connection, ConnectionId, TransportError};

use crate::command::{CommandHandler, SessionContext};
use crate::server::ServerState;
use crate::TetherError;

/// Drop guard that reports the channel closed when the handler exits.
///
/// Runs even if the handler returns early with an error. Since `Drop` is
/// synchronous, the supervisor is told from a fire-and-forget task.
struct ChannelGuard<H: CommandHandler> {
    conn_id: ConnectionId,
    state: Arc<ServerState<H>>,
}

impl<H: CommandHandler> Drop for ChannelGuard<H> {
    fn drop(&mut self) {
        let conn_id = self.conn_id;
        self.state.registry.unregister(conn_id);
        let supervisor = self.state.supervisor.clone();
        tokio::spawn(async move {
            if let Err(error) = supervisor.closed(conn_id).await {
                tracing::debug!(%conn_id, %error, "could not report closed channel");
            }
        });
    }
}

/// A duty being worked on: a signon round trip or a command.
type InFlight = Pin<Box<dyn Future<Output = Result<Settled, TetherError>> + Send>>;

/// Frames kept while a duty is in flight; later ones are dropped.
const MAX_QUEUED_DUTIES: usize = 32;

/// What the handler knows about its Downend.
///
/// One duty runs at a time so signon replies and command outcomes leave
/// in the order their requests came in. Pings bypass the queue.
struct Link {
    binding: ChannelBinding,
    session: Option<SessionContext>,
    in_flight: Option<InFlight>,
    queued: VecDeque<Envelope<UpwardDuty>>,
}

impl Link {
    fn submit<H: CommandHandler>(
        &mut self,
        state: &Arc<ServerState<H>>,
        envelope: Envelope<UpwardDuty>,
    ) {
        if self.in_flight.is_none() {
            self.in_flight = Some(dispatch(state, self.binding, self.session.clone(), envelope));
        } else if self.queued.len() < MAX_QUEUED_DUTIES {
            self.queued.push_back(envelope);
        } else {
            tracing::warn!(conn_id = %self.binding.channel, "duty queue full, dropping frame");
        }
    }

    fn next<H: CommandHandler>(&mut self, state: &Arc<ServerState<H>>) {
        if let Some(envelope) = self.queued.pop_front() {
            self.in_flight = Some(dispatch(state, self.binding, self.session.clone(), envelope));
        }
    }

    fn apply(&mut self, change: SessionChange) {
        match change {
            SessionChange::Unchanged => {}
            SessionChange::SignedIn(context) => {
                tracing::info!(
                    conn_id = %self.binding.channel,
                    session_id = %context.session_id,
                    login = %context.login,
                    "signed on"
                );
                self.session = Some(context);
            }
            SessionChange::SignedOut => self.session = None,
        }
    }
}

/// What a finished duty leaves for the message loop.
struct Settled {
    reply: Option<Envelope<DownwardDuty>>,
    session: SessionChange,
}

enum SessionChange {
    Unchanged,
    SignedIn(SessionContext),
    SignedOut,
}

impl Settled {
    fn quiet() -> Self {
        Self {
            reply: None,
            session: SessionChange::Unchanged,
        }
    }

    fn reply(duty: DownwardDuty) -> Self {
        Self {
            reply: Some(Envelope::new(duty)),
            session: SessionChange::Unchanged,
        }
    }

    fn signed_in(session_id: SessionIdentifier, login: String) -> Self {
        Self {
            reply: Some(Envelope::new(DownwardDuty::SessionValid {
                session_id: session_id.clone(),
            })),
            session: SessionChange::SignedIn(SessionContext { session_id, login }),
        }
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<C, H>(
    conn: C,
    state: Arc<ServerState<H>>,
) -> Result<(), TetherError>
where
    C: Connection<Error = TransportError>,
    H: CommandHandler,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "handling new connection");

    let mut kicked = state.registry.register(conn_id);
    let _guard = ChannelGuard {
        conn_id,
        state: Arc::clone(&state),
    };

    // --- Step 1: Handshake ---
    perform_handshake(&conn, &state).await?;

    // --- Step 2: Message loop ---
    let mut link = Link {
        binding: ChannelBinding::new(conn_id, conn.remote_address()),
        session: None,
        in_flight: None,
        queued: VecDeque::new(),
    };
    let idle_limit = state.terms.time_boundary.ping_timeout;

    loop {
        tokio::select! {
            received = tokio::time::timeout(idle_limit, conn.recv()) => match received {
                Ok(Ok(Some(data))) => on_frame(&conn, &state, &mut link, &data).await?,
                Ok(Ok(None)) => {
                    tracing::info!(%conn_id, "connection closed cleanly");
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(%conn_id, error = %e, "recv error");
                    break;
                }
                Err(_) => {
                    tracing::info!(%conn_id, "connection timed out");
                    break;
                }
            },
            settled = finished(&mut link.in_flight) => {
                link.in_flight = None;
                let Settled { reply, session } = settled?;
                link.apply(session);
                if let Some(reply) = reply {
                    send_envelope(&conn, &state, &reply).await?;
                }
                link.next(&state);
            }
            reason = &mut kicked => {
                let reason = reason.unwrap_or_else(|_| "kicked out".to_string());
                tracing::info!(%conn_id, %reason, "kicking connection");
                send(&conn, &state, None, DownwardDuty::Kicked { reason }).await?;
                break;
            }
        }
    }

    let _ = conn.close().await;
    // _guard drops here → the supervisor hears the channel closed.
    Ok(())
}

/// Decodes one frame and runs it through the pipeline.
async fn on_frame<C, H>(
    conn: &C,
    state: &Arc<ServerState<H>>,
    link: &mut Link,
    data: &[u8],
) -> Result<(), TetherError>
where
    C: Connection<Error = TransportError>,
    H: CommandHandler,
{
    let envelope: Envelope<UpwardDuty> = match state.codec.decode(data) {
        Ok(env) => env,
        Err(e) => {
            tracing::debug!(
                conn_id = %link.binding.channel,
                error = %e,
                "failed to decode envelope"
            );
            return Ok(());
        }
    };

    match state.pipeline.process(envelope, Direction::Upward) {
        Verdict::Forward(envelope) => link.submit(state, envelope),
        Verdict::SendBack(reply) => send_envelope(conn, state, &reply).await?,
        Verdict::Drop => {
            tracing::debug!(conn_id = %link.binding.channel, "dropped untagged command");
        }
    }
    Ok(())
}

async fn finished(in_flight: &mut Option<InFlight>) -> Result<Settled, TetherError> {
    match in_flight {
        Some(duty) => duty.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Receives `Hello`, checks the version and answers `Welcome`.
async fn perform_handshake<C, H>(conn: &C, state: &Arc<ServerState<H>>) -> Result<(), TetherError>
where
    C: Connection<Error = TransportError>,
    H: CommandHandler,
{
    let data = match tokio::time::timeout(state.handshake_timeout, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => return Err(invalid("connection closed before hello")),
        Ok(Err(e)) => return Err(TetherError::Transport(e)),
        Err(_) => return Err(invalid("handshake timed out")),
    };

    let envelope: Envelope<UpwardDuty> = state.codec.decode(&data)?;
    match envelope.duty {
        UpwardDuty::Hello { version } if version == PROTOCOL_VERSION => {}
        UpwardDuty::Hello { version } => {
            let reason = format!("version mismatch: expected {PROTOCOL_VERSION}, got {version}");
            send(conn, state, None, DownwardDuty::Rejected { reason }).await?;
            return Err(invalid("protocol version mismatch"));
        }
        _ => {
            let reason = "expected Hello".to_string();
            send(conn, state, None, DownwardDuty::Rejected { reason }).await?;
            return Err(invalid("first message must be Hello"));
        }
    }

    let metadata = state.terms.to_metadata();
    send(conn, state, None, DownwardDuty::Welcome { metadata }).await
}

fn dispatch<H: CommandHandler>(
    state: &Arc<ServerState<H>>,
    binding: ChannelBinding,
    session: Option<SessionContext>,
    envelope: Envelope<UpwardDuty>,
) -> InFlight {
    let state = Arc::clone(state);
    Box::pin(async move {
        match envelope.duty {
            UpwardDuty::PrimarySignon { credential } => {
                Ok(primary_signon(&state, binding, credential).await)
            }
            UpwardDuty::SecondarySignon { token, code } => {
                Ok(secondary_signon(&state, binding, token, code).await)
            }
            UpwardDuty::Resignon { session_id } => Ok(resignon(&state, binding, session_id).await),
            UpwardDuty::Signout => {
                let Some(session) = session else {
                    return Ok(Settled::quiet());
                };
                tracing::info!(session_id = %session.session_id, "signout");
                state.supervisor.signout(session.session_id).await?;
                Ok(Settled {
                    reply: None,
                    session: SessionChange::SignedOut,
                })
            }
            UpwardDuty::Command { payload } => match envelope.tag {
                Some(tag) => Ok(command(&state, session.as_ref(), tag, payload).await),
                None => Ok(Settled::quiet()),
            },
            UpwardDuty::Hello { .. } | UpwardDuty::Ping { .. } => {
                tracing::debug!(conn_id = %binding.channel, "ignoring stray handshake frame");
                Ok(Settled::quiet())
            }
        }
    })
}

async fn primary_signon<H: CommandHandler>(
    state: &ServerState<H>,
    binding: ChannelBinding,
    credential: Credential,
) -> Settled {
    let login = credential.login.clone();
    match state.supervisor.attempt_primary_signon(credential, binding).await {
        Ok(PrimarySignonOutcome::NeedSecondarySignon { user, token }) => {
            Settled::reply(DownwardDuty::SecondarySignonNeeded { user, token })
        }
        Ok(PrimarySignonOutcome::SessionAttributed(session_id)) => {
            Settled::signed_in(session_id, login)
        }
        Err(notice) => {
            if notice.failure == SignonFailure::InvalidCredential {
                record_failure(state, &login, SignonAttempt::Primary).await;
            }
            Settled::reply(DownwardDuty::SignonFailed { notice })
        }
    }
}

/// Wrong codes count against the login that owns the challenge, whichever
/// connection sends them.
async fn secondary_signon<H: CommandHandler>(
    state: &ServerState<H>,
    binding: ChannelBinding,
    token: SecondaryToken,
    code: SecondaryCode,
) -> Settled {
    let owner = match state.supervisor.challenge_login(token.clone()).await {
        Ok(owner) => owner,
        Err(error) => {
            tracing::warn!(%error, "could not look up secondary challenge");
            None
        }
    };

    match state
        .supervisor
        .attempt_secondary_signon(token, code, binding)
        .await
    {
        Ok(session_id) => {
            let login = match owner {
                Some(login) => login,
                None => session_login(state, &session_id).await,
            };
            Settled::signed_in(session_id, login)
        }
        Err(notice) => {
            if notice.failure == SignonFailure::InvalidSecondaryCode {
                match &owner {
                    Some(login) => record_failure(state, login, SignonAttempt::Secondary).await,
                    None => tracing::warn!("rejected code for a challenge with no owner"),
                }
            }
            Settled::reply(DownwardDuty::SignonFailed { notice })
        }
    }
}

async fn resignon<H: CommandHandler>(
    state: &ServerState<H>,
    binding: ChannelBinding,
    session_id: SessionIdentifier,
) -> Settled {
    match state.supervisor.try_reuse(session_id.clone(), binding).await {
        Ok(()) => {
            let login = session_login(state, &session_id).await;
            Settled::signed_in(session_id, login)
        }
        Err(notice) => {
            tracing::debug!(%session_id, %notice, "resignon refused");
            Settled::reply(DownwardDuty::SignonFailed { notice })
        }
    }
}

async fn command<H: CommandHandler>(
    state: &ServerState<H>,
    session: Option<&SessionContext>,
    tag: CommandTag,
    payload: Vec<u8>,
) -> Settled {
    let outcome = if state.terms.authentication_required && session.is_none() {
        CommandOutcome::Failed {
            message: SignonFailureNotice::new(SignonFailure::UnknownSession, "not signed on")
                .to_string(),
        }
    } else {
        state.handler.handle(session, payload).await
    };
    tracing::debug!(%tag, failed = outcome.is_failure(), "command handled");
    Settled {
        reply: Some(Envelope::tagged(tag, DownwardDuty::CommandOutcome { outcome })),
        session: SessionChange::Unchanged,
    }
}

/// The owner of a session, or an empty login if it vanished meanwhile.
async fn session_login<H: CommandHandler>(
    state: &ServerState<H>,
    session_id: &SessionIdentifier,
) -> String {
    match state.supervisor.session(session_id.clone()).await {
        Ok(Some(session)) => session.user,
        _ => String::new(),
    }
}

async fn record_failure<H: CommandHandler>(
    state: &ServerState<H>,
    login: &str,
    attempt: SignonAttempt,
) {
    match state.supervisor.record_signon_failure(login, attempt).await {
        Ok(counter) if counter.has_reached_limit() => {
            tracing::warn!(%login, ?attempt, "signon locked after repeated failures");
        }
        Ok(_) => {}
        Err(error) => tracing::warn!(%login, %error, "could not record signon failure"),
    }
}

async fn send<C, H>(
    conn: &C,
    state: &Arc<ServerState<H>>,
    tag: Option<CommandTag>,
    duty: DownwardDuty,
) -> Result<(), TetherError>
where
    C: Connection<Error = TransportError>,
    H: CommandHandler,
{
    send_envelope(conn, state, &Envelope { tag, duty }).await
}

async fn send_envelope<C, H>(
    conn: &C,
    state: &Arc<ServerState<H>>,
    envelope: &Envelope<DownwardDuty>,
) -> Result<(), TetherError>
where
    C: Connection<Error = TransportError>,
    H: CommandHandler,
{
    let bytes = state.codec.encode(envelope)?;
    conn.send(&bytes).await.map_err(TetherError::Transport)
}

fn invalid(message: &str) -> TetherError {
    TetherError::Protocol(ProtocolError::InvalidMessage(message.to_string()))
}
