//! The reconnecting Downend connector.
//!
//! ```text
//!  caller threads                     connector task
//! ┌──────────────────┐   Control    ┌──────────────────────────────────┐
//! │ DownendConnector │ ───────────→ │ dial → Hello → Welcome → signon  │
//! │  send / stop     │              │   select! { frames, control,     │
//! │  state           │ ←─ Shared ── │             prompt, ping, pong,  │
//! └──────────────────┘              │             scavenge }           │
//!          │                        │ lost → jitter delay → dial again │
//!          └──── TrackerCurator ────┴──────────────────────────────────┘
//! ```
//!
//! All connection and signon state lives in the task, so it needs no
//! locking. Only the published [`ConnectorState`] and the tracker table are
//! shared with callers.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tether_protocol::{
    Codec, CommandTag, Credential, DownwardDuty, Envelope, JsonCodec, SecondaryCode,
    SecondaryToken, TimeBoundary, UpwardDuty,
};
use tether_transport::{Connection, Dialer, TransportError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::DownendConfig;
use crate::error::ConnectorError;
use crate::materializer::SignonMaterializer;
use crate::signon::{Disconnect, SignonAction, SignonMachine};
use crate::tracker::{Tracker, TrackerCurator};
use crate::watcher::{ConnectorEvent, ConnectorState, IgnoreStates, StateWatcher};

enum Control {
    Send { tag: CommandTag, payload: Vec<u8> },
    Stop { done: oneshot::Sender<()> },
}

/// State visible to callers and the task alike.
struct Shared {
    state: Mutex<ConnectorState>,
    watcher: Arc<dyn StateWatcher>,
}

impl Shared {
    fn state(&self) -> ConnectorState {
        *lock(&self.state)
    }

    /// Publishes `next`; the watcher only hears actual changes.
    fn set_state(&self, next: ConnectorState) {
        let previous = std::mem::replace(&mut *lock(&self.state), next);
        if previous != next {
            tracing::debug!(%previous, current = %next, "connector state");
            self.watcher.state_changed(previous, next);
        }
    }

    fn emit(&self, event: ConnectorEvent) {
        self.watcher.event(&event);
    }
}

/// What the task needs; handed over by the single successful `start()`.
struct ActorParts<D, M> {
    dialer: D,
    materializer: Arc<M>,
    config: DownendConfig,
    control: mpsc::UnboundedReceiver<Control>,
}

/// Client endpoint: keeps one signed-in connection to the Upend alive.
///
/// Construct it, optionally attach a [`StateWatcher`], then call
/// [`start`](Self::start) once. Connection losses are retried with a
/// jittered delay and a stored session is resumed without prompting.
///
/// ```rust,no_run
/// # async fn demo() -> Result<(), tether_downend::ConnectorError> {
/// use std::sync::Arc;
/// use tether_downend::{DownendConfig, DownendConnector, FixedSignon, Tracker};
/// use tether_protocol::Credential;
/// use tether_transport::WebSocketDialer;
///
/// struct Quiet;
/// impl Tracker for Quiet {}
///
/// let connector = DownendConnector::new(
///     WebSocketDialer::new("ws://127.0.0.1:9000"),
///     FixedSignon::new(Credential::new("alice", "secret")),
///     DownendConfig::default(),
/// );
/// connector.start()?.await?;
/// connector.send(b"hello".to_vec(), Arc::new(Quiet))?;
/// connector.stop()?.await;
/// # Ok(())
/// # }
/// ```
pub struct DownendConnector<D: Dialer, M: SignonMaterializer> {
    shared: Arc<Shared>,
    curator: TrackerCurator,
    control: mpsc::UnboundedSender<Control>,
    parts: Mutex<Option<ActorParts<D, M>>>,
    stop_requested: AtomicBool,
}

impl<D: Dialer, M: SignonMaterializer> DownendConnector<D, M> {
    pub fn new(dialer: D, materializer: M, config: DownendConfig) -> Self {
        let config = config.validated();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectorState::Stopped),
                watcher: Arc::new(IgnoreStates),
            }),
            curator: TrackerCurator::new(config.tag_prefix.clone(), config.tracker_lifetime),
            control: control_tx,
            parts: Mutex::new(Some(ActorParts {
                dialer,
                materializer: Arc::new(materializer),
                config,
                control: control_rx,
            })),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Replaces the state watcher. Only meaningful before `start()`.
    pub fn with_watcher(mut self, watcher: impl StateWatcher) -> Self {
        self.shared = Arc::new(Shared {
            state: Mutex::new(self.shared.state()),
            watcher: Arc::new(watcher),
        });
        self
    }

    pub fn state(&self) -> ConnectorState {
        self.shared.state()
    }

    /// The tracker table, e.g. to observe the in-flight status.
    pub fn curator(&self) -> &TrackerCurator {
        &self.curator
    }

    /// Starts connecting.
    ///
    /// The returned future resolves once the first attempt's outcome is
    /// known: `Ok` when commands may flow, an error when the attempt
    /// failed. Later losses are retried and never surface here.
    ///
    /// # Errors
    /// `InvalidState` on every call after the first.
    pub fn start(
        &self,
    ) -> Result<impl Future<Output = Result<(), ConnectorError>> + Send + 'static, ConnectorError>
    {
        let parts = lock(&self.parts)
            .take()
            .ok_or(ConnectorError::InvalidState("start() may only be called once"))?;
        let (first_tx, first_rx) = oneshot::channel();

        self.shared.set_state(ConnectorState::Connecting);
        let actor = Actor {
            shared: Arc::clone(&self.shared),
            curator: self.curator.clone(),
            boundary: parts.config.time_boundary,
            dialer: parts.dialer,
            materializer: parts.materializer,
            config: parts.config,
            control: parts.control,
            codec: JsonCodec,
            machine: SignonMachine::new(),
            pending: VecDeque::new(),
            first_outcome: Some(first_tx),
            connected: false,
            ping_counter: 0,
        };
        tokio::spawn(actor.run());

        Ok(async move { first_rx.await.unwrap_or(Err(ConnectorError::Stopped)) })
    }

    /// Closes the connection and stops reconnecting. The future resolves
    /// once the connector reached `Stopped`.
    ///
    /// # Errors
    /// `InvalidState` before `start()` or on a second call.
    pub fn stop(&self) -> Result<impl Future<Output = ()> + Send + 'static, ConnectorError> {
        if lock(&self.parts).is_some() {
            return Err(ConnectorError::InvalidState("stop() before start()"));
        }
        if self.stop_requested.swap(true, Ordering::AcqRel) {
            return Err(ConnectorError::InvalidState("stop() may only be called once"));
        }
        let (done_tx, done_rx) = oneshot::channel();
        // A task that already ended drops `done_tx`, which resolves the wait.
        let _ = self.control.send(Control::Stop { done: done_tx });
        Ok(async move {
            let _ = done_rx.await;
        })
    }

    /// Sends a command and tracks its outcome with `tracker`.
    ///
    /// Commands sent before signon completes are queued and go out once
    /// it does.
    ///
    /// # Errors
    /// `InvalidState` when the connector is not running.
    pub fn send(
        &self,
        payload: Vec<u8>,
        tracker: Arc<dyn Tracker>,
    ) -> Result<CommandTag, ConnectorError> {
        if matches!(
            self.state(),
            ConnectorState::Stopped | ConnectorState::Stopping
        ) {
            return Err(ConnectorError::InvalidState("connector is not running"));
        }
        let tag = self.curator.add(tracker);
        let message = Control::Send {
            tag: tag.clone(),
            payload,
        };
        if self.control.send(message).is_err() {
            self.curator.discard(&tag);
            return Err(ConnectorError::InvalidState("connector is not running"));
        }
        Ok(tag)
    }
}

/// Why the task leaves its reconnect loop.
enum Halt {
    /// `stop()` was called, or the connector handle was dropped.
    Stop(Option<oneshot::Sender<()>>),
    Failed(ConnectorError),
}

enum PromptAnswer {
    Credential(Credential),
    Code {
        token: SecondaryToken,
        code: SecondaryCode,
    },
    Cancelled,
}

type Prompt = Pin<Box<dyn Future<Output = PromptAnswer> + Send>>;

/// Per-connection timers and the open prompt.
#[derive(Default)]
struct Link {
    welcome_deadline: Option<Instant>,
    ping: Option<Interval>,
    pong_deadline: Option<Instant>,
    prompt: Option<Prompt>,
}

struct Outgoing {
    tag: CommandTag,
    payload: Vec<u8>,
}

struct Actor<D, M> {
    shared: Arc<Shared>,
    curator: TrackerCurator,
    dialer: D,
    materializer: Arc<M>,
    config: DownendConfig,
    control: mpsc::UnboundedReceiver<Control>,
    codec: JsonCodec,
    machine: SignonMachine,
    /// Starts as the configured value; replaced by each `Welcome`.
    boundary: TimeBoundary,
    /// Commands waiting for a ready connection, in send order.
    pending: VecDeque<Outgoing>,
    first_outcome: Option<oneshot::Sender<Result<(), ConnectorError>>>,
    /// Whether the curator was told the connection is up.
    connected: bool,
    ping_counter: u64,
}

impl<D: Dialer, M: SignonMaterializer> Actor<D, M> {
    async fn run(mut self) {
        let halt = loop {
            self.shared.set_state(ConnectorState::Connecting);
            let lost = match self.connect().await {
                Err(halt) => break halt,
                Ok(Err(error)) => error,
                Ok(Ok(connection)) => {
                    let remote = connection.remote_address();
                    tracing::info!(conn_id = %connection.id(), ?remote, "connected to upend");
                    let ended = self.run_connection(&connection).await;
                    let _ = connection.close().await;
                    match ended {
                        Ok(reason) => TransportError::ConnectionClosed(reason),
                        Err(halt) => break halt,
                    }
                }
            };
            self.connection_lost(lost);
            if let Err(halt) = self.reconnect_delay().await {
                break halt;
            }
        };
        self.finish(halt);
    }

    async fn connect(&mut self) -> Result<Result<D::Connection, TransportError>, Halt> {
        let timeout = self.config.connect_timeout;
        let dialer = &self.dialer;
        let dial = async move {
            tokio::time::timeout(timeout, dialer.dial())
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::ConnectFailed(format!(
                        "no answer within {timeout:?}"
                    )))
                })
        };
        until_stopped(&mut self.control, &mut self.pending, dial).await
    }

    async fn reconnect_delay(&mut self) -> Result<(), Halt> {
        let delay = jitter(&self.boundary);
        tracing::debug!(?delay, "reconnecting after delay");
        self.shared.emit(ConnectorEvent::ReconnectScheduled { delay });
        until_stopped(&mut self.control, &mut self.pending, tokio::time::sleep(delay)).await
    }

    /// Drives one connection. `Ok` carries why it was lost.
    async fn run_connection(&mut self, connection: &D::Connection) -> Result<String, Halt> {
        let mut link = Link {
            welcome_deadline: Some(Instant::now() + self.config.handshake_timeout),
            ..Link::default()
        };
        let mut scavenge = tokio::time::interval(self.config.scavenge_interval);
        scavenge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let hello = self.machine.connection_opened();
        if let Err(reason) = self.transmit(connection, None, hello).await {
            return Ok(reason);
        }

        loop {
            tokio::select! {
                frame = connection.recv() => match frame {
                    Ok(Some(bytes)) => {
                        if let Some(reason) = self.on_frame(connection, &bytes, &mut link).await? {
                            return Ok(reason);
                        }
                    }
                    Ok(None) => return Ok("closed by upend".to_string()),
                    Err(error) => return Ok(error.to_string()),
                },
                message = self.control.recv() => match message {
                    Some(Control::Send { tag, payload }) => {
                        let outgoing = Outgoing { tag, payload };
                        if !self.machine.is_ready() {
                            self.pending.push_back(outgoing);
                        } else if let Err(reason) = self.send_command(connection, outgoing).await {
                            return Ok(reason);
                        }
                    }
                    Some(Control::Stop { done }) => return Err(Halt::Stop(Some(done))),
                    None => return Err(Halt::Stop(None)),
                },
                answer = answered(&mut link.prompt) => {
                    link.prompt = None;
                    let duty = match answer {
                        PromptAnswer::Credential(credential) => {
                            self.materializer.set_progress_message(Some("signing on"));
                            self.machine.credential_entered(credential)
                        }
                        PromptAnswer::Code { token, code } => {
                            self.materializer.set_progress_message(Some("checking code"));
                            self.machine.code_entered(token, code)
                        }
                        PromptAnswer::Cancelled => {
                            tracing::info!("signon cancelled by user");
                            return Err(Halt::Failed(ConnectorError::Cancelled));
                        }
                    };
                    if let Err(reason) = self.transmit(connection, None, duty).await {
                        return Ok(reason);
                    }
                }
                () = ticked(&mut link.ping) => {
                    self.ping_counter += 1;
                    let ping = UpwardDuty::Ping { counter: self.ping_counter };
                    if let Err(reason) = self.transmit(connection, None, ping).await {
                        return Ok(reason);
                    }
                    if link.pong_deadline.is_none() {
                        link.pong_deadline = Some(Instant::now() + self.boundary.pong_timeout);
                    }
                }
                () = sleep_until(link.pong_deadline) => {
                    tracing::warn!(conn_id = %connection.id(), "pong timeout");
                    return Ok("pong timeout".to_string());
                }
                () = sleep_until(link.welcome_deadline) => {
                    tracing::warn!(conn_id = %connection.id(), "handshake timeout");
                    return Ok("handshake timeout".to_string());
                }
                _ = scavenge.tick() => {
                    let expired = self.curator.scavenge_timeouts(Instant::now());
                    if expired > 0 {
                        tracing::debug!(expired, "commands timed out");
                    }
                }
            }
        }
    }

    async fn on_frame(
        &mut self,
        connection: &D::Connection,
        bytes: &[u8],
        link: &mut Link,
    ) -> Result<Option<String>, Halt> {
        let envelope: Envelope<DownwardDuty> = match self.codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(conn_id = %connection.id(), %error, "undecodable frame");
                return Ok(None);
            }
        };
        envelope.call_receiver(&mut self.machine);

        for action in self.machine.take_actions() {
            if let Some(reason) = self.apply(connection, action, link).await? {
                return Ok(Some(reason));
            }
        }
        Ok(None)
    }

    async fn apply(
        &mut self,
        connection: &D::Connection,
        action: SignonAction,
        link: &mut Link,
    ) -> Result<Option<String>, Halt> {
        match action {
            SignonAction::Negotiated(terms) => {
                self.boundary = terms.time_boundary;
                link.welcome_deadline = None;
                let period = self.boundary.ping_interval;
                let mut ping = tokio::time::interval_at(Instant::now() + period, period);
                ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
                link.ping = Some(ping);

                self.shared.set_state(ConnectorState::Connected);
                self.shared.emit(ConnectorEvent::TransportConnected {
                    remote_address: connection.remote_address(),
                });
            }
            SignonAction::Send(duty) => {
                if let Err(reason) = self.transmit(connection, None, duty).await {
                    return Ok(Some(reason));
                }
            }
            SignonAction::PromptCredential => {
                self.materializer.set_progress_message(None);
                link.prompt = Some(self.credential_prompt());
            }
            SignonAction::PromptSecondaryCode { user, token } => {
                self.materializer.set_progress_message(None);
                link.prompt = Some(self.code_prompt(user, token));
            }
            SignonAction::Problem(notice) => {
                tracing::info!(%notice, "signon failed");
                self.materializer.set_problem_message(Some(&notice));
                self.shared.emit(ConnectorEvent::SignonFailed { notice });
            }
            SignonAction::SignedIn(session_id) => {
                tracing::info!(%session_id, "signed in");
                link.prompt = None;
                self.materializer.set_problem_message(None);
                self.materializer.set_progress_message(None);
                self.materializer.done();
                self.shared.set_state(ConnectorState::SignedIn);
                self.shared.emit(ConnectorEvent::SignedIn { session_id });
                return Ok(self.connection_ready(connection).await);
            }
            SignonAction::Ready => return Ok(self.connection_ready(connection).await),
            SignonAction::Pong(counter) => {
                if counter == self.ping_counter {
                    link.pong_deadline = None;
                }
            }
            SignonAction::Outcome { tag, outcome } => {
                if !self.curator.resolve(&tag, &outcome) {
                    tracing::debug!(%tag, "outcome for a command nobody waits for");
                }
            }
            SignonAction::Disconnect(Disconnect::Kicked(reason)) => {
                tracing::warn!(%reason, "kicked by upend");
                self.shared.emit(ConnectorEvent::Kicked {
                    reason: reason.clone(),
                });
                return Ok(Some(format!("kicked: {reason}")));
            }
            SignonAction::Disconnect(Disconnect::Rejected(reason)) => {
                self.shared.emit(ConnectorEvent::Rejected {
                    reason: reason.clone(),
                });
                return Err(Halt::Failed(ConnectorError::Rejected(reason)));
            }
            SignonAction::Disconnect(Disconnect::Invalid(error)) => {
                return Err(Halt::Failed(ConnectorError::Protocol(error)));
            }
        }
        Ok(None)
    }

    /// Commands may flow: tell the trackers and drain the queue.
    async fn connection_ready(&mut self, connection: &D::Connection) -> Option<String> {
        self.connected = true;
        self.curator.notify_reconnection();
        self.settle_first(Ok(()));

        while let Some(outgoing) = self.pending.pop_front() {
            if self.curator.get(&outgoing.tag).is_none() {
                continue;
            }
            if let Err(reason) = self.send_command(connection, outgoing).await {
                return Some(reason);
            }
        }
        None
    }

    fn connection_lost(&mut self, error: TransportError) {
        tracing::info!(%error, "connection lost");
        if self.connected {
            self.connected = false;
            self.curator.notify_connection_broken();
        }
        self.shared.emit(ConnectorEvent::TransportLost {
            reason: error.to_string(),
        });
        self.settle_first(Err(error.into()));
    }

    fn finish(mut self, halt: Halt) {
        self.shared.set_state(ConnectorState::Stopping);
        if self.connected {
            self.connected = false;
            self.curator.notify_connection_broken();
        }
        self.materializer.done();

        let done = match halt {
            Halt::Stop(done) => {
                self.settle_first(Err(ConnectorError::Stopped));
                done
            }
            Halt::Failed(error) => {
                tracing::warn!(%error, "connector giving up");
                self.settle_first(Err(error));
                None
            }
        };
        self.shared.set_state(ConnectorState::Stopped);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn settle_first(&mut self, outcome: Result<(), ConnectorError>) {
        if let Some(first) = self.first_outcome.take() {
            let _ = first.send(outcome);
        }
    }

    fn credential_prompt(&self) -> Prompt {
        let materializer = Arc::clone(&self.materializer);
        Box::pin(async move {
            tokio::select! {
                credential = materializer.read_credential() => {
                    credential.map_or(PromptAnswer::Cancelled, PromptAnswer::Credential)
                }
                () = materializer.wait_for_cancellation() => PromptAnswer::Cancelled,
            }
        })
    }

    fn code_prompt(&self, user: String, token: SecondaryToken) -> Prompt {
        let materializer = Arc::clone(&self.materializer);
        Box::pin(async move {
            tokio::select! {
                code = materializer.read_secondary_code(&user) => match code {
                    Some(code) => PromptAnswer::Code { token, code },
                    None => PromptAnswer::Cancelled,
                },
                () = materializer.wait_for_cancellation() => PromptAnswer::Cancelled,
            }
        })
    }

    async fn send_command(
        &self,
        connection: &D::Connection,
        outgoing: Outgoing,
    ) -> Result<(), String> {
        tracing::debug!(tag = %outgoing.tag, "sending command");
        let duty = UpwardDuty::Command {
            payload: outgoing.payload,
        };
        self.transmit(connection, Some(outgoing.tag), duty).await
    }

    async fn transmit(
        &self,
        connection: &D::Connection,
        tag: Option<CommandTag>,
        duty: UpwardDuty,
    ) -> Result<(), String> {
        let bytes = self
            .codec
            .encode(&Envelope { tag, duty })
            .map_err(|error| error.to_string())?;
        connection.send(&bytes).await.map_err(|error| error.to_string())
    }
}

/// Runs `future` while still honouring control messages: sends are
/// queued, a stop interrupts.
async fn until_stopped<F: Future>(
    control: &mut mpsc::UnboundedReceiver<Control>,
    pending: &mut VecDeque<Outgoing>,
    future: F,
) -> Result<F::Output, Halt> {
    tokio::pin!(future);
    loop {
        tokio::select! {
            output = &mut future => return Ok(output),
            message = control.recv() => match message {
                Some(Control::Send { tag, payload }) => pending.push_back(Outgoing { tag, payload }),
                Some(Control::Stop { done }) => return Err(Halt::Stop(Some(done))),
                None => return Err(Halt::Stop(None)),
            },
        }
    }
}

/// A uniformly random delay within the reconnect range.
fn jitter(boundary: &TimeBoundary) -> Duration {
    let lower = millis(boundary.reconnect_delay_lower);
    let upper = millis(boundary.reconnect_delay_upper).max(lower);
    Duration::from_millis(rand::rng().random_range(lower..=upper))
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn answered(prompt: &mut Option<Prompt>) -> PromptAnswer {
    match prompt {
        Some(prompt) => prompt.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn ticked(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_stays_within_range() {
        let boundary = TimeBoundary {
            reconnect_delay_lower: Duration::from_millis(100),
            reconnect_delay_upper: Duration::from_millis(200),
            ..TimeBoundary::default()
        };
        for _ in 0..100 {
            let delay = jitter(&boundary);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_jitter_with_equal_bounds_is_fixed() {
        let boundary = TimeBoundary {
            reconnect_delay_lower: Duration::from_millis(50),
            reconnect_delay_upper: Duration::from_millis(50),
            ..TimeBoundary::default()
        };
        assert_eq!(jitter(&boundary), Duration::from_millis(50));
    }
}
