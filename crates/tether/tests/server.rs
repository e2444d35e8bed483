//! Integration tests for the Upend server, its connection handler, and a
//! full Downend ↔ Upend round trip over WebSocket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tether::prelude::*;
use tether::protocol::{DownwardDuty, Envelope, PROTOCOL_VERSION, UpwardDuty, keys};
use tether::session::{SessionState, SignonAttempt};
use tokio_tungstenite::tungstenite::Message;

// =========================================================================
// Mock authority, secondary provider and commands
// =========================================================================

/// `alice/secret` signs on directly, `bob/secret` needs a secondary code.
struct TestAuthority;

impl SessionAuthority for TestAuthority {
    async fn check_credential(&self, credential: &Credential) -> Result<UserProfile, SignonFailure> {
        match (credential.login.as_str(), credential.password.as_str()) {
            ("alice", "secret") => Ok(UserProfile::new("alice", None)),
            ("bob", "secret") => Ok(UserProfile::new("bob", Some("+15550100".into()))),
            _ => Err(SignonFailure::InvalidCredential),
        }
    }

    async fn register_session(
        &self,
        _id: &SessionIdentifier,
        _login: &str,
    ) -> Result<(), AuthorityError> {
        Ok(())
    }

    async fn signout(&self, _id: &SessionIdentifier) -> Result<(), AuthorityError> {
        Ok(())
    }

    async fn reset_signon_failures(&self, _login: &str) -> Result<(), AuthorityError> {
        Ok(())
    }
}

/// Issues token `tok` and accepts code `1234`.
struct TestSecondary;

impl SecondaryAuthenticator for TestSecondary {
    async fn request_authentication(
        &self,
        _phone_number: &str,
    ) -> Result<SecondaryToken, SecondaryAuthFailure> {
        Ok(SecondaryToken::new("tok"))
    }

    async fn verify_secondary_code(
        &self,
        token: &SecondaryToken,
        code: &SecondaryCode,
    ) -> Result<bool, SecondaryAuthFailure> {
        Ok(token.as_str() == "tok" && code.as_str() == "1234")
    }
}

/// Like [`TestSecondary`], but takes two seconds to check a code.
struct SlowSecondary;

impl SecondaryAuthenticator for SlowSecondary {
    async fn request_authentication(
        &self,
        _phone_number: &str,
    ) -> Result<SecondaryToken, SecondaryAuthFailure> {
        Ok(SecondaryToken::new("tok"))
    }

    async fn verify_secondary_code(
        &self,
        _token: &SecondaryToken,
        code: &SecondaryCode,
    ) -> Result<bool, SecondaryAuthFailure> {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(code.as_str() == "1234")
    }
}

/// Echoes the payload, prefixed with the sender's login when signed on.
struct Echo;

impl CommandHandler for Echo {
    async fn handle(&self, session: Option<&SessionContext>, payload: Vec<u8>) -> CommandOutcome {
        let mut reply = match session {
            Some(session) => format!("{}:", session.login).into_bytes(),
            None => Vec::new(),
        };
        reply.extend(payload);
        CommandOutcome::Succeeded { payload: reply }
    }
}

// =========================================================================
// Helpers
// =========================================================================

type ClientWs =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn boundary() -> TimeBoundary {
    TimeBoundary {
        ping_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_secs(2),
        pong_timeout: Duration::from_millis(500),
        reconnect_delay_lower: Duration::from_millis(10),
        reconnect_delay_upper: Duration::from_millis(30),
        ..TimeBoundary::default()
    }
}

async fn build_server(
    authentication_required: bool,
    secondary: impl SecondaryAuthenticator,
) -> tether::UpendServer<WebSocketTransport, Echo> {
    UpendServer::builder()
        .bind("127.0.0.1:0")
        .authentication_required(authentication_required)
        .time_boundary(boundary())
        .build(TestAuthority, secondary, Echo)
        .await
        .expect("server should build")
}

/// Starts a server on a random port and returns its address and
/// supervisor.
async fn start_server(authentication_required: bool) -> (String, SessionSupervisor) {
    start_server_with(authentication_required, TestSecondary).await
}

async fn start_server_with(
    authentication_required: bool,
    secondary: impl SecondaryAuthenticator,
) -> (String, SessionSupervisor) {
    let server = build_server(authentication_required, secondary).await;
    let addr = server.local_addr().expect("should have local addr").to_string();
    let supervisor = server.supervisor();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    (addr, supervisor)
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

fn encode_envelope(envelope: &Envelope<UpwardDuty>) -> Message {
    let bytes = serde_json::to_vec(envelope).expect("encode");
    Message::Binary(bytes.into())
}

fn decode_envelope(msg: Message) -> Envelope<DownwardDuty> {
    serde_json::from_slice(&msg.into_data()).expect("decode")
}

async fn send(ws: &mut ClientWs, duty: UpwardDuty) {
    ws.send(encode_envelope(&Envelope::new(duty))).await.expect("send");
}

async fn send_command(ws: &mut ClientWs, tag: CommandTag, payload: &[u8]) {
    let envelope = Envelope::tagged(
        tag,
        UpwardDuty::Command {
            payload: payload.to_vec(),
        },
    );
    ws.send(encode_envelope(&envelope)).await.expect("send");
}

async fn recv(ws: &mut ClientWs) -> Envelope<DownwardDuty> {
    recv_within(ws, Duration::from_secs(2)).await
}

async fn recv_within(ws: &mut ClientWs, limit: Duration) -> Envelope<DownwardDuty> {
    let msg = tokio::time::timeout(limit, ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("recv");
    decode_envelope(msg)
}

/// Sends `Hello` and returns the server's answer.
async fn hello(ws: &mut ClientWs, version: u32) -> DownwardDuty {
    send(ws, UpwardDuty::Hello { version }).await;
    recv(ws).await.duty
}

async fn sign_on(ws: &mut ClientWs, login: &str, password: &str) -> DownwardDuty {
    send(
        ws,
        UpwardDuty::PrimarySignon {
            credential: Credential::new(login, password),
        },
    )
    .await;
    recv(ws).await.duty
}

/// Waits until the supervisor saw the session's channel close.
async fn until_orphaned(supervisor: &SessionSupervisor, id: &SessionIdentifier) {
    for _ in 0..300 {
        let session = supervisor.session(id.clone()).await.unwrap();
        if matches!(session, Some(session) if matches!(session.state, SessionState::Orphaned { .. })) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session {id} never became orphaned");
}

async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

// =========================================================================
// Handshake
// =========================================================================

#[tokio::test]
async fn test_hello_returns_welcome_with_terms() {
    let (addr, _) = start_server(true).await;
    let mut ws = connect(&addr).await;

    match hello(&mut ws, PROTOCOL_VERSION).await {
        DownwardDuty::Welcome { metadata } => {
            assert_eq!(
                metadata.integer(keys::PROTOCOL_VERSION).unwrap(),
                i64::from(PROTOCOL_VERSION)
            );
            assert_eq!(metadata.text(keys::AUTHENTICATION_REQUIRED).unwrap(), "true");
            assert_eq!(metadata.integer(keys::PING_INTERVAL_MS).unwrap(), 200);
            assert_eq!(metadata.integer(keys::RECONNECT_DELAY_UPPER_MS).unwrap(), 30);
        }
        other => panic!("expected Welcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_hello_version_mismatch_is_rejected() {
    let (addr, _) = start_server(true).await;
    let mut ws = connect(&addr).await;

    match hello(&mut ws, 999).await {
        DownwardDuty::Rejected { reason } => {
            assert!(reason.contains("version mismatch"), "{reason}");
        }
        other => panic!("expected Rejected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_first_message_not_hello_is_rejected() {
    let (addr, _) = start_server(true).await;
    let mut ws = connect(&addr).await;

    send(&mut ws, UpwardDuty::Ping { counter: 1 }).await;
    match recv(&mut ws).await.duty {
        DownwardDuty::Rejected { reason } => assert_eq!(reason, "expected Hello"),
        other => panic!("expected Rejected, got {other:?}"),
    }
}

// =========================================================================
// Keepalive and filtering
// =========================================================================

#[tokio::test]
async fn test_ping_is_answered_with_same_counter() {
    let (addr, _) = start_server(true).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;

    send(&mut ws, UpwardDuty::Ping { counter: 41 }).await;
    assert_eq!(recv(&mut ws).await.duty, DownwardDuty::Pong { counter: 41 });
}

#[tokio::test]
async fn test_untagged_command_and_garbage_are_dropped() {
    let (addr, _) = start_server(false).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;

    ws.send(Message::Binary(b"not json".to_vec().into()))
        .await
        .expect("send");
    send(&mut ws, UpwardDuty::Command { payload: vec![1] }).await;
    send(&mut ws, UpwardDuty::Ping { counter: 7 }).await;

    // Nothing was answered before the pong.
    assert_eq!(recv(&mut ws).await.duty, DownwardDuty::Pong { counter: 7 });
}

// =========================================================================
// Signon
// =========================================================================

#[tokio::test]
async fn test_primary_signon_without_phone_attributes_session() {
    let (addr, supervisor) = start_server(true).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;

    let session_id = match sign_on(&mut ws, "alice", "secret").await {
        DownwardDuty::SessionValid { session_id } => session_id,
        other => panic!("expected SessionValid, got {other:?}"),
    };

    let session = supervisor.session(session_id).await.unwrap().expect("session exists");
    assert_eq!(session.user, "alice");
}

#[tokio::test]
async fn test_secondary_signon_with_right_code_attributes_session() {
    let (addr, _) = start_server(true).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;

    let token = match sign_on(&mut ws, "bob", "secret").await {
        DownwardDuty::SecondarySignonNeeded { user, token } => {
            assert_eq!(user, "bob");
            token
        }
        other => panic!("expected SecondarySignonNeeded, got {other:?}"),
    };

    send(
        &mut ws,
        UpwardDuty::SecondarySignon {
            token: token.clone(),
            code: SecondaryCode::new("0000"),
        },
    )
    .await;
    match recv(&mut ws).await.duty {
        DownwardDuty::SignonFailed { notice } => {
            assert_eq!(notice.failure, SignonFailure::InvalidSecondaryCode);
        }
        other => panic!("expected SignonFailed, got {other:?}"),
    }

    send(
        &mut ws,
        UpwardDuty::SecondarySignon {
            token,
            code: SecondaryCode::new("1234"),
        },
    )
    .await;
    assert!(matches!(
        recv(&mut ws).await.duty,
        DownwardDuty::SessionValid { .. }
    ));

    send_command(&mut ws, CommandTag::new("t", 1), b"hi").await;
    assert_eq!(
        recv(&mut ws).await.duty,
        DownwardDuty::CommandOutcome {
            outcome: CommandOutcome::Succeeded {
                payload: b"bob:hi".to_vec()
            }
        }
    );
}

#[tokio::test]
async fn test_repeated_invalid_credentials_lock_login() {
    let (addr, supervisor) = start_server(true).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;

    for _ in 0..3 {
        match sign_on(&mut ws, "alice", "wrong").await {
            DownwardDuty::SignonFailed { notice } => {
                assert_eq!(notice.failure, SignonFailure::InvalidCredential);
            }
            other => panic!("expected SignonFailed, got {other:?}"),
        }
    }

    // Even the right password is refused now.
    match sign_on(&mut ws, "alice", "secret").await {
        DownwardDuty::SignonFailed { notice } => {
            assert_eq!(notice.failure, SignonFailure::Locked);
        }
        other => panic!("expected Locked, got {other:?}"),
    }

    supervisor.reset_signon_failures("alice").await.unwrap();
    assert!(matches!(
        sign_on(&mut ws, "alice", "secret").await,
        DownwardDuty::SessionValid { .. }
    ));
}

#[tokio::test]
async fn test_resignon_on_new_connection_reuses_session() {
    let (addr, supervisor) = start_server(true).await;

    let mut first = connect(&addr).await;
    hello(&mut first, PROTOCOL_VERSION).await;
    let session_id = match sign_on(&mut first, "alice", "secret").await {
        DownwardDuty::SessionValid { session_id } => session_id,
        other => panic!("expected SessionValid, got {other:?}"),
    };
    first.close(None).await.expect("close");
    until_orphaned(&supervisor, &session_id).await;

    let mut second = connect(&addr).await;
    hello(&mut second, PROTOCOL_VERSION).await;
    send(
        &mut second,
        UpwardDuty::Resignon {
            session_id: session_id.clone(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut second).await.duty,
        DownwardDuty::SessionValid {
            session_id: session_id.clone()
        }
    );
    assert_eq!(supervisor.session_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_resignon_unknown_session_fails() {
    let (addr, _) = start_server(true).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;

    send(
        &mut ws,
        UpwardDuty::Resignon {
            session_id: SessionIdentifier::new("nope"),
        },
    )
    .await;
    match recv(&mut ws).await.duty {
        DownwardDuty::SignonFailed { notice } => {
            assert_eq!(notice.failure, SignonFailure::UnknownSession);
        }
        other => panic!("expected SignonFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_signout_removes_session() {
    let (addr, supervisor) = start_server(true).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;
    sign_on(&mut ws, "alice", "secret").await;
    assert_eq!(supervisor.session_count().await.unwrap(), 1);

    send(&mut ws, UpwardDuty::Signout).await;
    // Duties run in order, so the command sees the signout.
    send_command(&mut ws, CommandTag::new("t", 1), b"hi").await;
    match recv(&mut ws).await.duty {
        DownwardDuty::CommandOutcome {
            outcome: CommandOutcome::Failed { message },
        } => assert!(message.contains("not signed on"), "{message}"),
        other => panic!("expected failed outcome, got {other:?}"),
    }

    assert_eq!(supervisor.session_count().await.unwrap(), 0);
}

async fn bob_token(ws: &mut ClientWs) -> SecondaryToken {
    match sign_on(ws, "bob", "secret").await {
        DownwardDuty::SecondarySignonNeeded { token, .. } => token,
        other => panic!("expected SecondarySignonNeeded, got {other:?}"),
    }
}

async fn send_code(ws: &mut ClientWs, token: &SecondaryToken, code: &str) {
    send(
        ws,
        UpwardDuty::SecondarySignon {
            token: token.clone(),
            code: SecondaryCode::new(code),
        },
    )
    .await;
}

fn signon_failure(duty: DownwardDuty) -> SignonFailure {
    match duty {
        DownwardDuty::SignonFailed { notice } => notice.failure,
        other => panic!("expected SignonFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wrong_codes_from_another_connection_lock_login() {
    let (addr, supervisor) = start_server(true).await;
    let mut owner = connect(&addr).await;
    hello(&mut owner, PROTOCOL_VERSION).await;
    let token = bob_token(&mut owner).await;

    let mut guesser = connect(&addr).await;
    hello(&mut guesser, PROTOCOL_VERSION).await;
    for code in ["0000", "1111", "2222"] {
        send_code(&mut guesser, &token, code).await;
        assert_eq!(
            signon_failure(recv(&mut guesser).await.duty),
            SignonFailure::InvalidSecondaryCode
        );
    }
    let counter = supervisor.signon_failures("bob").await.unwrap();
    assert_eq!(counter.count(SignonAttempt::Secondary), 3);

    // The right code no longer helps, and the challenge is gone.
    send_code(&mut guesser, &token, "1234").await;
    assert_eq!(signon_failure(recv(&mut guesser).await.duty), SignonFailure::Locked);
    send_code(&mut owner, &token, "1234").await;
    assert_eq!(
        signon_failure(recv(&mut owner).await.duty),
        SignonFailure::UnknownSecondaryToken
    );
    assert_eq!(
        signon_failure(sign_on(&mut owner, "bob", "secret").await),
        SignonFailure::Locked
    );
    assert_eq!(supervisor.session_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_ping_answered_while_code_is_checked() {
    let (addr, _) = start_server_with(true, SlowSecondary).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;
    let token = bob_token(&mut ws).await;

    send_code(&mut ws, &token, "1234").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    send(&mut ws, UpwardDuty::Ping { counter: 9 }).await;

    // Well inside the 500ms pong timeout, long before the code is checked.
    assert_eq!(
        recv_within(&mut ws, Duration::from_millis(500)).await.duty,
        DownwardDuty::Pong { counter: 9 }
    );
    assert!(matches!(
        recv_within(&mut ws, Duration::from_secs(5)).await.duty,
        DownwardDuty::SessionValid { .. }
    ));
}

#[tokio::test]
async fn test_kickout_while_code_is_checked_is_prompt() {
    let (addr, supervisor) = start_server_with(true, SlowSecondary).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;
    let session_id = match sign_on(&mut ws, "alice", "secret").await {
        DownwardDuty::SessionValid { session_id } => session_id,
        other => panic!("expected SessionValid, got {other:?}"),
    };
    let token = bob_token(&mut ws).await;

    send_code(&mut ws, &token, "1234").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(supervisor.kickout(session_id, "maintenance").await.unwrap());

    assert_eq!(
        recv_within(&mut ws, Duration::from_millis(500)).await.duty,
        DownwardDuty::Kicked {
            reason: "maintenance".into()
        }
    );
}

// =========================================================================
// Commands
// =========================================================================

#[tokio::test]
async fn test_command_before_signon_fails_when_auth_required() {
    let (addr, _) = start_server(true).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;

    send_command(&mut ws, CommandTag::new("t", 3), b"hi").await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply.tag, Some(CommandTag::new("t", 3)));
    match reply.duty {
        DownwardDuty::CommandOutcome {
            outcome: CommandOutcome::Failed { message },
        } => assert!(message.contains("not signed on"), "{message}"),
        other => panic!("expected failed outcome, got {other:?}"),
    }
}

#[tokio::test]
async fn test_command_without_signon_runs_when_auth_not_required() {
    let (addr, _) = start_server(false).await;
    let mut ws = connect(&addr).await;
    match hello(&mut ws, PROTOCOL_VERSION).await {
        DownwardDuty::Welcome { metadata } => {
            assert_eq!(metadata.text(keys::AUTHENTICATION_REQUIRED).unwrap(), "false");
        }
        other => panic!("expected Welcome, got {other:?}"),
    }

    send_command(&mut ws, CommandTag::new("t", 1), b"hi").await;
    let reply = recv(&mut ws).await;
    assert_eq!(reply.tag, Some(CommandTag::new("t", 1)));
    assert_eq!(
        reply.duty,
        DownwardDuty::CommandOutcome {
            outcome: CommandOutcome::Succeeded {
                payload: b"hi".to_vec()
            }
        }
    );
}

// =========================================================================
// Kickout and shutdown
// =========================================================================

#[tokio::test]
async fn test_kickout_sends_kicked_and_closes() {
    let (addr, supervisor) = start_server(true).await;
    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;
    let session_id = match sign_on(&mut ws, "alice", "secret").await {
        DownwardDuty::SessionValid { session_id } => session_id,
        other => panic!("expected SessionValid, got {other:?}"),
    };

    assert!(supervisor.kickout(session_id, "maintenance").await.unwrap());
    assert_eq!(
        recv(&mut ws).await.duty,
        DownwardDuty::Kicked {
            reason: "maintenance".into()
        }
    );

    let closed = tokio::time::timeout(Duration::from_secs(2), ws.next()).await;
    match closed {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {}
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test]
async fn test_run_until_shutdown_kicks_everyone_out() {
    let server = build_server(true, TestSecondary).await;
    let addr = server.local_addr().unwrap().to_string();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;
    sign_on(&mut ws, "alice", "secret").await;

    stop_tx.send(()).unwrap();
    assert_eq!(
        recv(&mut ws).await.duty,
        DownwardDuty::Kicked {
            reason: "upend shutting down".into()
        }
    );
    running.await.unwrap().unwrap();
}

// =========================================================================
// Downend ↔ Upend
// =========================================================================

#[derive(Clone, Default)]
struct Recorder {
    states: Arc<Mutex<Vec<ConnectorState>>>,
    sessions: Arc<Mutex<Vec<SessionIdentifier>>>,
}

impl StateWatcher for Recorder {
    fn state_changed(&self, _previous: ConnectorState, current: ConnectorState) {
        self.states.lock().unwrap().push(current);
    }

    fn event(&self, event: &ConnectorEvent) {
        if let ConnectorEvent::SignedIn { session_id } = event {
            self.sessions.lock().unwrap().push(session_id.clone());
        }
    }
}

#[derive(Default)]
struct OutcomeSlot(Mutex<Option<CommandOutcome>>);

impl Tracker for OutcomeSlot {
    fn on_outcome(&self, outcome: &CommandOutcome) {
        *self.0.lock().unwrap() = Some(outcome.clone());
    }
}

#[tokio::test]
async fn test_downend_signs_on_sends_and_recovers_from_kickout() {
    let (addr, supervisor) = start_server(true).await;
    let recorder = Recorder::default();

    let signon = FixedSignon::new(Credential::new("bob", "secret"))
        .with_secondary_code(SecondaryCode::new("1234"));
    let connector = DownendConnector::new(
        WebSocketDialer::new(format!("ws://{addr}")),
        signon,
        DownendConfig::default(),
    )
    .with_watcher(recorder.clone());

    connector.start().unwrap().await.unwrap();
    assert_eq!(connector.state(), ConnectorState::SignedIn);

    let slot = Arc::new(OutcomeSlot::default());
    connector.send(b"ping".to_vec(), slot.clone()).unwrap();
    eventually(|| slot.0.lock().unwrap().is_some()).await;
    assert_eq!(
        slot.0.lock().unwrap().clone(),
        Some(CommandOutcome::Succeeded {
            payload: b"bob:ping".to_vec()
        })
    );

    let first = recorder.sessions.lock().unwrap()[0].clone();
    assert!(supervisor.kickout(first.clone(), "rotate").await.unwrap());

    // A kicked Downend signs on from scratch and gets a fresh session.
    eventually(|| recorder.sessions.lock().unwrap().len() == 2).await;
    let second = recorder.sessions.lock().unwrap()[1].clone();
    assert_ne!(first, second);
    eventually(|| connector.state() == ConnectorState::SignedIn).await;

    connector.stop().unwrap().await;
    assert_eq!(connector.state(), ConnectorState::Stopped);
    assert_eq!(
        recorder.states.lock().unwrap().last(),
        Some(&ConnectorState::Stopped)
    );
}

#[tokio::test]
async fn test_session_outlives_dropped_connection() {
    let (addr, supervisor) = start_server(true).await;

    let mut ws = connect(&addr).await;
    hello(&mut ws, PROTOCOL_VERSION).await;
    let session_id = match sign_on(&mut ws, "alice", "secret").await {
        DownwardDuty::SessionValid { session_id } => session_id,
        other => panic!("expected SessionValid, got {other:?}"),
    };
    drop(ws);

    // Closing the channel leaves the session in place for a resignon.
    until_orphaned(&supervisor, &session_id).await;
    assert_eq!(supervisor.session_count().await.unwrap(), 1);
}
