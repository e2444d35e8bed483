//! An Upend and a Downend in one process.
//!
//! The Upend counts commands per user. The Downend signs on, sends a few
//! commands, gets kicked out, signs on again and sends one more.
//!
//! ```text
//! cargo run -p relay                 # defaults, random port
//! cargo run -p relay -- upend.json   # UpendConfig as JSON
//! RUST_LOG=debug cargo run -p relay
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tether::prelude::*;
use tether::telemetry;

// ---------------------------------------------------------------------------
// Upend side
// ---------------------------------------------------------------------------

/// One user, `demo`/`demo`, without a phone.
struct DemoUsers;

impl SessionAuthority for DemoUsers {
    async fn check_credential(&self, credential: &Credential) -> Result<UserProfile, SignonFailure> {
        if credential.login == "demo" && credential.password == "demo" {
            Ok(UserProfile::new("demo", None))
        } else {
            Err(SignonFailure::InvalidCredential)
        }
    }

    async fn register_session(
        &self,
        id: &SessionIdentifier,
        login: &str,
    ) -> Result<(), AuthorityError> {
        tracing::info!(%id, %login, "session registered");
        Ok(())
    }

    async fn signout(&self, id: &SessionIdentifier) -> Result<(), AuthorityError> {
        tracing::info!(%id, "session forgotten");
        Ok(())
    }

    async fn reset_signon_failures(&self, _login: &str) -> Result<(), AuthorityError> {
        Ok(())
    }
}

/// Answers `"<login> #<n>: <text>"`, counting per login.
#[derive(Default)]
struct Tally {
    counts: Mutex<HashMap<String, u64>>,
}

impl Tally {
    fn bump(&self, login: &str) -> u64 {
        let mut counts = self
            .counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let count = counts.entry(login.to_string()).or_default();
        *count += 1;
        *count
    }
}

impl CommandHandler for Tally {
    async fn handle(&self, session: Option<&SessionContext>, payload: Vec<u8>) -> CommandOutcome {
        let Some(session) = session else {
            return CommandOutcome::Failed {
                message: "anonymous commands are not counted".into(),
            };
        };
        let Ok(text) = String::from_utf8(payload) else {
            return CommandOutcome::Failed {
                message: "payload is not UTF-8".into(),
            };
        };
        let n = self.bump(&session.login);
        CommandOutcome::Succeeded {
            payload: format!("{} #{n}: {text}", session.login).into_bytes(),
        }
    }
}

fn load_config() -> Result<UpendConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => Ok(UpendConfig {
            bind_address: "127.0.0.1:0".into(),
            time_boundary: TimeBoundary {
                ping_interval: Duration::from_secs(1),
                reconnect_delay_lower: Duration::from_millis(100),
                reconnect_delay_upper: Duration::from_millis(400),
                ..TimeBoundary::default()
            },
            ..UpendConfig::default()
        }),
    }
}

// ---------------------------------------------------------------------------
// Downend side
// ---------------------------------------------------------------------------

/// Logs the Downend's progress and counts its signons.
#[derive(Clone, Default)]
struct LogStates {
    signons: Arc<AtomicUsize>,
}

impl StateWatcher for LogStates {
    fn state_changed(&self, previous: ConnectorState, current: ConnectorState) {
        tracing::info!(%previous, %current, "downend state");
    }

    fn event(&self, event: &ConnectorEvent) {
        if let ConnectorEvent::SignedIn { session_id } = event {
            self.signons.fetch_add(1, Ordering::Relaxed);
            tracing::info!(%session_id, "downend signed in");
        } else {
            tracing::debug!(?event, "downend event");
        }
    }
}

struct LogOutcome(&'static str);

impl Tracker for LogOutcome {
    fn on_outcome(&self, outcome: &CommandOutcome) {
        match outcome {
            CommandOutcome::Succeeded { payload } => {
                tracing::info!(command = self.0, reply = %String::from_utf8_lossy(payload), "outcome");
            }
            CommandOutcome::Failed { message } => {
                tracing::warn!(command = self.0, %message, "command failed");
            }
        }
    }

    fn after_timeout(&self) {
        tracing::warn!(command = self.0, "no outcome in time");
    }
}

async fn wait_for_signons(watcher: &LogStates, count: usize) {
    while watcher.signons.load(Ordering::Relaxed) < count {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing("info")?;

    let server = UpendServer::builder()
        .config(load_config()?)
        .build(DemoUsers, NoSecondaryAuthentication, Tally::default())
        .await?;
    let addr = server.local_addr()?;
    let supervisor = server.supervisor();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let upend = tokio::spawn(server.run_until(async {
        let _ = stop_rx.await;
    }));
    tracing::info!(%addr, "upend listening");

    let watcher = LogStates::default();
    let connector = DownendConnector::new(
        WebSocketDialer::new(format!("ws://{addr}")),
        FixedSignon::new(Credential::new("demo", "demo")),
        DownendConfig::default(),
    )
    .with_watcher(watcher.clone());
    connector.start()?.await?;

    for (name, text) in [("first", "hello"), ("second", "again"), ("third", "and again")] {
        connector.send(text.as_bytes().to_vec(), Arc::new(LogOutcome(name)))?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    let kicked = supervisor.kickout_all("demo rotation").await?;
    tracing::info!(kicked, "kicked the downend out");
    tokio::time::timeout(Duration::from_secs(10), wait_for_signons(&watcher, 2)).await?;

    connector.send(b"back".to_vec(), Arc::new(LogOutcome("fourth")))?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    connector.stop()?.await;
    let _ = stop_tx.send(());
    upend.await??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(login: &str) -> SessionContext {
        SessionContext {
            session_id: SessionIdentifier::new("s1"),
            login: login.into(),
        }
    }

    #[tokio::test]
    async fn test_tally_counts_per_login() {
        let tally = Tally::default();
        tally.handle(Some(&context("ann")), b"a".to_vec()).await;
        let outcome = tally.handle(Some(&context("ann")), b"b".to_vec()).await;
        assert_eq!(
            outcome,
            CommandOutcome::Succeeded {
                payload: b"ann #2: b".to_vec()
            }
        );

        let other = tally.handle(Some(&context("ben")), b"c".to_vec()).await;
        assert_eq!(
            other,
            CommandOutcome::Succeeded {
                payload: b"ben #1: c".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_tally_anonymous_fails() {
        let outcome = Tally::default().handle(None, b"x".to_vec()).await;
        assert!(outcome.is_failure());
    }

    #[tokio::test]
    async fn test_demo_users_rejects_wrong_password() {
        let result = DemoUsers
            .check_credential(&Credential::new("demo", "nope"))
            .await;
        assert_eq!(result, Err(SignonFailure::InvalidCredential));
    }
}
