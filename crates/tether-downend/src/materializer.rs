//! The user-facing side of signon: prompts and messages.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tether_protocol::{Credential, SecondaryCode, SignonFailureNotice};

/// Shows signon prompts and messages on the connector's behalf.
///
/// Prompts return `None` when the user gives up, which stops the
/// connector. So does [`wait_for_cancellation`](Self::wait_for_cancellation)
/// completing while a prompt is open. The connector keeps pinging while a
/// prompt waits, so a slow user does not cost the connection.
pub trait SignonMaterializer: Send + Sync + 'static {
    fn read_credential(&self) -> impl Future<Output = Option<Credential>> + Send;

    fn read_secondary_code(
        &self,
        user: &str,
    ) -> impl Future<Output = Option<SecondaryCode>> + Send;

    /// What the connector is doing right now; `None` clears it.
    fn set_progress_message(&self, _message: Option<&str>) {}

    /// Why the last attempt failed; `None` clears it.
    fn set_problem_message(&self, _notice: Option<&SignonFailureNotice>) {}

    /// Signon finished or the connector stopped; close any prompt.
    fn done(&self) {}

    /// Completes when the user cancels signon. Never completes by default.
    fn wait_for_cancellation(&self) -> impl Future<Output = ()> + Send {
        std::future::pending()
    }
}

/// Answers every prompt with the same credential and code.
///
/// For services and tests where nobody sits in front of a prompt. Once the
/// Upend refused its answers it gives up (prompts return `None`) instead
/// of retrying the same refused values forever.
#[derive(Debug)]
pub struct FixedSignon {
    credential: Credential,
    secondary_code: Option<SecondaryCode>,
    refused: AtomicBool,
}

impl FixedSignon {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            secondary_code: None,
            refused: AtomicBool::new(false),
        }
    }

    pub fn with_secondary_code(mut self, code: SecondaryCode) -> Self {
        self.secondary_code = Some(code);
        self
    }
}

impl SignonMaterializer for FixedSignon {
    async fn read_credential(&self) -> Option<Credential> {
        if self.refused.load(Ordering::Acquire) {
            return None;
        }
        Some(self.credential.clone())
    }

    async fn read_secondary_code(&self, _user: &str) -> Option<SecondaryCode> {
        if self.refused.load(Ordering::Acquire) {
            return None;
        }
        self.secondary_code.clone()
    }

    fn set_problem_message(&self, notice: Option<&SignonFailureNotice>) {
        if let Some(notice) = notice {
            tracing::warn!(%notice, "fixed signon refused");
        }
        self.refused.store(notice.is_some(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use tether_protocol::SignonFailure;

    use super::*;

    #[tokio::test]
    async fn test_fixed_signon_gives_up_after_refusal() {
        let signon = FixedSignon::new(Credential::new("alice", "secret"))
            .with_secondary_code(SecondaryCode::new("1234"));
        assert!(signon.read_credential().await.is_some());
        assert!(signon.read_secondary_code("alice").await.is_some());

        signon.set_problem_message(Some(&SignonFailure::InvalidCredential.into()));
        assert!(signon.read_credential().await.is_none());

        signon.set_problem_message(None);
        assert!(signon.read_credential().await.is_some());
    }
}
