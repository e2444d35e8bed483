//! The application hook for commands.

use std::future::Future;

use tether_protocol::{CommandOutcome, SessionIdentifier};

/// Who sent a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: SessionIdentifier,
    pub login: String,
}

/// Executes application commands on the Upend.
///
/// `session` is `None` only when the server does not require
/// authentication and the Downend never signed on. The outcome goes back
/// to the Downend under the command's tag.
///
/// ```rust
/// use tether::{CommandHandler, SessionContext};
/// use tether_protocol::CommandOutcome;
///
/// struct Echo;
///
/// impl CommandHandler for Echo {
///     async fn handle(&self, _session: Option<&SessionContext>, payload: Vec<u8>) -> CommandOutcome {
///         CommandOutcome::Succeeded { payload }
///     }
/// }
/// ```
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(
        &self,
        session: Option<&SessionContext>,
        payload: Vec<u8>,
    ) -> impl Future<Output = CommandOutcome> + Send;
}
