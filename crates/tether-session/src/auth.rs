//! Hooks into the systems that actually know users.
//!
//! Tether doesn't store passwords or send SMS codes itself. The
//! supervisor asks three collaborators instead:
//!
//! - [`SessionAuthority`]: checks credentials, records which sessions
//!   exist and forgets them on signout.
//! - [`SecondaryAuthenticator`]: the out-of-band provider (SMS, phone
//!   call) that issues a token and later verifies the code the user typed.
//! - [`ChannelCloser`]: closes a connection when its session is kicked
//!   out. The server implements this; the supervisor never touches
//!   transports directly.
//!
//! Every async method returns `impl Future + Send` so the supervisor can
//! run calls on spawned tasks while it keeps serving other requests.

use std::future::Future;

use tether_protocol::{
    Credential, SecondaryAuthFailure, SecondaryCode, SecondaryToken, SessionIdentifier,
    SignonFailure,
};
use tether_transport::ConnectionId;

/// What the authority knows about a user after a successful credential
/// check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub login: String,
    /// Where secondary codes go. `None` skips secondary authentication.
    pub phone_number: Option<String>,
}

impl UserProfile {
    pub fn new(login: impl Into<String>, phone_number: Option<String>) -> Self {
        Self {
            login: login.into(),
            phone_number,
        }
    }
}

/// Errors reported by a [`SessionAuthority`] outside credential checks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorityError {
    /// The session is already registered. Registration is idempotent, so
    /// the supervisor treats this as success.
    #[error("session {0} is already registered")]
    AlreadyRegistered(SessionIdentifier),

    #[error("session authority unavailable: {0}")]
    Unavailable(String),
}

/// The system of record for users and sessions.
///
/// # Example
///
/// ```rust
/// use std::collections::HashMap;
/// use tether_protocol::{Credential, SessionIdentifier, SignonFailure};
/// use tether_session::{AuthorityError, SessionAuthority, UserProfile};
///
/// /// Fixed users, no phone numbers, sessions not persisted.
/// struct FixedUsers(HashMap<String, String>);
///
/// impl SessionAuthority for FixedUsers {
///     async fn check_credential(
///         &self,
///         credential: &Credential,
///     ) -> Result<UserProfile, SignonFailure> {
///         match self.0.get(&credential.login) {
///             Some(password) if *password == credential.password => {
///                 Ok(UserProfile::new(credential.login.clone(), None))
///             }
///             _ => Err(SignonFailure::InvalidCredential),
///         }
///     }
///
///     async fn register_session(
///         &self,
///         _id: &SessionIdentifier,
///         _login: &str,
///     ) -> Result<(), AuthorityError> {
///         Ok(())
///     }
///
///     async fn signout(&self, _id: &SessionIdentifier) -> Result<(), AuthorityError> {
///         Ok(())
///     }
///
///     async fn reset_signon_failures(&self, _login: &str) -> Result<(), AuthorityError> {
///         Ok(())
///     }
/// }
/// ```
pub trait SessionAuthority: Send + Sync + 'static {
    /// Checks a login/password pair.
    ///
    /// Return `Err(SignonFailure::InvalidCredential)` for a wrong pair;
    /// other failures are passed to the client unchanged.
    fn check_credential(
        &self,
        credential: &Credential,
    ) -> impl Future<Output = Result<UserProfile, SignonFailure>> + Send;

    /// Records a new (or resumed) session for `login`.
    ///
    /// Called again on every resignon; answer
    /// [`AuthorityError::AlreadyRegistered`] or `Ok` for a repeat.
    fn register_session(
        &self,
        id: &SessionIdentifier,
        login: &str,
    ) -> impl Future<Output = Result<(), AuthorityError>> + Send;

    /// Forgets a session that was signed out, kicked or expired.
    fn signout(
        &self,
        id: &SessionIdentifier,
    ) -> impl Future<Output = Result<(), AuthorityError>> + Send;

    /// Clears any failure bookkeeping the authority keeps for `login`.
    fn reset_signon_failures(
        &self,
        login: &str,
    ) -> impl Future<Output = Result<(), AuthorityError>> + Send;
}

/// An out-of-band verification provider.
pub trait SecondaryAuthenticator: Send + Sync + 'static {
    /// Sends a code to `phone_number` and returns the token that ties the
    /// challenge to the later answer.
    fn request_authentication(
        &self,
        phone_number: &str,
    ) -> impl Future<Output = Result<SecondaryToken, SecondaryAuthFailure>> + Send;

    /// `Ok(true)` if `code` answers the challenge named by `token`,
    /// `Ok(false)` if it doesn't.
    fn verify_secondary_code(
        &self,
        token: &SecondaryToken,
        code: &SecondaryCode,
    ) -> impl Future<Output = Result<bool, SecondaryAuthFailure>> + Send;
}

/// For deployments whose users never have phone numbers.
///
/// Any attempt to use it reports a provider system error.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecondaryAuthentication;

impl SecondaryAuthenticator for NoSecondaryAuthentication {
    async fn request_authentication(
        &self,
        _phone_number: &str,
    ) -> Result<SecondaryToken, SecondaryAuthFailure> {
        tracing::warn!("secondary authentication requested but none is configured");
        Err(SecondaryAuthFailure::SystemError)
    }

    async fn verify_secondary_code(
        &self,
        _token: &SecondaryToken,
        _code: &SecondaryCode,
    ) -> Result<bool, SecondaryAuthFailure> {
        Err(SecondaryAuthFailure::SystemError)
    }
}

/// Closes connections on the supervisor's behalf.
///
/// Must not block: implementations signal the connection's task and
/// return.
pub trait ChannelCloser: Send + Sync + 'static {
    fn close(&self, channel: ConnectionId, reason: &str);
}
