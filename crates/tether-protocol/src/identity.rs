//! Identity and signon types shared by both endpoints.
//!
//! Most of these are newtype wrappers around `String`, serialized with
//! `#[serde(transparent)]` so `SessionIdentifier("ab12")` is just `"ab12"`
//! on the wire. Secrets ([`Credential`], [`SecondaryCode`]) get a
//! redacting `Debug` so they never end up in a log line.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Session identity
// ---------------------------------------------------------------------------

/// Opaque token naming one logical session on the Upend.
///
/// Generated once at session creation and never reused while any session
/// references it. The Downend stores it to resign on after a reconnect.
///
/// Whoever holds the token can resign on, so `Display` and `Debug` only
/// show its first characters; use [`as_str`](Self::as_str) for the raw value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionIdentifier(String);

impl SessionIdentifier {
    /// Wraps a raw token.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Characters of a session token that may appear in logs.
const SESSION_PREFIX_SHOWN: usize = 4;

impl SessionIdentifier {
    fn shown(&self) -> &str {
        match self.0.char_indices().nth(SESSION_PREFIX_SHOWN) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl fmt::Display for SessionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}***", self.shown())
    }
}

impl fmt::Debug for SessionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionIdentifier({}***)", self.shown())
    }
}

/// Ties a pending secondary (out-of-band) challenge to a user.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SecondaryToken(String);

impl SecondaryToken {
    /// Wraps a raw token.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SecondaryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The value a user typed in answer to a secondary challenge.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecondaryCode(String);

impl SecondaryCode {
    /// Wraps a user-entered code.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw code.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the user submitted nothing (whitespace only counts as nothing).
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SecondaryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecondaryCode(***)")
    }
}

/// Login and password for primary signon.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub login: String,
    pub password: String,
}

impl Credential {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CommandTag
// ---------------------------------------------------------------------------

/// Correlates a command with its eventual outcome.
///
/// A prefix chosen per connector instance plus a monotonic counter, so
/// tags are unique within one connector's lifetime. Written on the wire
/// as `"{prefix}-{counter}"`; the prefix itself may contain dashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CommandTag {
    prefix: String,
    counter: u64,
}

impl CommandTag {
    pub fn new(prefix: impl Into<String>, counter: u64) -> Self {
        Self {
            prefix: prefix.into(),
            counter,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.prefix, self.counter)
    }
}

impl From<CommandTag> for String {
    fn from(tag: CommandTag) -> Self {
        tag.to_string()
    }
}

impl TryFrom<String> for CommandTag {
    type Error = ProtocolError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        let (prefix, counter) = raw.rsplit_once('-').ok_or_else(|| {
            ProtocolError::InvalidMessage(format!("malformed command tag {raw:?}"))
        })?;
        let counter = counter.parse().map_err(|_| {
            ProtocolError::InvalidMessage(format!(
                "command tag {raw:?} has a non-numeric counter"
            ))
        })?;
        Ok(Self::new(prefix, counter))
    }
}

// ---------------------------------------------------------------------------
// Signon failures
// ---------------------------------------------------------------------------

/// Why the out-of-band secondary authentication did not complete.
///
/// These are expected operational outcomes (the user didn't pick up the
/// phone), not bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecondaryAuthFailure {
    Busy,
    NoAnswer,
    Cancelled,
    SystemError,
}

impl fmt::Display for SecondaryAuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Busy => "line busy",
            Self::NoAnswer => "no answer",
            Self::Cancelled => "cancelled",
            Self::SystemError => "system error",
        })
    }
}

/// Recoverable, user-facing reasons a signon or resignon failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignonFailure {
    InvalidCredential,
    MissingSecondaryCode,
    InvalidSecondaryCode,
    UnknownSession,
    UnknownSecondaryToken,
    SessionAlreadyExists,
    SessionAlreadyActive,
    /// The login reached its failed-signon limit.
    Locked,
    /// The out-of-band provider reported a problem.
    SecondaryAuthentication(SecondaryAuthFailure),
    InternalError,
}

impl SignonFailure {
    /// A default human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Self::InvalidCredential => "invalid login or password".into(),
            Self::MissingSecondaryCode => "no secondary code entered".into(),
            Self::InvalidSecondaryCode => "invalid secondary code".into(),
            Self::UnknownSession => "unknown session".into(),
            Self::UnknownSecondaryToken => {
                "secondary challenge unknown or expired".into()
            }
            Self::SessionAlreadyExists => "session already exists".into(),
            Self::SessionAlreadyActive => {
                "session already active on another connection".into()
            }
            Self::Locked => "too many failed signon attempts".into(),
            Self::SecondaryAuthentication(cause) => {
                format!("secondary authentication failed: {cause}")
            }
            Self::InternalError => "internal error".into(),
        }
    }
}

/// A signon failure plus the message the user should see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignonFailureNotice {
    pub failure: SignonFailure,
    pub message: String,
}

impl SignonFailureNotice {
    pub fn new(failure: SignonFailure, message: impl Into<String>) -> Self {
        Self {
            failure,
            message: message.into(),
        }
    }
}

impl From<SignonFailure> for SignonFailureNotice {
    fn from(failure: SignonFailure) -> Self {
        Self::new(failure, failure.describe())
    }
}

impl fmt::Display for SignonFailureNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.failure, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_tag_display_joins_prefix_and_counter() {
        assert_eq!(CommandTag::new("dn", 12).to_string(), "dn-12");
    }

    #[test]
    fn test_command_tag_parse_keeps_dashes_in_prefix() {
        let tag = CommandTag::try_from("a-b-7".to_string()).unwrap();
        assert_eq!(tag.prefix(), "a-b");
        assert_eq!(tag.counter(), 7);
    }

    #[test]
    fn test_command_tag_parse_rejects_missing_counter() {
        assert!(CommandTag::try_from("nodash".to_string()).is_err());
        assert!(CommandTag::try_from("x-y".to_string()).is_err());
    }

    #[test]
    fn test_session_identifier_display_hides_token_tail() {
        let id = SessionIdentifier::new("ab12cd34ef56");
        assert_eq!(id.to_string(), "S-ab12***");
        assert_eq!(format!("{id:?}"), "SessionIdentifier(ab12***)");
        assert!(!id.to_string().contains("cd34"));
        assert_eq!(id.as_str(), "ab12cd34ef56");
    }

    #[test]
    fn test_session_identifier_display_short_token() {
        assert_eq!(SessionIdentifier::new("ab").to_string(), "S-ab***");
    }

    #[test]
    fn test_credential_debug_hides_password() {
        let credential = Credential::new("alice", "hunter2");
        let printed = format!("{credential:?}");
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_secondary_code_blank_detection() {
        assert!(SecondaryCode::new("  ").is_blank());
        assert!(!SecondaryCode::new("1234").is_blank());
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_signon_failure_wire_names() {
        let json = serde_json::to_string(&SignonFailure::UnknownSecondaryToken)
            .unwrap();
        assert_eq!(json, "\"UNKNOWN_SECONDARY_TOKEN\"");

        let nested = serde_json::to_string(&SignonFailure::SecondaryAuthentication(
            SecondaryAuthFailure::NoAnswer,
        ))
        .unwrap();
        assert_eq!(nested, r#"{"SECONDARY_AUTHENTICATION":"NO_ANSWER"}"#);
    }

    #[test]
    fn test_notice_from_failure_uses_description() {
        let notice = SignonFailureNotice::from(SignonFailure::Locked);
        assert_eq!(notice.message, "too many failed signon attempts");
    }
}
