//! Upend session authority for Tether.
//!
//! This crate decides which logical session belongs to which live
//! connection:
//!
//! 1. **Identity**: [`TabooGenerator`] hands out session identifiers that
//!    never repeat a recent one.
//! 2. **State**: [`SessionBook`] holds every session and its
//!    Pending → Active → Orphaned → Reusing lifecycle.
//! 3. **Lockout**: [`FailedSignonCounter`] counts failed attempts per login.
//! 4. **Orchestration**: [`SessionSupervisor`] runs primary/secondary
//!    signon, resignon, kickout and inactivity sweeps on a single task,
//!    talking to your [`SessionAuthority`] and [`SecondaryAuthenticator`].
//!
//! # How it fits in the stack
//!
//! ```text
//! Server (above)  ← one handler per connection, asks the supervisor
//!     ↕
//! Session Layer (this crate)  ← owns the session book
//!     ↕
//! Protocol Layer (below)  ← SessionIdentifier, SignonFailure, ...
//! ```

mod auth;
mod book;
mod config;
mod counter;
mod error;
mod supervisor;
mod taboo;

pub use auth::{
    AuthorityError, ChannelCloser, NoSecondaryAuthentication, SecondaryAuthenticator,
    SessionAuthority, UserProfile,
};
pub use book::{ChannelBinding, Session, SessionBook, SessionState};
pub use config::SupervisorConfig;
pub use counter::{DEFAULT_FAILED_SIGNON_LIMIT, FailedSignonCounter, SignonAttempt};
pub use error::SessionError;
pub use supervisor::{PrimarySignonOutcome, SessionSupervisor};
pub use taboo::{TabooGenerator, session_identifiers};
