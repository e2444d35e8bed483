//! The session book: every session the Upend knows, keyed by identifier.
//!
//! ```text
//!                create            activate
//!   (absent) ──────────→ Pending ──────────→ Active ←─────────┐
//!                                              │ channel      │ activate
//!                                              ↓ closed       │
//!                         sweep ←──────── Orphaned ──────→ Reusing
//!                       (removed)                 reuse
//! ```
//!
//! A second index maps channels to sessions so a closed connection can
//! be resolved in O(1). The book is plain data: the supervisor owns it
//! and serializes every call, so nothing here locks.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tether_protocol::SessionIdentifier;
use tether_transport::ConnectionId;
use tokio::time::Instant;

use crate::SessionError;

/// The channel a session is (or is becoming) attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBinding {
    pub channel: ConnectionId,
    pub remote_address: Option<SocketAddr>,
}

impl ChannelBinding {
    pub fn new(channel: ConnectionId, remote_address: Option<SocketAddr>) -> Self {
        Self {
            channel,
            remote_address,
        }
    }
}

/// Lifecycle state of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Created, waiting for the authority to confirm registration.
    Pending { binding: ChannelBinding },
    /// Bound to a live channel.
    Active { binding: ChannelBinding },
    /// Its channel closed; waits for a reuse or the sweeper.
    Orphaned {
        remote_address: Option<SocketAddr>,
        inactive_since: Instant,
    },
    /// A new channel is resigning on; re-registration in progress.
    Reusing { binding: ChannelBinding },
}

impl SessionState {
    /// The channel the session is bound to, if any.
    pub fn channel(&self) -> Option<ConnectionId> {
        match self {
            Self::Pending { binding } | Self::Active { binding } | Self::Reusing { binding } => {
                Some(binding.channel)
            }
            Self::Orphaned { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "Pending",
            Self::Active { .. } => "Active",
            Self::Orphaned { .. } => "Orphaned",
            Self::Reusing { .. } => "Reusing",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One logical session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionIdentifier,
    /// Login of the user who owns it.
    pub user: String,
    pub created_at: Instant,
    pub state: SessionState,
}

/// Sessions by identifier, plus the channel index.
#[derive(Debug, Default)]
pub struct SessionBook {
    sessions: HashMap<SessionIdentifier, Session>,
    channels: HashMap<ConnectionId, SessionIdentifier>,
}

impl SessionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `Pending` session bound to `binding`.
    pub fn create(
        &mut self,
        id: SessionIdentifier,
        user: impl Into<String>,
        binding: ChannelBinding,
        now: Instant,
    ) -> Result<&Session, SessionError> {
        if self.sessions.contains_key(&id) {
            return Err(SessionError::SessionAlreadyExists(id));
        }
        if self.channels.contains_key(&binding.channel) {
            return Err(SessionError::ChannelInUse(binding.channel));
        }

        self.channels.insert(binding.channel, id.clone());
        let session = Session {
            id: id.clone(),
            user: user.into(),
            created_at: now,
            state: SessionState::Pending { binding },
        };
        Ok(self.sessions.entry(id).or_insert(session))
    }

    /// Moves an `Orphaned` session to `Reusing` on a new channel and
    /// returns its user.
    pub fn reuse(
        &mut self,
        id: &SessionIdentifier,
        binding: ChannelBinding,
    ) -> Result<String, SessionError> {
        if self.channels.contains_key(&binding.channel) {
            return Err(SessionError::ChannelInUse(binding.channel));
        }
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession(id.clone()))?;

        match session.state {
            SessionState::Orphaned { .. } => {
                session.state = SessionState::Reusing { binding };
                self.channels.insert(binding.channel, id.clone());
                Ok(session.user.clone())
            }
            _ => Err(SessionError::SessionAlreadyActive(id.clone())),
        }
    }

    /// Completes a `Pending` or `Reusing` session on `channel`.
    pub fn activate(
        &mut self,
        id: &SessionIdentifier,
        channel: ConnectionId,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::UnknownSession(id.clone()))?;

        match session.state {
            SessionState::Pending { binding } | SessionState::Reusing { binding }
                if binding.channel == channel =>
            {
                session.state = SessionState::Active { binding };
                Ok(())
            }
            ref other => Err(SessionError::InvalidTransition {
                id: id.clone(),
                state: other.name(),
            }),
        }
    }

    /// Orphans the `Active` session on `channel`, returning its id.
    ///
    /// Channels without a session, or whose session is still binding,
    /// are left alone.
    pub fn remove_channel(
        &mut self,
        channel: ConnectionId,
        now: Instant,
    ) -> Option<SessionIdentifier> {
        let id = self.channels.get(&channel)?;
        let session = self.sessions.get_mut(id)?;
        let SessionState::Active { binding } = session.state else {
            return None;
        };

        session.state = SessionState::Orphaned {
            remote_address: binding.remote_address,
            inactive_since: now,
        };
        self.channels.remove(&channel)
    }

    /// Returns a `Reusing` session to `Orphaned` after a failed resignon.
    pub fn revert_reuse(&mut self, id: &SessionIdentifier, now: Instant) -> bool {
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        let SessionState::Reusing { binding } = session.state else {
            return false;
        };

        session.state = SessionState::Orphaned {
            remote_address: binding.remote_address,
            inactive_since: now,
        };
        self.channels.remove(&binding.channel);
        true
    }

    /// Drops a session in any state.
    pub fn remove(&mut self, id: &SessionIdentifier) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        if let Some(channel) = session.state.channel() {
            self.channels.remove(&channel);
        }
        Some(session)
    }

    /// Removes every `Orphaned` session inactive for longer than
    /// `maximum_inactivity`.
    pub fn sweep(&mut self, now: Instant, maximum_inactivity: Duration) -> Vec<Session> {
        let expired: Vec<SessionIdentifier> = self
            .sessions
            .values()
            .filter(|session| match session.state {
                SessionState::Orphaned { inactive_since, .. } => {
                    now.saturating_duration_since(inactive_since) > maximum_inactivity
                }
                _ => false,
            })
            .map(|session| session.id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.remove(id))
            .collect()
    }

    pub fn get(&self, id: &SessionIdentifier) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// The session bound to `channel`, whatever its state.
    pub fn by_channel(&self, channel: ConnectionId) -> Option<&Session> {
        self.channels
            .get(&channel)
            .and_then(|id| self.sessions.get(id))
    }

    pub fn ids(&self) -> Vec<SessionIdentifier> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(raw: &str) -> SessionIdentifier {
        SessionIdentifier::new(raw)
    }

    fn binding(channel: u64) -> ChannelBinding {
        ChannelBinding::new(ConnectionId::new(channel), None)
    }

    /// A book holding one `Active` session "s1" on channel 1.
    fn book_with_active(now: Instant) -> SessionBook {
        let mut book = SessionBook::new();
        book.create(sid("s1"), "alice", binding(1), now).unwrap();
        book.activate(&sid("s1"), ConnectionId::new(1)).unwrap();
        book
    }

    // =========================================================================
    // create / activate
    // =========================================================================

    #[test]
    fn test_create_starts_pending_then_activates() {
        let now = Instant::now();
        let mut book = SessionBook::new();

        let session = book.create(sid("s1"), "alice", binding(1), now).unwrap();
        assert_eq!(session.state.name(), "Pending");
        assert_eq!(session.user, "alice");

        book.activate(&sid("s1"), ConnectionId::new(1)).unwrap();
        assert!(book.get(&sid("s1")).unwrap().state.is_active());
    }

    #[test]
    fn test_create_duplicate_id_fails() {
        let now = Instant::now();
        let mut book = SessionBook::new();
        book.create(sid("s1"), "alice", binding(1), now).unwrap();

        let result = book.create(sid("s1"), "bob", binding(2), now);
        assert!(matches!(result, Err(SessionError::SessionAlreadyExists(_))));
    }

    #[test]
    fn test_create_on_bound_channel_fails() {
        let now = Instant::now();
        let mut book = book_with_active(now);

        let result = book.create(sid("s2"), "bob", binding(1), now);
        assert!(matches!(result, Err(SessionError::ChannelInUse(_))));
    }

    #[test]
    fn test_activate_on_wrong_channel_is_invalid() {
        let now = Instant::now();
        let mut book = SessionBook::new();
        book.create(sid("s1"), "alice", binding(1), now).unwrap();

        let result = book.activate(&sid("s1"), ConnectionId::new(9));
        assert!(matches!(
            result,
            Err(SessionError::InvalidTransition { state: "Pending", .. })
        ));
    }

    // =========================================================================
    // reuse
    // =========================================================================

    #[test]
    fn test_reuse_unknown_session_fails() {
        let mut book = SessionBook::new();
        let result = book.reuse(&sid("nope"), binding(1));
        assert!(matches!(result, Err(SessionError::UnknownSession(_))));
    }

    #[test]
    fn test_reuse_active_session_fails() {
        let now = Instant::now();
        let mut book = book_with_active(now);

        let result = book.reuse(&sid("s1"), binding(2));
        assert!(matches!(result, Err(SessionError::SessionAlreadyActive(_))));
    }

    #[test]
    fn test_reuse_orphaned_goes_through_reusing_to_active() {
        let now = Instant::now();
        let mut book = book_with_active(now);
        assert_eq!(book.remove_channel(ConnectionId::new(1), now), Some(sid("s1")));

        let user = book.reuse(&sid("s1"), binding(2)).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(book.get(&sid("s1")).unwrap().state.name(), "Reusing");

        book.activate(&sid("s1"), ConnectionId::new(2)).unwrap();
        let session = book.get(&sid("s1")).unwrap();
        assert!(session.state.is_active());
        assert_eq!(session.state.channel(), Some(ConnectionId::new(2)));
    }

    #[test]
    fn test_reuse_twice_second_is_already_active() {
        let now = Instant::now();
        let mut book = book_with_active(now);
        book.remove_channel(ConnectionId::new(1), now);

        book.reuse(&sid("s1"), binding(2)).unwrap();
        let result = book.reuse(&sid("s1"), binding(3));
        assert!(matches!(result, Err(SessionError::SessionAlreadyActive(_))));
    }

    #[test]
    fn test_revert_reuse_returns_to_orphaned_and_frees_channel() {
        let now = Instant::now();
        let mut book = book_with_active(now);
        book.remove_channel(ConnectionId::new(1), now);
        book.reuse(&sid("s1"), binding(2)).unwrap();

        assert!(book.revert_reuse(&sid("s1"), now));
        assert_eq!(book.get(&sid("s1")).unwrap().state.name(), "Orphaned");
        assert!(book.by_channel(ConnectionId::new(2)).is_none());
    }

    // =========================================================================
    // remove_channel
    // =========================================================================

    #[test]
    fn test_remove_channel_orphans_active_session() {
        let now = Instant::now();
        let mut book = book_with_active(now);

        assert_eq!(book.remove_channel(ConnectionId::new(1), now), Some(sid("s1")));
        match book.get(&sid("s1")).unwrap().state {
            SessionState::Orphaned { inactive_since, .. } => assert_eq!(inactive_since, now),
            ref other => panic!("expected Orphaned, got {other}"),
        }
        assert!(book.by_channel(ConnectionId::new(1)).is_none());
    }

    #[test]
    fn test_remove_channel_ignores_pending_and_unknown() {
        let now = Instant::now();
        let mut book = SessionBook::new();
        book.create(sid("s1"), "alice", binding(1), now).unwrap();

        assert_eq!(book.remove_channel(ConnectionId::new(1), now), None);
        assert_eq!(book.remove_channel(ConnectionId::new(42), now), None);
        assert_eq!(book.get(&sid("s1")).unwrap().state.name(), "Pending");
    }

    // =========================================================================
    // sweep / remove
    // =========================================================================

    #[test]
    fn test_sweep_removes_only_long_orphaned() {
        let start = Instant::now();
        let mut book = book_with_active(start);
        book.create(sid("s2"), "bob", binding(2), start).unwrap();
        book.activate(&sid("s2"), ConnectionId::new(2)).unwrap();
        book.remove_channel(ConnectionId::new(1), start);

        let limit = Duration::from_secs(60);

        // Exactly at the limit is not yet "exceeded".
        assert!(book.sweep(start + limit, limit).is_empty());

        let swept = book.sweep(start + limit + Duration::from_millis(1), limit);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, sid("s1"));
        assert!(book.get(&sid("s1")).is_none());
        assert!(book.get(&sid("s2")).is_some());
    }

    #[test]
    fn test_remove_clears_channel_index() {
        let now = Instant::now();
        let mut book = book_with_active(now);

        let removed = book.remove(&sid("s1")).unwrap();
        assert_eq!(removed.user, "alice");
        assert!(book.by_channel(ConnectionId::new(1)).is_none());
        assert!(book.is_empty());
    }
}
