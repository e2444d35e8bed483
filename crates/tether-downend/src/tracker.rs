//! Client-side correlation of commands with their outcomes.
//!
//! Every command the Downend sends gets a [`CommandTag`] and a
//! [`Tracker`]. The [`TrackerCurator`] keeps `tag → (tracker, expiry)`
//! and guarantees each tracker hears exactly one terminal notification:
//! its outcome, or a timeout.
//!
//! It also folds the whole table into one [`CommandInFlightStatus`] and
//! tells an observer whenever that status actually changes:
//!
//! ```text
//!   Quiet ──add──→ InFlight ──last one resolved──→ Quiet
//!                     │
//!                     └─failed outcome──→ SomeCommandFailed ──table empty──→ Quiet
//! ```
//!
//! The curator is shared between caller threads (which add trackers) and
//! the connector task (which resolves them), so one mutex guards the
//! table. Callbacks always run after that mutex is released.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tether_protocol::{CommandOutcome, CommandTag};
use tokio::time::Instant;

/// Observes the lifecycle of one command.
///
/// All methods default to doing nothing. `after_timeout` and
/// `on_outcome` are terminal: at most one of them is called, once.
pub trait Tracker: Send + Sync + 'static {
    /// The connection dropped while the command was in flight.
    fn on_connection_lost(&self) {}

    /// A connection came back after a loss.
    fn on_connection_restored(&self) {}

    /// No outcome arrived within the tracker lifetime.
    fn after_timeout(&self) {}

    /// The Upend reported the command's outcome.
    fn on_outcome(&self, _outcome: &CommandOutcome) {}
}

/// Aggregate state of every tracked command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandInFlightStatus {
    Quiet,
    InFlight,
    SomeCommandFailed,
}

type StatusObserver = Arc<dyn Fn(CommandInFlightStatus) + Send + Sync>;

struct Entry {
    tag: CommandTag,
    tracker: Arc<dyn Tracker>,
    expiry: Instant,
}

struct Table {
    /// Keyed by tag counter, so iteration follows insertion order.
    entries: BTreeMap<u64, Entry>,
    status: CommandInFlightStatus,
    connected: bool,
    ever_connected: bool,
}

impl Table {
    /// Moves to `next`, recording it in `changes` only if it differs.
    fn move_to(&mut self, next: CommandInFlightStatus, changes: &mut Vec<CommandInFlightStatus>) {
        if self.status != next {
            self.status = next;
            changes.push(next);
        }
    }

    fn take(
        &mut self,
        counter: u64,
        with_error: bool,
        changes: &mut Vec<CommandInFlightStatus>,
    ) -> Option<Entry> {
        let entry = self.entries.remove(&counter)?;
        if with_error {
            self.move_to(CommandInFlightStatus::SomeCommandFailed, changes);
        }
        if self.entries.is_empty() {
            self.move_to(CommandInFlightStatus::Quiet, changes);
        }
        Some(entry)
    }
}

struct Inner {
    prefix: String,
    lifetime: Duration,
    next_counter: AtomicU64,
    table: Mutex<Table>,
    observer: Mutex<Option<StatusObserver>>,
}

/// Shared table of in-flight commands. Cloning shares the table.
#[derive(Clone)]
pub struct TrackerCurator {
    inner: Arc<Inner>,
}

impl TrackerCurator {
    /// `prefix` starts every tag this curator allocates; `lifetime` is how
    /// long a tracker waits for its outcome.
    pub fn new(prefix: impl Into<String>, lifetime: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                prefix: prefix.into(),
                lifetime,
                next_counter: AtomicU64::new(1),
                table: Mutex::new(Table {
                    entries: BTreeMap::new(),
                    status: CommandInFlightStatus::Quiet,
                    connected: false,
                    ever_connected: false,
                }),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Installs the single status observer, replacing any previous one.
    pub fn set_observer(&self, observer: impl Fn(CommandInFlightStatus) + Send + Sync + 'static) {
        *lock(&self.inner.observer) = Some(Arc::new(observer));
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn status(&self) -> CommandInFlightStatus {
        lock(&self.inner.table).status
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Starts tracking a command and returns its freshly allocated tag.
    pub fn add(&self, tracker: Arc<dyn Tracker>) -> CommandTag {
        let counter = self.inner.next_counter.fetch_add(1, Ordering::Relaxed);
        let tag = CommandTag::new(self.inner.prefix.clone(), counter);
        let mut changes = Vec::new();
        {
            let mut table = lock(&self.inner.table);
            if table.entries.is_empty() {
                table.move_to(CommandInFlightStatus::InFlight, &mut changes);
            }
            table.entries.insert(
                counter,
                Entry {
                    tag: tag.clone(),
                    tracker,
                    expiry: Instant::now() + self.inner.lifetime,
                },
            );
        }
        self.publish(changes);
        tag
    }

    /// A self-removing handle for `tag`, or `None` when the tag is unknown,
    /// already resolved or was allocated by another curator.
    pub fn get(&self, tag: &CommandTag) -> Option<TrackerHandle> {
        if tag.prefix() != self.inner.prefix {
            return None;
        }
        let tracker = {
            let table = lock(&self.inner.table);
            Arc::clone(&table.entries.get(&tag.counter())?.tracker)
        };
        Some(TrackerHandle {
            tag: tag.clone(),
            tracker,
            curator: self.clone(),
        })
    }

    /// Delivers `outcome` to the tracker for `tag`. Returns whether a
    /// tracker was still waiting for it.
    pub fn resolve(&self, tag: &CommandTag, outcome: &CommandOutcome) -> bool {
        match self.get(tag) {
            Some(handle) => handle.resolve(outcome),
            None => false,
        }
    }

    /// Drops a tracker without notifying it, e.g. when its command could
    /// not even be queued.
    pub fn discard(&self, tag: &CommandTag) -> bool {
        self.remove(tag, false).is_some()
    }

    /// Marks the connection as up. Trackers hear `on_connection_restored`
    /// unless this is the first connection ever.
    pub fn notify_reconnection(&self) {
        let restored = {
            let mut table = lock(&self.inner.table);
            table.connected = true;
            let first = !table.ever_connected;
            table.ever_connected = true;
            if first {
                Vec::new()
            } else {
                table.trackers()
            }
        };
        for tracker in restored {
            tracker.on_connection_restored();
        }
    }

    /// Marks the connection as down. Trackers hear `on_connection_lost`
    /// and stay tracked.
    pub fn notify_connection_broken(&self) {
        let lost = {
            let mut table = lock(&self.inner.table);
            table.connected = false;
            table.trackers()
        };
        for tracker in lost {
            tracker.on_connection_lost();
        }
    }

    /// Times out every tracker whose expiry is at or before `now`.
    ///
    /// Does nothing while disconnected: a command cannot get an answer
    /// then anyway. Returns how many trackers timed out.
    pub fn scavenge_timeouts(&self, now: Instant) -> usize {
        let mut changes = Vec::new();
        let expired: Vec<Entry> = {
            let mut table = lock(&self.inner.table);
            if !table.connected {
                return 0;
            }
            let due: Vec<u64> = table
                .entries
                .iter()
                .filter(|(_, entry)| entry.expiry <= now)
                .map(|(counter, _)| *counter)
                .collect();
            due.into_iter()
                .filter_map(|counter| table.take(counter, false, &mut changes))
                .collect()
        };

        for entry in &expired {
            tracing::debug!(tag = %entry.tag, "command timed out");
            entry.tracker.after_timeout();
        }
        self.publish(changes);
        expired.len()
    }

    fn remove(&self, tag: &CommandTag, with_error: bool) -> Option<Entry> {
        if tag.prefix() != self.inner.prefix {
            return None;
        }
        let mut changes = Vec::new();
        let entry = lock(&self.inner.table).take(tag.counter(), with_error, &mut changes);
        self.publish(changes);
        entry
    }

    fn publish(&self, changes: Vec<CommandInFlightStatus>) {
        if changes.is_empty() {
            return;
        }
        let observer = lock(&self.inner.observer).clone();
        if let Some(observer) = observer {
            for status in changes {
                observer(status);
            }
        }
    }
}

impl Table {
    fn trackers(&self) -> Vec<Arc<dyn Tracker>> {
        self.entries
            .values()
            .map(|entry| Arc::clone(&entry.tracker))
            .collect()
    }
}

/// A tracker looked up by tag. Resolving it removes it from the curator.
pub struct TrackerHandle {
    tag: CommandTag,
    tracker: Arc<dyn Tracker>,
    curator: TrackerCurator,
}

impl TrackerHandle {
    pub fn tag(&self) -> &CommandTag {
        &self.tag
    }

    /// Removes the tracker and hands it `outcome`. A failed outcome counts
    /// as a removal with error. Returns `false` if something else (a
    /// timeout, an earlier resolve) already removed it.
    pub fn resolve(self, outcome: &CommandOutcome) -> bool {
        if self.curator.remove(&self.tag, outcome.is_failure()).is_none() {
            return false;
        }
        self.tracker.on_outcome(outcome);
        true
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
