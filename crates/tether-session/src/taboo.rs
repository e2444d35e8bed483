//! Taboo generator: random identifiers that avoid repeating recent ones.
//!
//! A random 128-bit value is already astronomically unlikely to collide,
//! but session identifiers must *never* collide while a session still
//! references one, so the generator remembers its last N outputs in a
//! ring and rejects a candidate that matches any of them.
//!
//! ```text
//!   index ──fetch_add──→ slot k      ring: [ a | b | c | k:new | · | · ]
//!                                              scan ──→   stop at first empty
//! ```
//!
//! Only the index advance is atomic. Two callers racing on the same ring
//! cell at worst let one candidate skip one comparison, which the base
//! collision probability makes irrelevant.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;
use tether_protocol::SessionIdentifier;

type Candidates<T> = Box<dyn Fn() -> T + Send + Sync>;
type Equivalence<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Generates values that differ from the last `ring_size` values it
/// handed out, as judged by a caller-supplied equivalence.
pub struct TabooGenerator<T> {
    ring: Box<[Mutex<Option<T>>]>,
    index: AtomicUsize,
    candidates: Candidates<T>,
    equivalent: Equivalence<T>,
}

impl<T: Clone> TabooGenerator<T> {
    /// Creates a generator remembering `ring_size` values (at least one).
    ///
    /// `candidates` produces fresh random values; `equivalent` decides
    /// whether two values count as the same.
    pub fn new<C, E>(ring_size: usize, candidates: C, equivalent: E) -> Self
    where
        C: Fn() -> T + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let ring = (0..ring_size.max(1)).map(|_| Mutex::new(None)).collect();
        Self {
            ring,
            index: AtomicUsize::new(0),
            candidates: Box::new(candidates),
            equivalent: Box::new(equivalent),
        }
    }

    /// Returns a value not equivalent to any value still in the ring.
    ///
    /// Never fails and performs no I/O. Loops only while the candidate
    /// source keeps producing repeats.
    pub fn generate(&self) -> T {
        loop {
            let slot = self.index.fetch_add(1, Ordering::Relaxed) % self.ring.len();
            let candidate = (self.candidates)();
            *lock(&self.ring[slot]) = Some(candidate.clone());

            if !self.repeats(slot, &candidate) {
                return candidate;
            }
            tracing::debug!(slot, "taboo generator rejected a repeated candidate");
        }
    }

    /// Number of values the generator remembers.
    pub fn ring_size(&self) -> usize {
        self.ring.len()
    }

    fn repeats(&self, own_slot: usize, candidate: &T) -> bool {
        for (slot, cell) in self.ring.iter().enumerate() {
            if slot == own_slot {
                continue;
            }
            match lock(cell).as_ref() {
                // Not wrapped yet: every later slot is empty too.
                None => return false,
                Some(previous) if (self.equivalent)(previous, candidate) => {
                    return true;
                }
                Some(_) => {}
            }
        }
        false
    }
}

fn lock<T>(cell: &Mutex<T>) -> MutexGuard<'_, T> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A generator of 128-bit session identifiers, written as 32 hex chars.
pub fn session_identifiers(ring_size: usize) -> TabooGenerator<SessionIdentifier> {
    TabooGenerator::new(ring_size, random_identifier, |a, b| a == b)
}

fn random_identifier() -> SessionIdentifier {
    let bytes: [u8; 16] = rand::rng().random();
    SessionIdentifier::new(
        bytes.iter().map(|b| format!("{b:02x}")).collect::<String>(),
    )
}
