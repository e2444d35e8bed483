//! Failed-signon counting per login.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default number of consecutive failures that locks a login.
pub const DEFAULT_FAILED_SIGNON_LIMIT: u32 = 3;

/// Kinds of signon attempt, in rank order.
///
/// A failure at one rank means the user got past every lower rank, so
/// counting it resets the lower counts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignonAttempt {
    Primary,
    Secondary,
}

/// Immutable per-login failure counts.
///
/// [`increment`](Self::increment) returns a new counter and leaves `self`
/// untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedSignonCounter {
    counts: BTreeMap<SignonAttempt, u32>,
    limit: u32,
}

impl FailedSignonCounter {
    /// A counter with all counts at zero.
    pub fn new(limit: u32) -> Self {
        Self {
            counts: BTreeMap::new(),
            limit: limit.max(1),
        }
    }

    /// Records one more failure of `kind` and zeroes every lower kind.
    #[must_use]
    pub fn increment(&self, kind: SignonAttempt) -> Self {
        let mut counts = self.counts.clone();
        for (attempt, count) in counts.iter_mut() {
            if *attempt < kind {
                *count = 0;
            }
        }
        let count = counts.entry(kind).or_insert(0);
        *count = count.saturating_add(1);
        Self {
            counts,
            limit: self.limit,
        }
    }

    pub fn count(&self, kind: SignonAttempt) -> u32 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// True once any kind reached the limit.
    pub fn has_reached_limit(&self) -> bool {
        self.counts.values().any(|count| *count >= self.limit)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

impl Default for FailedSignonCounter {
    fn default() -> Self {
        Self::new(DEFAULT_FAILED_SIGNON_LIMIT)
    }
}
