//! Supervisor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::counter::DEFAULT_FAILED_SIGNON_LIMIT;

/// Tuning for the [`SessionSupervisor`](crate::SessionSupervisor).
///
/// Every field has a default, so a partial config file works:
///
/// ```rust
/// use std::time::Duration;
/// use tether_session::SupervisorConfig;
///
/// let config = SupervisorConfig {
///     maximum_inactivity: Duration::from_secs(30),
///     ..SupervisorConfig::default()
/// };
/// assert_eq!(config.failed_signon_limit, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How long an orphaned session waits for a resignon.
    pub maximum_inactivity: Duration,
    /// How often orphaned sessions and stale challenges are swept.
    pub sweep_interval: Duration,
    /// How long a secondary challenge token stays answerable.
    pub secondary_token_validity: Duration,
    /// Consecutive failures of one kind that lock a login.
    pub failed_signon_limit: u32,
    /// How long a login's failure counts live after its latest failure.
    /// A locked login unlocks once this passes.
    pub failed_signon_window: Duration,
    /// How many recent session identifiers must never repeat.
    pub taboo_ring_size: usize,
    /// Capacity of the supervisor's request queue.
    pub command_buffer: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            maximum_inactivity: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            secondary_token_validity: Duration::from_secs(300),
            failed_signon_limit: DEFAULT_FAILED_SIGNON_LIMIT,
            failed_signon_window: Duration::from_secs(15 * 60),
            taboo_ring_size: 1_024,
            command_buffer: 256,
        }
    }
}

impl SupervisorConfig {
    /// Returns a copy with zero values raised to their minimum.
    pub fn validated(&self) -> Self {
        let mut config = self.clone();
        if config.sweep_interval.is_zero() {
            tracing::warn!("sweep_interval is zero, using 1ms");
            config.sweep_interval = Duration::from_millis(1);
        }
        if config.failed_signon_limit == 0 {
            tracing::warn!("failed_signon_limit is zero, using 1");
            config.failed_signon_limit = 1;
        }
        if config.failed_signon_window.is_zero() {
            tracing::warn!("failed_signon_window is zero, using 1s");
            config.failed_signon_window = Duration::from_secs(1);
        }
        if config.taboo_ring_size == 0 {
            tracing::warn!("taboo_ring_size is zero, using 1");
            config.taboo_ring_size = 1;
        }
        if config.command_buffer == 0 {
            tracing::warn!("command_buffer is zero, using 1");
            config.command_buffer = 1;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_keeps_sane_values() {
        let config = SupervisorConfig::default();
        assert_eq!(config.validated(), config);
    }

    #[test]
    fn test_validated_raises_zeros() {
        let config = SupervisorConfig {
            sweep_interval: Duration::ZERO,
            failed_signon_limit: 0,
            failed_signon_window: Duration::ZERO,
            taboo_ring_size: 0,
            command_buffer: 0,
            ..SupervisorConfig::default()
        }
        .validated();

        assert_eq!(config.sweep_interval, Duration::from_millis(1));
        assert_eq!(config.failed_signon_limit, 1);
        assert_eq!(config.failed_signon_window, Duration::from_secs(1));
        assert_eq!(config.taboo_ring_size, 1);
        assert_eq!(config.command_buffer, 1);
    }
}
