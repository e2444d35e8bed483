//! Downend configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_protocol::TimeBoundary;

/// Settings for a [`DownendConnector`](crate::DownendConnector).
///
/// `time_boundary` only applies until the first `Welcome`: from then on
/// the values the Upend announced win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownendConfig {
    /// Starts every command tag this connector allocates.
    pub tag_prefix: String,
    /// How long a command waits for its outcome.
    pub tracker_lifetime: Duration,
    /// How often timed-out trackers are swept.
    pub scavenge_interval: Duration,
    /// Upper bound on opening the transport.
    pub connect_timeout: Duration,
    /// How long to wait for `Welcome` after `Hello`.
    pub handshake_timeout: Duration,
    pub time_boundary: TimeBoundary,
}

impl Default for DownendConfig {
    fn default() -> Self {
        Self {
            tag_prefix: "dn".to_string(),
            tracker_lifetime: Duration::from_secs(30),
            scavenge_interval: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            time_boundary: TimeBoundary::default(),
        }
    }
}

impl DownendConfig {
    /// Returns a copy with unusable values replaced.
    pub fn validated(&self) -> Self {
        let mut config = self.clone();
        let floor = Duration::from_millis(1);
        if config.tag_prefix.is_empty() {
            tracing::warn!("tag_prefix is empty, using \"dn\"");
            config.tag_prefix = "dn".to_string();
        }
        if config.scavenge_interval < floor {
            tracing::warn!("scavenge_interval is zero, using 1ms");
            config.scavenge_interval = floor;
        }
        config.connect_timeout = config.connect_timeout.max(floor);
        config.handshake_timeout = config.handshake_timeout.max(floor);
        config.time_boundary = config.time_boundary.validated();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_keeps_defaults() {
        let config = DownendConfig::default();
        assert_eq!(config.validated(), config);
    }

    #[test]
    fn test_validated_repairs_bad_values() {
        let config = DownendConfig {
            tag_prefix: String::new(),
            scavenge_interval: Duration::ZERO,
            time_boundary: TimeBoundary {
                reconnect_delay_lower: Duration::from_secs(9),
                reconnect_delay_upper: Duration::from_secs(1),
                ..TimeBoundary::default()
            },
            ..DownendConfig::default()
        }
        .validated();

        assert_eq!(config.tag_prefix, "dn");
        assert_eq!(config.scavenge_interval, Duration::from_millis(1));
        assert!(
            config.time_boundary.reconnect_delay_lower
                <= config.time_boundary.reconnect_delay_upper
        );
    }
}
