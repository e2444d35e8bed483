//! Upend configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_protocol::TimeBoundary;
use tether_session::SupervisorConfig;

/// Everything an [`UpendServer`](crate::UpendServer) needs besides its
/// collaborators. Usually filled through the
/// [`UpendServerBuilder`](crate::UpendServerBuilder).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpendConfig {
    pub bind_address: String,
    /// Whether Downends must sign on before sending commands.
    pub authentication_required: bool,
    /// Announced to every Downend in `Welcome`. Its
    /// `session_inactivity_max` also bounds orphaned sessions here.
    pub time_boundary: TimeBoundary,
    /// How long a fresh connection may take to say `Hello`.
    pub handshake_timeout: Duration,
    pub supervisor: SupervisorConfig,
}

impl Default for UpendConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9000".to_string(),
            authentication_required: true,
            time_boundary: TimeBoundary::default(),
            handshake_timeout: Duration::from_secs(5),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl UpendConfig {
    /// Returns a copy with unusable values replaced and the announced
    /// inactivity limit applied to the supervisor.
    pub fn validated(&self) -> Self {
        let mut config = self.clone();
        config.time_boundary = config.time_boundary.validated();
        if config.handshake_timeout.is_zero() {
            tracing::warn!("handshake_timeout is zero, using 1ms");
            config.handshake_timeout = Duration::from_millis(1);
        }
        config.supervisor.maximum_inactivity = config.time_boundary.session_inactivity_max;
        config.supervisor = config.supervisor.validated();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validated_aligns_supervisor_inactivity() {
        let config = UpendConfig {
            time_boundary: TimeBoundary {
                session_inactivity_max: Duration::from_secs(7),
                ..TimeBoundary::default()
            },
            ..UpendConfig::default()
        }
        .validated();

        assert_eq!(config.supervisor.maximum_inactivity, Duration::from_secs(7));
    }

    #[test]
    fn test_validated_raises_zero_handshake_timeout() {
        let config = UpendConfig {
            handshake_timeout: Duration::ZERO,
            ..UpendConfig::default()
        }
        .validated();

        assert_eq!(config.handshake_timeout, Duration::from_millis(1));
    }
}
