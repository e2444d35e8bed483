//! Handshake metadata: the key/value block the Upend sends once per
//! connection, and the typed views over it.
//!
//! ```text
//! Downend ── Hello { version } ──────────────────────→ Upend
//! Downend ←─ Welcome { metadata } or Rejected { reason } ── Upend
//! ```
//!
//! Every value is either an integer or a string. Durations travel as
//! integer milliseconds under the names in [`keys`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Names of the handshake keys.
pub mod keys {
    pub const PROTOCOL_VERSION: &str = "protocol-version";
    pub const AUTHENTICATION_REQUIRED: &str = "authentication-required";
    pub const PING_INTERVAL_MS: &str = "ping-interval-ms";
    pub const PING_TIMEOUT_MS: &str = "ping-timeout-ms";
    pub const PONG_TIMEOUT_MS: &str = "pong-timeout-ms";
    pub const SESSION_INACTIVITY_MAX_MS: &str = "session-inactivity-max-ms";
    pub const RECONNECT_DELAY_LOWER_MS: &str = "reconnect-delay-lower-ms";
    pub const RECONNECT_DELAY_UPPER_MS: &str = "reconnect-delay-upper-ms";
}

/// One handshake value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Integer(i64),
    Text(String),
}

/// Named handshake values, ordered by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandshakeMetadata(BTreeMap<String, MetadataValue>);

impl HandshakeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an integer value, replacing any previous one under `key`.
    pub fn with_integer(mut self, key: &str, value: i64) -> Self {
        self.0.insert(key.to_string(), MetadataValue::Integer(value));
        self
    }

    /// Adds a text value, replacing any previous one under `key`.
    pub fn with_text(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), MetadataValue::Text(value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    /// Reads an integer value.
    ///
    /// # Errors
    /// `InvalidMessage` when the key is absent or holds text.
    pub fn integer(&self, key: &str) -> Result<i64, ProtocolError> {
        match self.0.get(key) {
            Some(MetadataValue::Integer(value)) => Ok(*value),
            Some(MetadataValue::Text(_)) => Err(ProtocolError::InvalidMessage(
                format!("handshake key {key} is not an integer"),
            )),
            None => Err(missing(key)),
        }
    }

    /// Reads a text value.
    ///
    /// # Errors
    /// `InvalidMessage` when the key is absent or holds an integer.
    pub fn text(&self, key: &str) -> Result<&str, ProtocolError> {
        match self.0.get(key) {
            Some(MetadataValue::Text(value)) => Ok(value),
            Some(MetadataValue::Integer(_)) => Err(ProtocolError::InvalidMessage(
                format!("handshake key {key} is not a string"),
            )),
            None => Err(missing(key)),
        }
    }

    fn millis(&self, key: &str) -> Result<Duration, ProtocolError> {
        let value = self.integer(key)?;
        u64::try_from(value).map(Duration::from_millis).map_err(|_| {
            ProtocolError::InvalidMessage(format!(
                "handshake key {key} is negative: {value}"
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn missing(key: &str) -> ProtocolError {
    ProtocolError::InvalidMessage(format!("handshake key {key} is missing"))
}

fn as_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// TimeBoundary
// ---------------------------------------------------------------------------

/// The timing contract for one connection, dictated by the Upend.
///
/// - `ping_interval`: how often the Downend pings.
/// - `ping_timeout`: how long the Upend waits for any frame before it
///   declares the connection dead.
/// - `pong_timeout`: how long the Downend waits for a pong.
/// - `session_inactivity_max`: how long an orphaned session stays
///   reclaimable.
/// - `reconnect_delay_lower..=reconnect_delay_upper`: the jitter range
///   the Downend waits in before reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeBoundary {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub pong_timeout: Duration,
    pub session_inactivity_max: Duration,
    pub reconnect_delay_lower: Duration,
    pub reconnect_delay_upper: Duration,
}

impl Default for TimeBoundary {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(15),
            pong_timeout: Duration::from_secs(3),
            session_inactivity_max: Duration::from_secs(60),
            reconnect_delay_lower: Duration::from_millis(500),
            reconnect_delay_upper: Duration::from_secs(3),
        }
    }
}

impl TimeBoundary {
    /// Fixes values that would make the timers misbehave.
    ///
    /// - zero intervals and timeouts are raised to 1 ms;
    /// - `reconnect_delay_lower` is forced ≤ `reconnect_delay_upper`.
    pub fn validated(mut self) -> Self {
        let floor = Duration::from_millis(1);
        self.ping_interval = self.ping_interval.max(floor);
        self.ping_timeout = self.ping_timeout.max(floor);
        self.pong_timeout = self.pong_timeout.max(floor);
        if self.reconnect_delay_lower > self.reconnect_delay_upper {
            self.reconnect_delay_lower = self.reconnect_delay_upper;
        }
        self
    }

    /// Writes the timing keys into `metadata`.
    pub fn write_into(&self, metadata: HandshakeMetadata) -> HandshakeMetadata {
        metadata
            .with_integer(keys::PING_INTERVAL_MS, as_millis(self.ping_interval))
            .with_integer(keys::PING_TIMEOUT_MS, as_millis(self.ping_timeout))
            .with_integer(keys::PONG_TIMEOUT_MS, as_millis(self.pong_timeout))
            .with_integer(
                keys::SESSION_INACTIVITY_MAX_MS,
                as_millis(self.session_inactivity_max),
            )
            .with_integer(
                keys::RECONNECT_DELAY_LOWER_MS,
                as_millis(self.reconnect_delay_lower),
            )
            .with_integer(
                keys::RECONNECT_DELAY_UPPER_MS,
                as_millis(self.reconnect_delay_upper),
            )
    }

    /// Reads the timing keys back.
    ///
    /// # Errors
    /// `InvalidMessage` when any timing key is missing, mistyped or negative.
    pub fn from_metadata(
        metadata: &HandshakeMetadata,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            ping_interval: metadata.millis(keys::PING_INTERVAL_MS)?,
            ping_timeout: metadata.millis(keys::PING_TIMEOUT_MS)?,
            pong_timeout: metadata.millis(keys::PONG_TIMEOUT_MS)?,
            session_inactivity_max: metadata
                .millis(keys::SESSION_INACTIVITY_MAX_MS)?,
            reconnect_delay_lower: metadata
                .millis(keys::RECONNECT_DELAY_LOWER_MS)?,
            reconnect_delay_upper: metadata
                .millis(keys::RECONNECT_DELAY_UPPER_MS)?,
        }
        .validated())
    }
}

// ---------------------------------------------------------------------------
// HandshakeTerms
// ---------------------------------------------------------------------------

/// Everything the Upend announces in its `Welcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTerms {
    pub protocol_version: u32,
    pub authentication_required: bool,
    pub time_boundary: TimeBoundary,
}

impl HandshakeTerms {
    pub fn to_metadata(&self) -> HandshakeMetadata {
        let metadata = HandshakeMetadata::new()
            .with_integer(keys::PROTOCOL_VERSION, i64::from(self.protocol_version))
            .with_text(
                keys::AUTHENTICATION_REQUIRED,
                if self.authentication_required { "true" } else { "false" },
            );
        self.time_boundary.write_into(metadata)
    }

    /// # Errors
    /// `InvalidMessage` when a key is missing or holds an unexpected value.
    pub fn from_metadata(
        metadata: &HandshakeMetadata,
    ) -> Result<Self, ProtocolError> {
        let version = metadata.integer(keys::PROTOCOL_VERSION)?;
        let protocol_version = u32::try_from(version).map_err(|_| {
            ProtocolError::InvalidMessage(format!(
                "protocol version out of range: {version}"
            ))
        })?;
        let authentication_required =
            match metadata.text(keys::AUTHENTICATION_REQUIRED)? {
                "true" => true,
                "false" => false,
                other => {
                    return Err(ProtocolError::InvalidMessage(format!(
                        "authentication-required must be true or false, got {other:?}"
                    )));
                }
            };
        Ok(Self {
            protocol_version,
            authentication_required,
            time_boundary: TimeBoundary::from_metadata(metadata)?,
        })
    }
}
