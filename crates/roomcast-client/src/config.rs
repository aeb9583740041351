//! Client configuration.
//!
//! Plain structs with defaults that also deserialize, so embedders can
//! build them in code or load them from a file. Durations are milliseconds.

use std::{num::NonZeroUsize, time::Duration};

use roomcast_core::{OffsetPolicy, ReconnectPolicy, SessionConfig};
use roomcast_proto::{Credential, Widths};
use serde::Deserialize;

use crate::error::ClientError;

fn default_room_width() -> usize {
    Widths::default().room
}

fn default_payload_width() -> usize {
    Widths::default().payload
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

/// Server clock synchronization settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeSyncConfig {
    /// How samples combine into the offset estimate.
    pub policy: OffsetPolicy,
    /// Interval between time requests while connected. 0 requests the time
    /// only once per connection.
    pub poll_interval_ms: u64,
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self { policy: OffsetPolicy::default(), poll_interval_ms: 1_000 }
    }
}

impl TimeSyncConfig {
    /// Poll interval, or `None` when periodic polling is off.
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_ms > 0).then(|| Duration::from_millis(self.poll_interval_ms))
    }
}

/// Everything needed to construct a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Endpoint, scheme-qualified (`ws://host:port/path`).
    pub url: String,
    /// Authentication key, `0x`-prefixed hex.
    pub key: Credential,
    /// Reconnect behavior after the connection drops.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Room id width in bytes.
    #[serde(default = "default_room_width")]
    pub room_width: usize,
    /// Payload width in bytes.
    #[serde(default = "default_payload_width")]
    pub payload_width: usize,
    /// Clock synchronization.
    #[serde(default)]
    pub time_sync: TimeSyncConfig,
    /// Posts kept per room; unlimited when absent.
    #[serde(default)]
    pub history_limit: Option<NonZeroUsize>,
    /// How long to wait for the server to accept the key after the
    /// transport connects.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl ClientConfig {
    /// Config with defaults for everything but the endpoint and key.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Validation` if `key` is not valid hex.
    pub fn new(url: impl Into<String>, key: &str) -> Result<Self, ClientError> {
        Ok(Self {
            url: url.into(),
            key: Credential::parse(key)?,
            reconnect: ReconnectPolicy::default(),
            room_width: default_room_width(),
            payload_width: default_payload_width(),
            time_sync: TimeSyncConfig::default(),
            history_limit: None,
            handshake_timeout_ms: default_handshake_timeout_ms(),
        })
    }

    /// Time allowed between transport connect and the server's welcome.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Token widths.
    pub fn widths(&self) -> Widths {
        Widths { room: self.room_width, payload: self.payload_width }
    }

    /// Check values serde cannot check on its own.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<(), ClientError> {
        let config_error = |reason: &str| Err(ClientError::Config { reason: reason.to_string() });

        match self.url.split_once("://") {
            Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {},
            _ => return config_error("url must look like scheme://host"),
        }
        if self.room_width == 0 {
            return config_error("room_width must be non-zero");
        }
        if self.payload_width == 0 {
            return config_error("payload_width must be non-zero");
        }
        if self.reconnect.enabled && self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return config_error("reconnect initial_delay_ms exceeds max_delay_ms");
        }
        if self.handshake_timeout_ms == 0 {
            return config_error("handshake_timeout_ms must be non-zero");
        }
        if self.reconnect.max_attempts == Some(0) {
            return config_error("reconnect max_attempts must be non-zero; disable reconnect instead");
        }

        Ok(())
    }

    /// Settings for the session state machine.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            widths: self.widths(),
            reconnect: self.reconnect,
            offset_policy: self.time_sync.policy,
            history_limit: self.history_limit,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEY: &str = "0x0000000000000000000000000000000000000000000000000000000000000001";

    #[test]
    fn new_uses_defaults() {
        let config = ClientConfig::new("ws://localhost:8080", KEY).unwrap();

        assert_eq!(config.widths(), Widths { room: 8, payload: 32 });
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.time_sync.poll_interval(), Some(Duration::from_secs(1)));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn bad_key_is_a_validation_error() {
        let result = ClientConfig::new("ws://localhost", "deadbeef");
        assert!(matches!(result, Err(ClientError::Validation(_))));
    }

    #[test]
    fn deserializes_with_partial_sections() {
        let json = format!(
            r#"{{
                "url": "wss://rooms.example/ws",
                "key": "{KEY}",
                "reconnect": {{ "initial_delay_ms": 250, "max_attempts": 5 }},
                "time_sync": {{ "policy": {{ "kind": "window_median", "size": 5 }} }},
                "history_limit": 100
            }}"#
        );
        let config: ClientConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.reconnect.initial_delay_ms, 250);
        assert_eq!(config.reconnect.max_delay_ms, 10_000);
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert!(config.reconnect.enabled);
        assert_eq!(
            config.time_sync.policy,
            OffsetPolicy::WindowMedian { size: NonZeroUsize::new(5).unwrap() }
        );
        assert_eq!(config.time_sync.poll_interval_ms, 1_000);
        assert_eq!(config.history_limit, NonZeroUsize::new(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_key_fails_deserialization() {
        let json = r#"{ "url": "ws://localhost", "key": "not-hex" }"#;
        assert!(serde_json::from_str::<ClientConfig>(json).is_err());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = ClientConfig::new("localhost:8080", KEY).unwrap();
        assert!(matches!(config.validate(), Err(ClientError::Config { .. })));

        config.url = "ws://localhost:8080".to_string();
        config.payload_width = 0;
        assert!(matches!(config.validate(), Err(ClientError::Config { .. })));

        config.payload_width = 32;
        config.handshake_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ClientError::Config { .. })));

        config.handshake_timeout_ms = 500;
        config.reconnect.initial_delay_ms = 20_000;
        assert!(matches!(config.validate(), Err(ClientError::Config { .. })));
    }

    #[test]
    fn zero_poll_interval_disables_polling() {
        let config = TimeSyncConfig { poll_interval_ms: 0, ..TimeSyncConfig::default() };
        assert_eq!(config.poll_interval(), None);
    }
}
