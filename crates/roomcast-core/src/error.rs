//! Session error types.

use roomcast_proto::TokenError;
use thiserror::Error;

/// Malformed input from the embedding application.
///
/// Never retried and never dropped silently.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A token could not be parsed.
    #[error("invalid token: {0}")]
    Token(#[from] TokenError),

    /// Room id width does not match the configured width.
    #[error("room id must be {expected} bytes, got {actual}")]
    RoomWidth {
        /// Configured width.
        expected: usize,
        /// Actual width.
        actual: usize,
    },

    /// Payload width does not match the configured width.
    #[error("payload must be {expected} bytes, got {actual}")]
    PayloadWidth {
        /// Configured width.
        expected: usize,
        /// Actual width.
        actual: usize,
    },
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Establishing the connection failed.
    #[error("connect failed: {reason}")]
    ConnectFailed {
        /// Transport error text.
        reason: String,
    },

    /// Writing a frame failed.
    #[error("send failed: {reason}")]
    SendFailed {
        /// Transport error text.
        reason: String,
    },

    /// The connection dropped.
    #[error("connection lost: {reason}")]
    Lost {
        /// Transport error text or close reason.
        reason: String,
    },

    /// The server refused the session.
    #[error("rejected by server: {reason}")]
    Rejected {
        /// Reason sent by the server.
        reason: String,
    },

    /// Reconnect gave up after the configured number of attempts.
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },
}

/// Errors from session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Malformed room id or payload.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// An action needed a live connection.
    #[error("not connected")]
    NotConnected,

    /// The session was shut down or gave up reconnecting.
    #[error("session closed")]
    Closed,
}

impl SessionError {
    /// Returns true if the same call may succeed later without changes.
    ///
    /// Validation errors need different input; a closed session never
    /// reopens. Connection errors and `NotConnected` clear once the session
    /// reconnects.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::ReconnectExhausted { .. })
            | Self::Validation(_)
            | Self::Closed => false,

            Self::Connection(_) | Self::NotConnected => true,
        }
    }
}
