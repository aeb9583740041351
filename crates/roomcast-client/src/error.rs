//! Client error types.

use roomcast_core::{ConnectionError, SessionError, ValidationError};
use roomcast_proto::TokenError;
use thiserror::Error;

/// Errors from client operations and the error callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Connecting failed, the connection dropped, or reconnect gave up.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The operation needs a live connection.
    #[error("not connected")]
    NotConnected,

    /// Malformed room id or payload.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The client was shut down or gave up reconnecting.
    #[error("client closed")]
    Closed,

    /// The configuration is unusable.
    #[error("invalid config: {reason}")]
    Config {
        /// What is wrong with it.
        reason: String,
    },
}

impl From<SessionError> for ClientError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Validation(e) => Self::Validation(e),
            SessionError::Connection(e) => Self::Connection(e),
            SessionError::NotConnected => Self::NotConnected,
            SessionError::Closed => Self::Closed,
        }
    }
}

impl From<TokenError> for ClientError {
    fn from(err: TokenError) -> Self {
        Self::Validation(ValidationError::Token(err))
    }
}

impl ClientError {
    /// Returns true if this error is fatal (unrecoverable).
    ///
    /// Fatal errors end the client or need different input. Transient
    /// errors clear once the client reconnects.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connection(ConnectionError::ReconnectExhausted { .. })
            | Self::Closed
            | Self::Config { .. } => true,

            // Bad input, but the client itself is fine
            Self::Validation(_) => false,

            Self::Connection(_) | Self::NotConnected => false,
        }
    }

    /// Returns true if repeating the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal() && !matches!(self, Self::Validation(_))
    }
}
