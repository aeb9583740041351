//! Codec error types.

use thiserror::Error;

use crate::{frame::Opcode, token::TokenError};

/// Errors from encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The message carried no bytes.
    #[error("empty frame")]
    Empty,

    /// The first byte is not a known opcode.
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    /// The body ended before a field could be read.
    #[error("truncated {opcode:?} frame: needed {needed} more bytes, {remaining} left")]
    Truncated {
        /// Frame being decoded.
        opcode: Opcode,
        /// Bytes the next field needs.
        needed: usize,
        /// Bytes left in the body.
        remaining: usize,
    },

    /// Bytes were left after the last field.
    #[error("{extra} trailing bytes after {opcode:?} frame")]
    TrailingBytes {
        /// Frame being decoded.
        opcode: Opcode,
        /// Number of unread bytes.
        extra: usize,
    },

    /// A token does not have the width the codec is configured for.
    #[error("{field} width mismatch: expected {expected} bytes, got {actual}")]
    WidthMismatch {
        /// Name of the field.
        field: &'static str,
        /// Configured width.
        expected: usize,
        /// Actual width.
        actual: usize,
    },

    /// A length-prefixed field does not fit its u16 prefix.
    #[error("{field} too long: {len} bytes")]
    FieldTooLong {
        /// Name of the field.
        field: &'static str,
        /// Actual length.
        len: usize,
    },

    /// A text field is not valid UTF-8.
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A decoded token was rejected.
    #[error("invalid token: {0}")]
    Token(#[from] TokenError),
}
