//! Fixed-width tokens.
//!
//! Rooms, post payloads and credentials are opaque byte strings written as
//! `0x`-prefixed hex. Room ids model an unsigned integer and may be written
//! with fewer digits than their width (they are left-padded with zeros).
//! Payloads must be written with exactly their width.

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;

/// Errors from parsing or constructing tokens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// The hex string does not start with `0x`.
    #[error("token must start with 0x: {0:?}")]
    MissingPrefix(String),

    /// The token carries no digits or bytes.
    #[error("token is empty")]
    Empty,

    /// The hex digits could not be decoded.
    #[error("invalid hex digits: {0}")]
    InvalidHex(String),

    /// The token is wider than allowed.
    #[error("token too wide: at most {max} bytes, got {actual}")]
    TooWide {
        /// Maximum width in bytes.
        max: usize,
        /// Actual width in bytes.
        actual: usize,
    },

    /// The token does not have the exact width required.
    #[error("wrong token width: expected {expected} bytes, got {actual}")]
    WrongWidth {
        /// Required width in bytes.
        expected: usize,
        /// Actual width in bytes.
        actual: usize,
    },

    /// A width of zero was configured.
    #[error("token width must be non-zero")]
    ZeroWidth,
}

fn strip_prefix(input: &str) -> Result<&str, TokenError> {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .ok_or_else(|| TokenError::MissingPrefix(input.to_string()))?;

    if digits.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(digits)
}

/// Decode hex digits into exactly `width` bytes, left-padding with zeros.
///
/// Leading zero digits do not count towards the width.
fn decode_padded(digits: &str, width: usize) -> Result<Bytes, TokenError> {
    if width == 0 {
        return Err(TokenError::ZeroWidth);
    }

    let digits = digits.trim_start_matches('0');
    let actual = digits.len().div_ceil(2);
    if actual > width {
        return Err(TokenError::TooWide { max: width, actual });
    }

    let padded = format!("{digits:0>len$}", len = width * 2);
    decode_hex(&padded)
}

fn decode_hex(digits: &str) -> Result<Bytes, TokenError> {
    hex::decode(digits).map(Bytes::from).map_err(|e| TokenError::InvalidHex(e.to_string()))
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    write!(f, "0x{}", hex::encode(bytes))
}

/// Room identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(Bytes);

impl RoomId {
    /// Build a room id from raw bytes that must be exactly `width` long.
    pub fn new(bytes: impl Into<Bytes>, width: usize) -> Result<Self, TokenError> {
        let bytes = bytes.into();
        if width == 0 {
            return Err(TokenError::ZeroWidth);
        }
        if bytes.len() != width {
            return Err(TokenError::WrongWidth { expected: width, actual: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// Parse a `0x`-prefixed room id, left-padding it to `width` bytes.
    ///
    /// `"0x123"` with width 8 is `0x0000000000000123`.
    pub fn parse(input: &str, width: usize) -> Result<Self, TokenError> {
        let digits = strip_prefix(input.trim())?;
        decode_padded(digits, width).map(Self)
    }

    /// Build a room id from an integer, big-endian, in `width` bytes.
    pub fn from_u64(value: u64, width: usize) -> Result<Self, TokenError> {
        if width == 0 {
            return Err(TokenError::ZeroWidth);
        }
        let be = value.to_be_bytes();
        let significant = be.iter().skip_while(|b| **b == 0).count();
        if significant > width {
            return Err(TokenError::TooWide { max: width, actual: significant });
        }

        let mut bytes = vec![0u8; width];
        let take = width.min(be.len());
        bytes[width - take..].copy_from_slice(&be[be.len() - take..]);
        Ok(Self(Bytes::from(bytes)))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Width in bytes.
    pub fn width(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomId({self})")
    }
}

/// Fixed-width post payload.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Payload(Bytes);

impl Payload {
    /// Build a payload from raw bytes that must be exactly `width` long.
    pub fn new(bytes: impl Into<Bytes>, width: usize) -> Result<Self, TokenError> {
        let bytes = bytes.into();
        if width == 0 {
            return Err(TokenError::ZeroWidth);
        }
        if bytes.len() != width {
            return Err(TokenError::WrongWidth { expected: width, actual: bytes.len() });
        }
        Ok(Self(bytes))
    }

    /// Parse a `0x`-prefixed payload with exactly `2 * width` hex digits.
    pub fn parse(input: &str, width: usize) -> Result<Self, TokenError> {
        if width == 0 {
            return Err(TokenError::ZeroWidth);
        }
        let digits = strip_prefix(input.trim())?;
        if digits.len() != width * 2 {
            return Err(TokenError::WrongWidth { expected: width, actual: digits.len().div_ceil(2) });
        }
        decode_hex(digits).map(Self)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Width in bytes.
    pub fn width(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({self})")
    }
}

/// Opaque authentication credential.
///
/// # Security
///
/// `Debug` redacts the bytes and there is no `Display` impl, so the key
/// cannot end up in logs by accident.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Credential(Bytes);

impl Credential {
    /// Wrap raw credential bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, TokenError> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(TokenError::Empty);
        }
        Ok(Self(bytes))
    }

    /// Parse a `0x`-prefixed hex credential of any width.
    pub fn parse(input: &str) -> Result<Self, TokenError> {
        let digits = strip_prefix(input.trim())?;
        decode_padded(digits, digits.len().div_ceil(2)).map(Self)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<String> for Credential {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<redacted {} bytes>)", self.0.len())
    }
}
