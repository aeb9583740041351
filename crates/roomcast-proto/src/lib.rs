//! Roomcast wire protocol.
//!
//! Fixed-width tokens ([`RoomId`], [`Payload`], [`Credential`]) and the
//! binary [`Frame`] codec shared by clients and servers. Token widths are
//! configuration ([`Widths`]), not constants, so the same codec serves
//! deployments with different room or payload sizes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod errors;
mod frame;
mod token;

pub use errors::CodecError;
pub use frame::{Frame, FrameCodec, Opcode, Widths};
pub use token::{Credential, Payload, RoomId, TokenError};
