//! Wire frames and the binary codec.
//!
//! Every transport message carries exactly one frame. The first byte is the
//! opcode; integers are big-endian; room ids and payloads are raw bytes of
//! the configured width.
//!
//! ```text
//! client -> server
//!   0x00 Hello        u16 len | credential
//!   0x01 TimeRequest
//!   0x02 Watch        room
//!   0x03 Unwatch      room
//!   0x04 Post         room | payload
//!
//! server -> client
//!   0x80 Posted       room | flags | [u64 delivery] | [i64 server_time] | payload
//!   0x81 Time         i64 server_time
//!   0x82 Rejected     u16 len | utf-8 reason
//!   0x83 Welcome
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    errors::CodecError,
    token::{Credential, Payload, RoomId},
};

const FLAG_DELIVERY: u8 = 0b01;
const FLAG_SERVER_TIME: u8 = 0b10;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Credential presentation, first frame on every connection.
    Hello = 0x00,
    /// Ask the server for its clock.
    TimeRequest = 0x01,
    /// Start receiving posts for a room.
    Watch = 0x02,
    /// Stop receiving posts for a room.
    Unwatch = 0x03,
    /// Publish a payload to a room.
    Post = 0x04,
    /// A post delivered to a watched room.
    Posted = 0x80,
    /// Server clock sample.
    Time = 0x81,
    /// The server refused the session.
    Rejected = 0x82,
    /// The server accepted the credential.
    Welcome = 0x83,
}

impl Opcode {
    /// Map a raw byte to an opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Hello),
            0x01 => Some(Self::TimeRequest),
            0x02 => Some(Self::Watch),
            0x03 => Some(Self::Unwatch),
            0x04 => Some(Self::Post),
            0x80 => Some(Self::Posted),
            0x81 => Some(Self::Time),
            0x82 => Some(Self::Rejected),
            0x83 => Some(Self::Welcome),
            _ => None,
        }
    }

    /// True for frames the server sends.
    pub fn is_server_frame(self) -> bool {
        (self as u8) & 0x80 != 0
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Present the credential.
    Hello {
        /// Opaque key.
        credential: Credential,
    },
    /// Ask for a server clock sample.
    TimeRequest,
    /// Watch a room.
    Watch {
        /// Room to watch.
        room: RoomId,
    },
    /// Stop watching a room.
    Unwatch {
        /// Room to leave.
        room: RoomId,
    },
    /// Publish a payload.
    Post {
        /// Target room.
        room: RoomId,
        /// Fixed-width payload.
        payload: Payload,
    },
    /// A post delivered by the server.
    Posted {
        /// Room the post belongs to.
        room: RoomId,
        /// Server-assigned delivery id, used for dedup when present.
        delivery: Option<u64>,
        /// Server clock when the post was accepted (ms).
        server_time: Option<i64>,
        /// Fixed-width payload.
        payload: Payload,
    },
    /// Server clock sample (ms since the Unix epoch).
    Time {
        /// Server clock.
        server_time: i64,
    },
    /// The server refused the session.
    Rejected {
        /// Human-readable reason.
        reason: String,
    },
    /// The server accepted the `Hello` credential.
    Welcome,
}

impl Frame {
    /// Opcode for this frame.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Hello { .. } => Opcode::Hello,
            Self::TimeRequest => Opcode::TimeRequest,
            Self::Watch { .. } => Opcode::Watch,
            Self::Unwatch { .. } => Opcode::Unwatch,
            Self::Post { .. } => Opcode::Post,
            Self::Posted { .. } => Opcode::Posted,
            Self::Time { .. } => Opcode::Time,
            Self::Rejected { .. } => Opcode::Rejected,
            Self::Welcome => Opcode::Welcome,
        }
    }
}

/// Token widths shared by both ends of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Widths {
    /// Room id width in bytes.
    pub room: usize,
    /// Payload width in bytes.
    pub payload: usize,
}

impl Default for Widths {
    fn default() -> Self {
        Self { room: 8, payload: 32 }
    }
}

/// Binary frame codec for a fixed pair of token widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCodec {
    widths: Widths,
}

impl FrameCodec {
    /// Create a codec for the given widths.
    pub fn new(widths: Widths) -> Self {
        Self { widths }
    }

    /// Configured widths.
    pub fn widths(&self) -> Widths {
        self.widths
    }

    /// Encode a frame into `dst`.
    ///
    /// # Errors
    ///
    /// Fails without writing if a token width does not match the codec or a
    /// length-prefixed field is too long.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.check_widths(frame)?;

        dst.put_u8(frame.opcode() as u8);
        match frame {
            Frame::Hello { credential } => put_prefixed(dst, "credential", credential.as_bytes())?,
            Frame::TimeRequest | Frame::Welcome => {},
            Frame::Watch { room } | Frame::Unwatch { room } => dst.put_slice(room.as_bytes()),
            Frame::Post { room, payload } => {
                dst.put_slice(room.as_bytes());
                dst.put_slice(payload.as_bytes());
            },
            Frame::Posted { room, delivery, server_time, payload } => {
                dst.put_slice(room.as_bytes());
                let mut flags = 0;
                if delivery.is_some() {
                    flags |= FLAG_DELIVERY;
                }
                if server_time.is_some() {
                    flags |= FLAG_SERVER_TIME;
                }
                dst.put_u8(flags);
                if let Some(delivery) = delivery {
                    dst.put_u64(*delivery);
                }
                if let Some(server_time) = server_time {
                    dst.put_i64(*server_time);
                }
                dst.put_slice(payload.as_bytes());
            },
            Frame::Time { server_time } => dst.put_i64(*server_time),
            Frame::Rejected { reason } => put_prefixed(dst, "reason", reason.as_bytes())?,
        }

        Ok(())
    }

    /// Encode a frame into a fresh buffer.
    pub fn encode_to_bytes(&self, frame: &Frame) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(1 + self.widths.room + self.widths.payload + 17);
        self.encode(frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from a complete message.
    ///
    /// # Errors
    ///
    /// Never panics; malformed input yields a `CodecError`.
    pub fn decode(&self, mut src: Bytes) -> Result<Frame, CodecError> {
        if src.is_empty() {
            return Err(CodecError::Empty);
        }
        let raw = src.get_u8();
        let opcode = Opcode::from_u8(raw).ok_or(CodecError::UnknownOpcode(raw))?;
        let mut body = Body { opcode, buf: src };

        let frame = match opcode {
            Opcode::Hello => {
                let bytes = body.prefixed()?;
                Frame::Hello { credential: Credential::new(bytes)? }
            },
            Opcode::TimeRequest => Frame::TimeRequest,
            Opcode::Watch => Frame::Watch { room: self.room(&mut body)? },
            Opcode::Unwatch => Frame::Unwatch { room: self.room(&mut body)? },
            Opcode::Post => {
                let room = self.room(&mut body)?;
                Frame::Post { room, payload: self.payload(&mut body)? }
            },
            Opcode::Posted => {
                let room = self.room(&mut body)?;
                let flags = body.take(1)?.get_u8();
                let delivery =
                    if flags & FLAG_DELIVERY != 0 { Some(body.take(8)?.get_u64()) } else { None };
                let server_time =
                    if flags & FLAG_SERVER_TIME != 0 { Some(body.take(8)?.get_i64()) } else { None };
                Frame::Posted { room, delivery, server_time, payload: self.payload(&mut body)? }
            },
            Opcode::Time => Frame::Time { server_time: body.take(8)?.get_i64() },
            Opcode::Rejected => {
                let bytes = body.prefixed()?;
                let reason = String::from_utf8(bytes.to_vec())
                    .map_err(|_| CodecError::InvalidUtf8("reason"))?;
                Frame::Rejected { reason }
            },
            Opcode::Welcome => Frame::Welcome,
        };

        body.finish()?;
        Ok(frame)
    }

    fn room(&self, body: &mut Body) -> Result<RoomId, CodecError> {
        Ok(RoomId::new(body.take(self.widths.room)?, self.widths.room)?)
    }

    fn payload(&self, body: &mut Body) -> Result<Payload, CodecError> {
        Ok(Payload::new(body.take(self.widths.payload)?, self.widths.payload)?)
    }

    fn check_widths(&self, frame: &Frame) -> Result<(), CodecError> {
        let (room, payload) = match frame {
            Frame::Watch { room } | Frame::Unwatch { room } => (Some(room), None),
            Frame::Post { room, payload } | Frame::Posted { room, payload, .. } => {
                (Some(room), Some(payload))
            },
            Frame::Hello { .. }
            | Frame::TimeRequest
            | Frame::Time { .. }
            | Frame::Rejected { .. }
            | Frame::Welcome => (None, None),
        };

        if let Some(room) = room
            && room.width() != self.widths.room
        {
            return Err(CodecError::WidthMismatch {
                field: "room",
                expected: self.widths.room,
                actual: room.width(),
            });
        }
        if let Some(payload) = payload
            && payload.width() != self.widths.payload
        {
            return Err(CodecError::WidthMismatch {
                field: "payload",
                expected: self.widths.payload,
                actual: payload.width(),
            });
        }

        Ok(())
    }
}

fn put_prefixed(dst: &mut BytesMut, field: &'static str, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::FieldTooLong { field, len: bytes.len() })?;
    dst.put_u16(len);
    dst.put_slice(bytes);
    Ok(())
}

/// Bounds-checked reader over a frame body.
struct Body {
    opcode: Opcode,
    buf: Bytes,
}

impl Body {
    fn take(&mut self, needed: usize) -> Result<Bytes, CodecError> {
        if self.buf.len() < needed {
            return Err(CodecError::Truncated {
                opcode: self.opcode,
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(self.buf.split_to(needed))
    }

    fn prefixed(&mut self) -> Result<Bytes, CodecError> {
        let len = self.take(2)?.get_u16() as usize;
        self.take(len)
    }

    fn finish(self) -> Result<(), CodecError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes { opcode: self.opcode, extra: self.buf.len() })
        }
    }
}
