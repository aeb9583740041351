//! Fuzz target for [`FrameCodec::decode`]
//!
//! Inbound messages come straight off the network, so decoding must reject
//! garbage without panicking.
//!
//! # Invariants
//!
//! - NEVER panic on any input, for any widths
//! - A decoded frame re-encodes, and the re-encoding decodes to the same
//!   frame
//! - Decoded room and payload tokens have exactly the configured widths

#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use roomcast_proto::{Frame, FrameCodec, Widths};

#[derive(Debug, Arbitrary)]
struct FuzzInput {
    room_width: u8,
    payload_width: u8,
    message: Vec<u8>,
}

fuzz_target!(|input: FuzzInput| {
    let widths = Widths {
        room: usize::from(input.room_width % 16) + 1,
        payload: usize::from(input.payload_width % 64) + 1,
    };
    let codec = FrameCodec::new(widths);

    let Ok(frame) = codec.decode(Bytes::from(input.message)) else {
        return;
    };

    match &frame {
        Frame::Watch { room } | Frame::Unwatch { room } => {
            assert_eq!(room.width(), widths.room);
        },
        Frame::Post { room, payload } | Frame::Posted { room, payload, .. } => {
            assert_eq!(room.width(), widths.room);
            assert_eq!(payload.width(), widths.payload);
        },
        Frame::Hello { .. }
        | Frame::TimeRequest
        | Frame::Time { .. }
        | Frame::Rejected { .. }
        | Frame::Welcome => {},
    }

    let encoded = codec.encode_to_bytes(&frame).expect("decoded frame must re-encode");
    let again = codec.decode(encoded).expect("re-encoded frame must decode");
    assert_eq!(again, frame);
});
