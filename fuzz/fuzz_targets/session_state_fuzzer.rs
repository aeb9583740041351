//! Fuzz target for the client [`Session`] state machine
//!
//! # Strategy
//!
//! - Event sequences: arbitrary interleavings of transport events, server
//!   frames, embedder commands and timer expiries
//! - Small room space so watches, duplicates and redeliveries collide often
//! - Clock jumps in both directions between time samples
//!
//! # Invariants
//!
//! - `Closed` is terminal
//! - `NotifyInit` is emitted at most once per session
//! - `Hello` is sent only while `Connecting`, every other frame only while
//!   `Connected`
//! - `NotifyInit` follows a `Welcome`
//! - Room history indices are contiguous from 0
//! - A delivery id is notified at most once per room
//! - NEVER panic on unexpected events

#![no_main]

use std::{
    collections::HashSet,
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomcast_core::{
    ConnectionState, Environment, ReconnectPolicy, Session, SessionAction, SessionConfig,
    SessionEvent,
};
use roomcast_proto::{Credential, Frame, Payload, RoomId, Widths};

const WIDTHS: Widths = Widths { room: 2, payload: 4 };

#[derive(Clone, Default)]
struct FuzzEnv {
    now: Arc<AtomicI64>,
}

impl Environment for FuzzEnv {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    fn sleep(&self, _duration: Duration) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}

#[derive(Debug, Clone, Arbitrary)]
enum FuzzEvent {
    Start,
    Connected,
    ConnectFailed,
    ConnectionLost,
    ReconnectDue,
    Posted { room: u8, delivery: Option<u8>, server_time: Option<i16>, seed: u8 },
    Time { server_time: i32 },
    Rejected,
    Welcome,
    Watch { room: u8 },
    Unwatch { room: u8, forget: bool },
    SendPost { room: u8, seed: u8 },
    TimePollDue,
    Shutdown,
    SetClock { millis: i32 },
}

#[derive(Debug, Clone, Arbitrary)]
struct FuzzInput {
    max_attempts: Option<u8>,
    history_limit: Option<u8>,
    events: Vec<FuzzEvent>,
}

fn room(value: u8) -> RoomId {
    RoomId::new(vec![0, value % 4], WIDTHS.room).expect("room width")
}

fn payload(seed: u8) -> Payload {
    Payload::new(vec![seed; WIDTHS.payload], WIDTHS.payload).expect("payload width")
}

fn to_event(event: FuzzEvent, env: &FuzzEnv) -> Option<SessionEvent> {
    Some(match event {
        FuzzEvent::Start => SessionEvent::Start,
        FuzzEvent::Connected => SessionEvent::Connected,
        FuzzEvent::ConnectFailed => SessionEvent::ConnectFailed { reason: "refused".into() },
        FuzzEvent::ConnectionLost => SessionEvent::ConnectionLost { reason: "reset".into() },
        FuzzEvent::ReconnectDue => SessionEvent::ReconnectDue,
        FuzzEvent::Posted { room: r, delivery, server_time, seed } => {
            SessionEvent::FrameReceived(Frame::Posted {
                room: room(r),
                delivery: delivery.map(u64::from),
                server_time: server_time.map(i64::from),
                payload: payload(seed),
            })
        },
        FuzzEvent::Time { server_time } => {
            SessionEvent::FrameReceived(Frame::Time { server_time: i64::from(server_time) })
        },
        FuzzEvent::Rejected => {
            SessionEvent::FrameReceived(Frame::Rejected { reason: "denied".into() })
        },
        FuzzEvent::Welcome => SessionEvent::FrameReceived(Frame::Welcome),
        FuzzEvent::Watch { room: r } => SessionEvent::Watch { room: room(r) },
        FuzzEvent::Unwatch { room: r, forget } => SessionEvent::Unwatch { room: room(r), forget },
        FuzzEvent::SendPost { room: r, seed } => {
            SessionEvent::SendPost { room: room(r), payload: payload(seed) }
        },
        FuzzEvent::TimePollDue => SessionEvent::TimePollDue,
        FuzzEvent::Shutdown => SessionEvent::Shutdown,
        FuzzEvent::SetClock { millis } => {
            env.now.store(i64::from(millis), Ordering::SeqCst);
            return None;
        },
    })
}

fuzz_target!(|input: FuzzInput| {
    let env = FuzzEnv::default();
    let config = SessionConfig {
        widths: WIDTHS,
        reconnect: ReconnectPolicy {
            enabled: true,
            initial_delay_ms: 10,
            max_delay_ms: 100,
            max_attempts: input.max_attempts.map(|n| u32::from(n % 8)),
        },
        history_limit: input
            .history_limit
            .and_then(|n| std::num::NonZeroUsize::new(usize::from(n % 16))),
        ..SessionConfig::default()
    };
    let unlimited = config.history_limit.is_none();
    let credential = Credential::new(vec![0xab; 32]).expect("credential");
    let mut session = Session::new(env.clone(), credential, config);

    let mut inits = 0;
    let mut notified: HashSet<(RoomId, u64)> = HashSet::new();

    for event in input.events {
        let welcome = matches!(event, FuzzEvent::Welcome);
        let forgotten = match &event {
            FuzzEvent::Unwatch { room: r, forget: true } => Some(room(*r)),
            _ => None,
        };
        let Some(event) = to_event(event, &env) else {
            continue;
        };
        let before = session.state();
        let result = session.handle(event);
        let after = session.state();

        if before == ConnectionState::Closed {
            assert_eq!(after, ConnectionState::Closed, "left Closed");
        }

        let Ok(actions) = result else {
            assert_eq!(before, after, "rejected command changed state");
            continue;
        };
        // Forgetting a room drops its dedup ids along with its history.
        if let Some(forgotten) = forgotten {
            notified.retain(|(r, _)| *r != forgotten);
        }

        for action in &actions {
            match action {
                SessionAction::NotifyInit => {
                    assert!(welcome, "init without welcome");
                    inits += 1;
                },
                SessionAction::Send(Frame::Hello { .. }) => {
                    assert_eq!(after, ConnectionState::Connecting, "hello outside handshake");
                },
                SessionAction::Send(_) => {
                    assert_eq!(after, ConnectionState::Connected, "sent while not connected");
                },
                SessionAction::NotifyPost(post) => {
                    if let Some(id) = post.delivery {
                        // Eviction forgets ids, so only check without a limit.
                        if unlimited {
                            assert!(notified.insert((post.room.clone(), id)), "redelivered {id}");
                        }
                    }
                },
                _ => {},
            }
        }
        assert!(inits <= 1, "on_init fired twice");

        for r in 0..4 {
            let history = session.history(&room(r));
            for (expected, post) in history.iter().enumerate() {
                if unlimited {
                    assert_eq!(post.index, expected as u64);
                }
            }
            assert!(history.windows(2).all(|w| w[0].index + 1 == w[1].index));
        }
    }
});
