//! Session state machine.
//!
//! The `Session` owns everything the client knows: connection state, watched
//! rooms, the post ledger and the clock offset. It is a pure state machine:
//! the driver feeds it [`SessionEvent`]s and executes the returned
//! [`SessionAction`]s (send frames, invoke callbacks, sleep, log). Because
//! the driver handles one event at a time, callbacks never race ledger
//! mutation.
//!
//! ```text
//!              Start                  Welcome
//! Disconnected ─────> Connecting ───────────> Connected
//!      ^                  │                      │
//!      │  ReconnectDue    │ ConnectFailed        │ ConnectionLost
//!      │                  │ Rejected             │ Rejected
//!      └──────────────────┴──────────────────────┘
//!                 (budget spent or reconnect disabled: Closed)
//! ```
//!
//! `Connecting` spans both the transport connect and the credential
//! handshake: once the transport is up the session sends `Hello` and waits
//! for the server's `Welcome`. Only a `Welcome` restores the reconnect
//! budget, so a server that keeps rejecting the credential exhausts it.

use std::{num::NonZeroUsize, sync::Arc, time::Duration};

use roomcast_proto::{Credential, Frame, Payload, RoomId, Widths};

use crate::{
    backoff::{Backoff, ReconnectPolicy},
    env::Environment,
    error::{ConnectionError, SessionError, ValidationError},
    ledger::{Delivery, Post, PostLedger},
    subscriptions::Subscriptions,
    time_sync::{OffsetPolicy, ServerTime, TimeSample, TimeSync},
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; a reconnect may be scheduled.
    Disconnected,
    /// A connect attempt or credential handshake is in flight.
    Connecting,
    /// Frames can be sent.
    Connected,
    /// Shut down or gave up. Terminal.
    Closed,
}

/// Log severity for [`SessionAction::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Verbose detail.
    Debug,
    /// Lifecycle milestones.
    Info,
    /// Recoverable problems.
    Warn,
    /// Failures surfaced to the embedder.
    Error,
}

/// Session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Room id and payload widths.
    pub widths: Widths,
    /// Reconnect behavior.
    pub reconnect: ReconnectPolicy,
    /// Clock offset policy.
    pub offset_policy: OffsetPolicy,
    /// Per-room history cap; `None` keeps everything.
    pub history_limit: Option<NonZeroUsize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            widths: Widths::default(),
            reconnect: ReconnectPolicy::default(),
            offset_policy: OffsetPolicy::default(),
            history_limit: None,
        }
    }
}

/// Inputs to the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Begin the first connect attempt.
    Start,
    /// The transport connected; the credential handshake starts.
    Connected,
    /// A connect attempt failed.
    ConnectFailed {
        /// Transport error text.
        reason: String,
    },
    /// The open connection dropped or a write failed.
    ConnectionLost {
        /// Transport error text.
        reason: String,
    },
    /// A scheduled reconnect delay elapsed.
    ReconnectDue,
    /// A decoded frame arrived.
    FrameReceived(Frame),
    /// The embedder asked to watch a room.
    Watch {
        /// Room to watch.
        room: RoomId,
    },
    /// The embedder asked to stop watching a room.
    Unwatch {
        /// Room to leave.
        room: RoomId,
        /// Also drop the room's post history.
        forget: bool,
    },
    /// The embedder asked to publish a payload.
    SendPost {
        /// Target room.
        room: RoomId,
        /// Payload to publish.
        payload: Payload,
    },
    /// Time to ask the server for its clock.
    TimePollDue,
    /// Explicit shutdown.
    Shutdown,
}

/// Work for the driver.
#[derive(Debug, Clone)]
pub enum SessionAction {
    /// Write a frame to the connection.
    Send(Frame),
    /// Attempt a connect now.
    Connect,
    /// Sleep, then feed [`SessionEvent::ReconnectDue`].
    ScheduleReconnect {
        /// How long to wait.
        delay: Duration,
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Close and drop the current connection.
    CloseConnection,
    /// Invoke the on-init callback. Emitted once per session, after the
    /// first `Welcome`.
    NotifyInit,
    /// Invoke the on-post callback with this post and the room history.
    NotifyPost(Post),
    /// Invoke the error callback.
    NotifyError(SessionError),
    /// The offset estimate changed.
    PublishOffset(i64),
    /// The connection state changed.
    PublishState(ConnectionState),
    /// Emit a log line.
    Log {
        /// Severity.
        level: LogLevel,
        /// Message text.
        message: String,
    },
}

fn log(level: LogLevel, message: impl Into<String>) -> SessionAction {
    SessionAction::Log { level, message: message.into() }
}

/// Client session state machine.
///
/// # Type Parameters
///
/// - `E`: Environment implementation for the local clock
pub struct Session<E: Environment> {
    env: E,
    credential: Credential,
    widths: Widths,
    state: ConnectionState,
    /// Transport is up, `Welcome` not yet received.
    handshaking: bool,
    initialized: bool,
    connections: u64,
    subscriptions: Subscriptions,
    ledger: PostLedger,
    time: TimeSync,
    backoff: Backoff,
}

impl<E: Environment> Session<E> {
    /// Create a disconnected session.
    pub fn new(env: E, credential: Credential, config: SessionConfig) -> Self {
        Self {
            env,
            credential,
            widths: config.widths,
            state: ConnectionState::Disconnected,
            handshaking: false,
            initialized: false,
            connections: 0,
            subscriptions: Subscriptions::new(),
            ledger: PostLedger::new(config.widths.room).with_history_limit(config.history_limit),
            time: TimeSync::new(config.offset_policy),
            backoff: Backoff::new(config.reconnect),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Configured widths.
    pub fn widths(&self) -> Widths {
        self.widths
    }

    /// Watched rooms in insertion order.
    pub fn watched(&self) -> impl Iterator<Item = &RoomId> + '_ {
        self.subscriptions.iter()
    }

    /// Ordered history of a room; empty if unknown.
    pub fn history(&self, room: &RoomId) -> &[Post] {
        self.ledger.history(room)
    }

    /// Shared handle to a room's history; see [`PostLedger::snapshot`].
    pub fn history_snapshot(&self, room: &RoomId) -> Arc<Vec<Post>> {
        self.ledger.snapshot(room)
    }

    /// Current clock offset estimate.
    pub fn offset(&self) -> Option<i64> {
        self.time.offset()
    }

    /// Estimated server clock now. Never lower than a previous result.
    pub fn server_time(&mut self) -> ServerTime {
        self.time.server_time(self.env.now_millis())
    }

    /// Process an event and return resulting actions.
    ///
    /// # Errors
    ///
    /// Returns `SessionError` for rejected embedder requests. Connection
    /// problems are not errors here; they come back as
    /// [`SessionAction::NotifyError`] alongside the recovery actions.
    pub fn handle(&mut self, event: SessionEvent) -> Result<Vec<SessionAction>, SessionError> {
        match event {
            SessionEvent::Start => Ok(self.handle_start()),
            SessionEvent::Connected => Ok(self.handle_connected()),
            SessionEvent::ConnectFailed { reason } => {
                Ok(self.handle_lost(ConnectionError::ConnectFailed { reason }))
            },
            SessionEvent::ConnectionLost { reason } => {
                Ok(self.handle_lost(ConnectionError::Lost { reason }))
            },
            SessionEvent::ReconnectDue => Ok(self.handle_reconnect_due()),
            SessionEvent::FrameReceived(frame) => Ok(self.handle_frame(frame)),
            SessionEvent::Watch { room } => self.handle_watch(room),
            SessionEvent::Unwatch { room, forget } => self.handle_unwatch(&room, forget),
            SessionEvent::SendPost { room, payload } => self.handle_send_post(room, payload),
            SessionEvent::TimePollDue => Ok(self.handle_time_poll()),
            SessionEvent::Shutdown => Ok(self.handle_shutdown()),
        }
    }

    fn transition(&mut self, next: ConnectionState, actions: &mut Vec<SessionAction>) {
        if self.state != next {
            self.state = next;
            actions.push(SessionAction::PublishState(next));
        }
    }

    fn handle_start(&mut self) -> Vec<SessionAction> {
        if self.state != ConnectionState::Disconnected {
            return vec![log(LogLevel::Debug, format!("start ignored in state {:?}", self.state))];
        }

        let mut actions = Vec::new();
        self.transition(ConnectionState::Connecting, &mut actions);
        actions.push(SessionAction::Connect);
        actions
    }

    fn handle_connected(&mut self) -> Vec<SessionAction> {
        if self.state != ConnectionState::Connecting {
            return vec![
                log(LogLevel::Debug, format!("dropping connection opened in state {:?}", self.state)),
                SessionAction::CloseConnection,
            ];
        }

        self.handshaking = true;
        vec![
            SessionAction::Send(Frame::Hello { credential: self.credential.clone() }),
            log(LogLevel::Debug, "transport up, waiting for welcome"),
        ]
    }

    fn handle_welcome(&mut self) -> Vec<SessionAction> {
        if !self.handshaking {
            return vec![log(LogLevel::Warn, format!("unexpected welcome in state {:?}", self.state))];
        }

        let mut actions = Vec::new();
        self.handshaking = false;
        self.transition(ConnectionState::Connected, &mut actions);
        self.backoff.reset();
        self.connections += 1;

        actions.push(SessionAction::Send(Frame::TimeRequest));
        for room in self.subscriptions.iter() {
            actions.push(SessionAction::Send(Frame::Watch { room: room.clone() }));
        }

        if self.connections > 1 {
            actions.push(log(
                LogLevel::Info,
                format!("reconnected, replayed {} watched rooms", self.subscriptions.len()),
            ));
        } else {
            actions.push(log(LogLevel::Info, "connected"));
        }

        if !self.initialized {
            self.initialized = true;
            actions.push(SessionAction::NotifyInit);
        }

        actions
    }

    fn handle_lost(&mut self, error: ConnectionError) -> Vec<SessionAction> {
        match self.state {
            ConnectionState::Closed => return Vec::new(),
            // A reconnect is already pending.
            ConnectionState::Disconnected => {
                return vec![log(LogLevel::Debug, format!("ignoring {error} while disconnected"))];
            },
            ConnectionState::Connecting | ConnectionState::Connected => {},
        }

        let mut actions = vec![log(LogLevel::Warn, error.to_string())];
        if self.state == ConnectionState::Connected || self.handshaking {
            actions.push(SessionAction::CloseConnection);
        }
        self.handshaking = false;

        match self.backoff.next_delay() {
            Some((delay, attempt)) => {
                self.transition(ConnectionState::Disconnected, &mut actions);
                actions.push(SessionAction::NotifyError(error.into()));
                actions.push(SessionAction::ScheduleReconnect { delay, attempt });
            },
            None => {
                let final_error = if self.backoff.policy().enabled {
                    ConnectionError::ReconnectExhausted { attempts: self.backoff.attempts() }
                } else {
                    error
                };
                self.transition(ConnectionState::Closed, &mut actions);
                actions.push(log(LogLevel::Error, final_error.to_string()));
                actions.push(SessionAction::NotifyError(final_error.into()));
            },
        }

        actions
    }

    fn handle_reconnect_due(&mut self) -> Vec<SessionAction> {
        if self.state != ConnectionState::Disconnected {
            return Vec::new();
        }

        let mut actions = vec![log(
            LogLevel::Debug,
            format!("reconnect attempt {}", self.backoff.attempts()),
        )];
        self.transition(ConnectionState::Connecting, &mut actions);
        actions.push(SessionAction::Connect);
        actions
    }

    fn handle_frame(&mut self, frame: Frame) -> Vec<SessionAction> {
        if self.handshaking {
            return match frame {
                Frame::Welcome => self.handle_welcome(),
                Frame::Rejected { reason } => self.handle_lost(ConnectionError::Rejected { reason }),
                other => vec![log(
                    LogLevel::Debug,
                    format!("dropping {:?} frame before welcome", other.opcode()),
                )],
            };
        }
        if self.state != ConnectionState::Connected {
            return vec![log(
                LogLevel::Debug,
                format!("dropping {:?} frame in state {:?}", frame.opcode(), self.state),
            )];
        }

        match frame {
            Frame::Posted { room, delivery, server_time, payload } => {
                self.handle_posted(room, payload, Delivery { id: delivery, server_time })
            },
            Frame::Time { server_time } => {
                let sample = TimeSample { local_at_receipt: self.env.now_millis(), server_time };
                let offset = self.time.observe(sample);
                vec![SessionAction::PublishOffset(offset)]
            },
            Frame::Rejected { reason } => self.handle_lost(ConnectionError::Rejected { reason }),
            Frame::Welcome => vec![log(LogLevel::Debug, "ignoring repeated welcome")],
            other => vec![log(
                LogLevel::Warn,
                format!("unexpected client frame from server: {:?}", other.opcode()),
            )],
        }
    }

    fn handle_posted(
        &mut self,
        room: RoomId,
        payload: Payload,
        delivery: Delivery,
    ) -> Vec<SessionAction> {
        match self.ledger.record(room, payload, delivery) {
            Ok(recorded) if recorded.duplicate => Vec::new(),
            Ok(recorded) => vec![SessionAction::NotifyPost(recorded.post.clone())],
            Err(e) => vec![log(LogLevel::Warn, format!("dropping post: {e}"))],
        }
    }

    fn check_room(&self, room: &RoomId) -> Result<(), ValidationError> {
        if room.width() != self.widths.room {
            return Err(ValidationError::RoomWidth {
                expected: self.widths.room,
                actual: room.width(),
            });
        }
        Ok(())
    }

    fn handle_watch(&mut self, room: RoomId) -> Result<Vec<SessionAction>, SessionError> {
        if self.state == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        self.check_room(&room)?;
        self.ledger.ensure_room(&room)?;

        if !self.subscriptions.watch(room.clone()) {
            return Ok(Vec::new());
        }
        if self.state == ConnectionState::Connected {
            return Ok(vec![SessionAction::Send(Frame::Watch { room })]);
        }

        Ok(vec![log(LogLevel::Debug, format!("watch {room} deferred until connected"))])
    }

    fn handle_unwatch(
        &mut self,
        room: &RoomId,
        forget: bool,
    ) -> Result<Vec<SessionAction>, SessionError> {
        if self.state == ConnectionState::Closed {
            return Err(SessionError::Closed);
        }
        self.check_room(room)?;

        if forget {
            self.ledger.forget(room);
        }
        if self.subscriptions.unwatch(room) && self.state == ConnectionState::Connected {
            return Ok(vec![SessionAction::Send(Frame::Unwatch { room: room.clone() })]);
        }

        Ok(Vec::new())
    }

    fn handle_send_post(
        &mut self,
        room: RoomId,
        payload: Payload,
    ) -> Result<Vec<SessionAction>, SessionError> {
        self.check_room(&room)?;
        if payload.width() != self.widths.payload {
            return Err(ValidationError::PayloadWidth {
                expected: self.widths.payload,
                actual: payload.width(),
            }
            .into());
        }

        match self.state {
            ConnectionState::Connected => Ok(vec![SessionAction::Send(Frame::Post { room, payload })]),
            ConnectionState::Closed => Err(SessionError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(SessionError::NotConnected)
            },
        }
    }

    fn handle_time_poll(&self) -> Vec<SessionAction> {
        if self.state == ConnectionState::Connected {
            vec![SessionAction::Send(Frame::TimeRequest)]
        } else {
            Vec::new()
        }
    }

    fn handle_shutdown(&mut self) -> Vec<SessionAction> {
        if self.state == ConnectionState::Closed {
            return Vec::new();
        }

        let mut actions = vec![log(LogLevel::Info, "shutting down")];
        self.handshaking = false;
        if matches!(self.state, ConnectionState::Connected | ConnectionState::Connecting) {
            actions.push(SessionAction::CloseConnection);
        }
        self.transition(ConnectionState::Closed, &mut actions);
        actions
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    };

    use proptest::prelude::*;
    use roomcast_proto::Opcode;

    use super::*;

    /// Manually set clock; sleeps complete immediately
    #[derive(Clone, Default)]
    struct TestEnv {
        now: Arc<AtomicI64>,
    }

    impl TestEnv {
        fn set(&self, millis: i64) {
            self.now.store(millis, Ordering::SeqCst);
        }
    }

    impl Environment for TestEnv {
        fn now_millis(&self) -> i64 {
            self.now.load(Ordering::SeqCst)
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            std::future::ready(())
        }
    }

    fn credential() -> Credential {
        Credential::parse("0x01").unwrap()
    }

    fn room(value: u64) -> RoomId {
        RoomId::from_u64(value, 8).unwrap()
    }

    fn payload(seed: u8) -> Payload {
        Payload::new(vec![seed; 32], 32).unwrap()
    }

    fn session_with(reconnect: ReconnectPolicy) -> (Session<TestEnv>, TestEnv) {
        let env = TestEnv::default();
        let config = SessionConfig { reconnect, ..SessionConfig::default() };
        (Session::new(env.clone(), credential(), config), env)
    }

    /// Frames the session sends, in order.
    fn sent_frames(actions: &[SessionAction]) -> Vec<&Frame> {
        actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::Send(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    fn count_sent(actions: &[SessionAction], opcode: Opcode) -> usize {
        sent_frames(actions).into_iter().filter(|frame| frame.opcode() == opcode).count()
    }

    fn welcome() -> SessionEvent {
        SessionEvent::FrameReceived(Frame::Welcome)
    }

    fn rejected() -> SessionEvent {
        SessionEvent::FrameReceived(Frame::Rejected { reason: "bad key".into() })
    }

    /// Transport up and credential accepted.
    fn handshake(session: &mut Session<TestEnv>) -> Vec<SessionAction> {
        let mut actions = session.handle(SessionEvent::Connected).unwrap();
        actions.extend(session.handle(welcome()).unwrap());
        actions
    }

    fn connected_session() -> (Session<TestEnv>, TestEnv) {
        let (mut session, env) = session_with(ReconnectPolicy::default());
        session.handle(SessionEvent::Start).unwrap();
        handshake(&mut session);
        (session, env)
    }

    fn has_init(actions: &[SessionAction]) -> bool {
        actions.iter().any(|action| matches!(action, SessionAction::NotifyInit))
    }

    fn notify_init_count(actions: &[SessionAction]) -> usize {
        actions.iter().filter(|action| matches!(action, SessionAction::NotifyInit)).count()
    }

    fn posted(room: RoomId, delivery: Option<u64>, payload: Payload) -> SessionEvent {
        SessionEvent::FrameReceived(Frame::Posted { room, delivery, server_time: None, payload })
    }

    #[test]
    fn start_requests_connect() {
        let (mut session, _) = session_with(ReconnectPolicy::default());
        let actions = session.handle(SessionEvent::Start).unwrap();

        assert_eq!(session.state(), ConnectionState::Connecting);
        assert!(actions.iter().any(|action| matches!(action, SessionAction::Connect)));
    }

    #[test]
    fn connect_sends_hello_and_waits_for_welcome() {
        let (mut session, _) = session_with(ReconnectPolicy::default());
        session.handle(SessionEvent::Start).unwrap();
        let actions = session.handle(SessionEvent::Connected).unwrap();

        let frames = sent_frames(&actions);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Frame::Hello { .. }));
        assert_eq!(notify_init_count(&actions), 0);
        assert_eq!(session.state(), ConnectionState::Connecting);

        let actions = session.handle(welcome()).unwrap();
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(count_sent(&actions, Opcode::TimeRequest), 1);
        assert_eq!(notify_init_count(&actions), 1);

        session.handle(SessionEvent::ConnectionLost { reason: "eof".into() }).unwrap();
        session.handle(SessionEvent::ReconnectDue).unwrap();
        let actions = handshake(&mut session);
        assert_eq!(notify_init_count(&actions), 0);
    }

    #[test]
    fn nothing_but_hello_goes_out_before_welcome() {
        let (mut session, _) = session_with(ReconnectPolicy::default());
        session.handle(SessionEvent::Start).unwrap();
        session.handle(SessionEvent::Connected).unwrap();

        let actions = session.handle(SessionEvent::Watch { room: room(1) }).unwrap();
        assert_eq!(count_sent(&actions, Opcode::Watch), 0);
        let result = session.handle(SessionEvent::SendPost { room: room(1), payload: payload(1) });
        assert_eq!(result.unwrap_err(), SessionError::NotConnected);
        assert!(session.handle(SessionEvent::TimePollDue).unwrap().is_empty());

        // Server frames other than the handshake reply are dropped.
        let actions = session.handle(posted(room(1), Some(1), payload(1))).unwrap();
        assert!(!actions.iter().any(|action| matches!(action, SessionAction::NotifyPost(_))));
        assert!(session.history(&room(1)).is_empty());

        let actions = session.handle(welcome()).unwrap();
        assert_eq!(count_sent(&actions, Opcode::Watch), 1);
    }

    #[test]
    fn rejected_handshake_spends_reconnect_budget() {
        let policy = ReconnectPolicy { max_attempts: Some(2), ..ReconnectPolicy::default() };
        let (mut session, _) = session_with(policy);
        session.handle(SessionEvent::Start).unwrap();
        let mut inits = usize::from(has_init(&handshake(&mut session)));

        session.handle(SessionEvent::ConnectionLost { reason: "eof".into() }).unwrap();
        let mut last = Vec::new();
        for _ in 0..2 {
            session.handle(SessionEvent::ReconnectDue).unwrap();
            last = session.handle(SessionEvent::Connected).unwrap();
            last.extend(session.handle(rejected()).unwrap());
            inits += usize::from(has_init(&last));
        }

        assert_eq!(inits, 1);
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(last.iter().any(|action| matches!(action, SessionAction::CloseConnection)));
        assert!(last.iter().any(|action| matches!(
            action,
            SessionAction::NotifyError(SessionError::Connection(
                ConnectionError::ReconnectExhausted { attempts: 2 }
            ))
        )));
    }

    #[test]
    fn welcome_outside_handshake_is_ignored() {
        let (mut session, _) = connected_session();
        let actions = session.handle(welcome()).unwrap();

        assert_eq!(session.state(), ConnectionState::Connected);
        assert!(sent_frames(&actions).is_empty());
        assert_eq!(notify_init_count(&actions), 0);
    }

    #[test]
    fn watch_while_connected_sends_once() {
        let (mut session, _) = connected_session();

        let first = session.handle(SessionEvent::Watch { room: room(0x123) }).unwrap();
        let second = session.handle(SessionEvent::Watch { room: room(0x123) }).unwrap();

        assert_eq!(count_sent(&first, Opcode::Watch), 1);
        assert_eq!(count_sent(&second, Opcode::Watch), 0);
    }

    #[test]
    fn watch_before_connect_is_sent_on_connect() {
        let (mut session, _) = session_with(ReconnectPolicy::default());
        let actions = session.handle(SessionEvent::Watch { room: room(1) }).unwrap();
        assert_eq!(count_sent(&actions, Opcode::Watch), 0);

        session.handle(SessionEvent::Start).unwrap();
        let actions = handshake(&mut session);
        assert_eq!(count_sent(&actions, Opcode::Watch), 1);
    }

    #[test]
    fn reconnect_replays_watches_in_insertion_order() {
        let (mut session, _) = connected_session();
        for value in [3, 1, 2, 1, 3] {
            session.handle(SessionEvent::Watch { room: room(value) }).unwrap();
        }

        session.handle(SessionEvent::ConnectionLost { reason: "reset".into() }).unwrap();
        session.handle(SessionEvent::ReconnectDue).unwrap();
        let actions = handshake(&mut session);

        let replayed: Vec<RoomId> = sent_frames(&actions)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Watch { room } => Some(room.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(replayed, vec![room(3), room(1), room(2)]);
    }

    #[test]
    fn unwatch_sends_frame_and_keeps_history_unless_forgotten() {
        let (mut session, _) = connected_session();
        session.handle(SessionEvent::Watch { room: room(1) }).unwrap();
        session.handle(posted(room(1), None, payload(1))).unwrap();

        let actions = session.handle(SessionEvent::Unwatch { room: room(1), forget: false }).unwrap();
        assert_eq!(count_sent(&actions, Opcode::Unwatch), 1);
        assert_eq!(session.history(&room(1)).len(), 1);

        let actions = session.handle(SessionEvent::Unwatch { room: room(1), forget: true }).unwrap();
        assert_eq!(count_sent(&actions, Opcode::Unwatch), 0);
        assert!(session.history(&room(1)).is_empty());
    }

    #[test]
    fn send_post_requires_connection() {
        let (mut session, _) = session_with(ReconnectPolicy::default());
        let result = session.handle(SessionEvent::SendPost { room: room(1), payload: payload(1) });
        assert_eq!(result.unwrap_err(), SessionError::NotConnected);
    }

    #[test]
    fn send_post_rejects_wrong_width_without_sending() {
        let (mut session, _) = connected_session();
        let short = Payload::new(vec![0u8; 16], 16).unwrap();

        let result = session.handle(SessionEvent::SendPost { room: room(1), payload: short });
        assert_eq!(
            result.unwrap_err(),
            SessionError::Validation(ValidationError::PayloadWidth { expected: 32, actual: 16 })
        );
        assert!(session.history(&room(1)).is_empty());
        assert_eq!(session.watched().count(), 0);
    }

    #[test]
    fn send_post_emits_single_post_frame() {
        let (mut session, _) = connected_session();
        session.handle(SessionEvent::Watch { room: room(0x123) }).unwrap();

        let actions =
            session.handle(SessionEvent::SendPost { room: room(0x123), payload: payload(9) }).unwrap();
        assert_eq!(count_sent(&actions, Opcode::Post), 1);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn posted_frame_notifies_with_post() {
        let (mut session, _) = connected_session();
        let actions = session.handle(posted(room(1), Some(10), payload(4))).unwrap();

        let posts: Vec<&Post> = actions
            .iter()
            .filter_map(|action| match action {
                SessionAction::NotifyPost(post) => Some(post),
                _ => None,
            })
            .collect();
        assert_eq!(actions.len(), 1);
        assert_eq!(posts[0].payload, payload(4));
        assert_eq!(posts[0].index, 0);
        assert_eq!(session.history(&room(1)).len(), 1);
    }

    #[test]
    fn duplicate_delivery_is_silent() {
        let (mut session, _) = connected_session();
        session.handle(posted(room(1), Some(10), payload(4))).unwrap();

        let actions = session.handle(posted(room(1), Some(10), payload(4))).unwrap();
        assert!(actions.is_empty());
        assert_eq!(session.history(&room(1)).len(), 1);
    }

    #[test]
    fn time_samples_update_offset() {
        let (mut session, env) = connected_session();
        assert_eq!(session.server_time(), ServerTime::Unsynced);

        env.set(900);
        let actions =
            session.handle(SessionEvent::FrameReceived(Frame::Time { server_time: 1000 })).unwrap();
        assert!(matches!(actions[..], [SessionAction::PublishOffset(100)]));

        env.set(951);
        session.handle(SessionEvent::FrameReceived(Frame::Time { server_time: 1050 })).unwrap();
        assert_eq!(session.offset(), Some(99));
        assert_eq!(session.server_time(), ServerTime::Synced(1050));
    }

    #[test]
    fn lost_connection_schedules_backoff() {
        let policy = ReconnectPolicy {
            enabled: true,
            initial_delay_ms: 50,
            max_delay_ms: 1_000,
            max_attempts: None,
        };
        let (mut session, _) = session_with(policy);
        session.handle(SessionEvent::Start).unwrap();
        handshake(&mut session);

        let actions = session.handle(SessionEvent::ConnectionLost { reason: "eof".into() }).unwrap();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(actions.iter().any(|action| matches!(
            action,
            SessionAction::ScheduleReconnect { delay, attempt: 1 } if *delay == Duration::from_millis(50)
        )));
        assert!(actions.iter().any(|action| matches!(action, SessionAction::CloseConnection)));

        session.handle(SessionEvent::ReconnectDue).unwrap();
        let actions = session.handle(SessionEvent::ConnectFailed { reason: "refused".into() }).unwrap();
        assert!(actions.iter().any(|action| matches!(
            action,
            SessionAction::ScheduleReconnect { delay, attempt: 2 } if *delay == Duration::from_millis(100)
        )));
    }

    #[test]
    fn exhausted_reconnect_closes_session() {
        let policy = ReconnectPolicy { max_attempts: Some(1), ..ReconnectPolicy::default() };
        let (mut session, _) = session_with(policy);
        session.handle(SessionEvent::Start).unwrap();
        handshake(&mut session);

        session.handle(SessionEvent::ConnectionLost { reason: "eof".into() }).unwrap();
        session.handle(SessionEvent::ReconnectDue).unwrap();
        let actions = session.handle(SessionEvent::ConnectFailed { reason: "refused".into() }).unwrap();

        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(actions.iter().any(|action| matches!(
            action,
            SessionAction::NotifyError(SessionError::Connection(
                ConnectionError::ReconnectExhausted { attempts: 1 }
            ))
        )));
        let result = session.handle(SessionEvent::Watch { room: room(1) });
        assert_eq!(result.unwrap_err(), SessionError::Closed);
    }

    #[test]
    fn disabled_reconnect_closes_on_loss() {
        let (mut session, _) = session_with(ReconnectPolicy::disabled());
        session.handle(SessionEvent::Start).unwrap();
        handshake(&mut session);

        let actions = session.handle(SessionEvent::ConnectionLost { reason: "eof".into() }).unwrap();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(actions.iter().any(|action| matches!(
            action,
            SessionAction::NotifyError(SessionError::Connection(ConnectionError::Lost { .. }))
        )));
    }

    #[test]
    fn rejected_frame_is_treated_as_lost_connection() {
        let (mut session, _) = connected_session();
        let actions = session.handle(rejected()).unwrap();

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(actions.iter().any(|action| matches!(
            action,
            SessionAction::NotifyError(SessionError::Connection(ConnectionError::Rejected { .. }))
        )));
    }

    #[test]
    fn shutdown_is_terminal() {
        let (mut session, _) = connected_session();
        let actions = session.handle(SessionEvent::Shutdown).unwrap();

        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(actions.iter().any(|action| matches!(action, SessionAction::CloseConnection)));

        let actions = session.handle(posted(room(1), None, payload(1))).unwrap();
        assert!(!actions.iter().any(|action| matches!(action, SessionAction::NotifyPost(_))));
        assert!(session.handle(SessionEvent::Shutdown).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn watch_count_is_independent_of_repeats(repeats in 1usize..10, reconnects in 0usize..4) {
            let (mut session, _) = session_with(ReconnectPolicy::default());
            let mut watch_frames = 0;

            for _ in 0..repeats {
                let actions = session.handle(SessionEvent::Watch { room: room(7) }).unwrap();
                watch_frames += count_sent(&actions, Opcode::Watch);
            }
            session.handle(SessionEvent::Start).unwrap();
            let actions = handshake(&mut session);
            watch_frames += count_sent(&actions, Opcode::Watch);
            prop_assert_eq!(watch_frames, 1);

            for _ in 0..reconnects {
                session.handle(SessionEvent::ConnectionLost { reason: "drop".into() }).unwrap();
                session.handle(SessionEvent::ReconnectDue).unwrap();
                let actions = handshake(&mut session);
                prop_assert_eq!(count_sent(&actions, Opcode::Watch), 1);
            }
        }
    }
}
