//! Client facade and driver task.
//!
//! [`ClientBuilder::connect`] opens the first connection and spawns the
//! driver task. The driver owns the connection and feeds the shared
//! [`Session`] one event at a time: commands from [`ClientHandle`]s,
//! inbound messages, and timer expiries. It executes the resulting actions
//! itself, so callbacks run on the same serialized path as ledger updates.
//!
//! The session lock is never held while a callback runs; callbacks may call
//! any [`ClientHandle`] method.
//!
//! A connection only counts once the server sends `Welcome` for the `Hello`
//! credential. On the first connect the driver waits for it inline, so a
//! refused key fails [`ClientBuilder::connect`] instead of retrying.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use roomcast_core::{
    ConnectionError, ConnectionState, Environment, LogLevel, Post, ServerTime, Session,
    SessionAction, SessionEvent, ValidationError,
};
use roomcast_proto::{Frame, FrameCodec, Payload, RoomId, TokenError, Widths};
use tokio::{
    sync::{Notify, mpsc},
    task::JoinHandle,
};

use crate::{
    config::ClientConfig,
    error::ClientError,
    system_env::SystemEnv,
    transport::{Connection, Connector, TransportError, WsConnector},
};

/// Called once, after the server first accepts the key.
pub type InitCallback<E> = Box<dyn FnOnce(&ClientHandle<E>) + Send>;

/// Called for every new post with the room's updated history.
pub type PostCallback = Box<dyn FnMut(&Post, &[Post]) + Send>;

/// Called for errors that happen outside an action call.
pub type ErrorCallback = Box<dyn FnMut(&ClientError) + Send>;

type Timer = Pin<Box<dyn Future<Output = ()> + Send>>;

enum Command {
    Event(SessionEvent),
    Shutdown,
}

/// Cheap, cloneable access to a running client.
///
/// Action methods validate their input, enqueue a command for the driver
/// and return immediately. They never block, so they are safe to call from
/// inside callbacks.
#[derive(Clone)]
pub struct ClientHandle<E: Environment = SystemEnv> {
    session: Arc<Mutex<Session<E>>>,
    commands: mpsc::UnboundedSender<Command>,
    widths: Widths,
}

impl<E: Environment> ClientHandle<E> {
    fn lock(&self) -> MutexGuard<'_, Session<E>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, event: SessionEvent) -> Result<(), ClientError> {
        self.commands.send(Command::Event(event)).map_err(|_| ClientError::Closed)
    }

    fn parse_room(&self, room: &str) -> Result<RoomId, ClientError> {
        Ok(RoomId::parse(room, self.widths.room)?)
    }

    /// Watch a room. Watching an already watched room is a no-op.
    ///
    /// While disconnected the watch is recorded and sent on the next
    /// connect.
    ///
    /// # Errors
    ///
    /// - `ClientError::Validation` if `room` is not valid hex or too wide
    /// - `ClientError::Closed` after shutdown or a final connection failure
    pub fn watch_room(&self, room: &str) -> Result<(), ClientError> {
        let room = self.parse_room(room)?;
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }
        self.submit(SessionEvent::Watch { room })
    }

    /// Stop watching a room. Its history is kept.
    ///
    /// # Errors
    ///
    /// Same as [`ClientHandle::watch_room`].
    pub fn unwatch_room(&self, room: &str) -> Result<(), ClientError> {
        self.unwatch(room, false)
    }

    /// Stop watching a room and drop its history.
    ///
    /// # Errors
    ///
    /// Same as [`ClientHandle::watch_room`].
    pub fn forget_room(&self, room: &str) -> Result<(), ClientError> {
        self.unwatch(room, true)
    }

    fn unwatch(&self, room: &str, forget: bool) -> Result<(), ClientError> {
        let room = self.parse_room(room)?;
        if self.state() == ConnectionState::Closed {
            return Err(ClientError::Closed);
        }
        self.submit(SessionEvent::Unwatch { room, forget })
    }

    /// Publish a payload to a room.
    ///
    /// The post is not recorded locally; it shows up through the on-post
    /// callback once the server delivers it.
    ///
    /// # Errors
    ///
    /// - `ClientError::Validation` for a malformed room or a payload that is
    ///   not exactly the configured width; nothing is sent
    /// - `ClientError::NotConnected` while disconnected or reconnecting
    /// - `ClientError::Closed` after shutdown or a final connection failure
    pub fn send_post(&self, room: &str, payload: &str) -> Result<(), ClientError> {
        let room = self.parse_room(room)?;
        let payload = Payload::parse(payload, self.widths.payload).map_err(|e| match e {
            TokenError::WrongWidth { expected, actual } => {
                ValidationError::PayloadWidth { expected, actual }
            },
            other => ValidationError::Token(other),
        })?;

        match self.state() {
            ConnectionState::Connected => self.submit(SessionEvent::SendPost { room, payload }),
            ConnectionState::Closed => Err(ClientError::Closed),
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                Err(ClientError::NotConnected)
            },
        }
    }

    /// Estimated server clock in milliseconds, or `Unsynced` before the
    /// first time sample.
    pub fn get_time(&self) -> ServerTime {
        self.lock().server_time()
    }

    /// Ordered history of a room; empty if nothing was received for it.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Validation` if `room` is malformed.
    pub fn history(&self, room: &str) -> Result<Vec<Post>, ClientError> {
        let room = self.parse_room(room)?;
        Ok(self.lock().history(&room).to_vec())
    }

    /// Watched rooms in the order they were first watched.
    pub fn watched(&self) -> Vec<RoomId> {
        self.lock().watched().cloned().collect()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.lock().state()
    }
}

/// Builder for [`Client`]: configuration, transport and callbacks.
pub struct ClientBuilder<C: Connector = WsConnector, E: Environment = SystemEnv> {
    config: ClientConfig,
    connector: C,
    env: E,
    on_init: Option<InitCallback<E>>,
    on_post: Option<PostCallback>,
    on_error: Option<ErrorCallback>,
}

impl<C: Connector, E: Environment> ClientBuilder<C, E> {
    /// Builder with an explicit transport and environment.
    pub fn with_transport(config: ClientConfig, connector: C, env: E) -> Self {
        Self { config, connector, env, on_init: None, on_post: None, on_error: None }
    }

    /// Register the on-init callback. It fires exactly once, after the server
    /// first accepts the key and before [`ClientBuilder::connect`] returns.
    #[must_use]
    pub fn on_init(mut self, callback: impl FnOnce(&ClientHandle<E>) + Send + 'static) -> Self {
        self.on_init = Some(Box::new(callback));
        self
    }

    /// Register the on-post callback.
    #[must_use]
    pub fn on_post(mut self, callback: impl FnMut(&Post, &[Post]) + Send + 'static) -> Self {
        self.on_post = Some(Box::new(callback));
        self
    }

    /// Register the error callback for dropped connections, server
    /// rejections and the final reconnect failure.
    #[must_use]
    pub fn on_error(mut self, callback: impl FnMut(&ClientError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    /// Connect and start the driver task. Must be called inside a tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// - `ClientError::Config` if the configuration is invalid
    /// - `ClientError::Connection` if the first connect fails, the server
    ///   rejects the key, or no welcome arrives within the handshake
    ///   timeout; reconnect only applies to connections that were
    ///   established once
    pub async fn connect(self) -> Result<Client<E>, ClientError> {
        self.config.validate()?;

        let widths = self.config.widths();
        let session =
            Session::new(self.env.clone(), self.config.key.clone(), self.config.session_config());
        let session = Arc::new(Mutex::new(session));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = ClientHandle { session: Arc::clone(&session), commands: commands_tx, widths };
        let stop = Arc::new(Notify::new());

        let mut driver = Driver {
            connector: self.connector,
            url: self.config.url.clone(),
            env: self.env,
            session,
            codec: FrameCodec::new(widths),
            conn: None,
            commands: commands_rx,
            on_init: self.on_init.map(|callback| (callback, handle.clone())),
            on_post: self.on_post,
            on_error: self.on_error,
            reconnect: None,
            poll: None,
            poll_interval: self.config.time_sync.poll_interval(),
            handshake: None,
            handshake_timeout: self.config.handshake_timeout(),
            stop: Arc::clone(&stop),
        };

        driver.start().await?;
        tracing::info!("client connected to {}", self.config.url);

        let task = tokio::spawn(driver.run());
        Ok(Client { handle, task, stop })
    }
}

/// A running client.
///
/// Dropping the client without [`Client::shutdown`] stops the driver once
/// every [`ClientHandle`] clone is gone too.
pub struct Client<E: Environment = SystemEnv> {
    handle: ClientHandle<E>,
    task: JoinHandle<()>,
    stop: Arc<Notify>,
}

impl Client<SystemEnv> {
    /// Builder using the WebSocket transport and the system clock.
    pub fn builder(config: ClientConfig) -> ClientBuilder<WsConnector, SystemEnv> {
        ClientBuilder::with_transport(config, WsConnector::new(), SystemEnv::new())
    }
}

impl<E: Environment> Client<E> {
    /// A cloneable handle for use in callbacks or other tasks.
    pub fn handle(&self) -> ClientHandle<E> {
        self.handle.clone()
    }

    /// See [`ClientHandle::watch_room`].
    ///
    /// # Errors
    ///
    /// See [`ClientHandle::watch_room`].
    pub fn watch_room(&self, room: &str) -> Result<(), ClientError> {
        self.handle.watch_room(room)
    }

    /// See [`ClientHandle::unwatch_room`].
    ///
    /// # Errors
    ///
    /// See [`ClientHandle::unwatch_room`].
    pub fn unwatch_room(&self, room: &str) -> Result<(), ClientError> {
        self.handle.unwatch_room(room)
    }

    /// See [`ClientHandle::send_post`].
    ///
    /// # Errors
    ///
    /// See [`ClientHandle::send_post`].
    pub fn send_post(&self, room: &str, payload: &str) -> Result<(), ClientError> {
        self.handle.send_post(room, payload)
    }

    /// See [`ClientHandle::get_time`].
    pub fn get_time(&self) -> ServerTime {
        self.handle.get_time()
    }

    /// See [`ClientHandle::history`].
    ///
    /// # Errors
    ///
    /// See [`ClientHandle::history`].
    pub fn history(&self, room: &str) -> Result<Vec<Post>, ClientError> {
        self.handle.history(room)
    }

    /// See [`ClientHandle::state`].
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Close the connection and stop the driver.
    ///
    /// Callbacks already running finish first. A reconnect attempt in flight
    /// is abandoned. No callback fires after this returns.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        if self.handle.commands.send(Command::Shutdown).is_err() {
            tracing::debug!("driver already stopped");
        }
        if let Err(e) = self.task.await {
            tracing::error!("driver task failed: {}", e);
        }
    }
}

enum Step {
    Command(Option<Command>),
    Inbound(Option<Result<Bytes, TransportError>>),
    ReconnectDue,
    PollDue,
    HandshakeExpired,
}

struct Driver<C: Connector, E: Environment> {
    connector: C,
    url: String,
    env: E,
    session: Arc<Mutex<Session<E>>>,
    codec: FrameCodec,
    conn: Option<C::Connection>,
    commands: mpsc::UnboundedReceiver<Command>,
    on_init: Option<(InitCallback<E>, ClientHandle<E>)>,
    on_post: Option<PostCallback>,
    on_error: Option<ErrorCallback>,
    reconnect: Option<Timer>,
    poll: Option<Timer>,
    poll_interval: Option<Duration>,
    /// Armed while a reconnect waits for `Welcome`.
    handshake: Option<Timer>,
    handshake_timeout: Duration,
    stop: Arc<Notify>,
}

impl<C: Connector, E: Environment> Driver<C, E> {
    fn lock(&self) -> MutexGuard<'_, Session<E>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed one event to the session. Rejected commands become error
    /// notifications.
    fn apply(&self, event: SessionEvent) -> Vec<SessionAction> {
        let result = self.lock().handle(event);
        result.unwrap_or_else(|e| vec![SessionAction::NotifyError(e)])
    }

    fn timer(&self, delay: Duration) -> Timer {
        let env = self.env.clone();
        Box::pin(async move { env.sleep(delay).await })
    }

    /// First connect. Failure is returned instead of scheduling a retry.
    async fn start(&mut self) -> Result<(), ClientError> {
        for action in self.apply(SessionEvent::Start) {
            if !matches!(action, SessionAction::Connect) {
                self.execute(vec![action]).await;
                continue;
            }

            let conn = self.connector.connect(&self.url).await.map_err(|e| {
                ClientError::from(ConnectionError::ConnectFailed { reason: e.to_string() })
            })?;
            self.conn = Some(conn);

            let actions = self.apply(SessionEvent::Connected);
            self.execute(actions).await;

            let timeout = self.handshake_timeout;
            let result = match tokio::time::timeout(timeout, self.await_welcome()).await {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::ConnectFailed {
                    reason: format!("no welcome within {timeout:?}"),
                }),
            };
            if let Err(e) = result {
                if let Some(mut conn) = self.conn.take() {
                    conn.close().await;
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Read frames until the server accepts the credential.
    ///
    /// A `Rejected` reply is returned as is and never reaches the session, so
    /// the first connect does not schedule a retry.
    async fn await_welcome(&mut self) -> Result<(), ConnectionError> {
        while self.lock().state() != ConnectionState::Connected {
            let Some(conn) = self.conn.as_mut() else {
                return Err(ConnectionError::ConnectFailed {
                    reason: "connection dropped during handshake".to_string(),
                });
            };
            let message = match conn.recv().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    return Err(ConnectionError::ConnectFailed { reason: e.to_string() });
                },
                None => {
                    return Err(ConnectionError::ConnectFailed {
                        reason: "closed by peer during handshake".to_string(),
                    });
                },
            };

            match self.codec.decode(message) {
                Ok(Frame::Rejected { reason }) => return Err(ConnectionError::Rejected { reason }),
                Ok(frame) => {
                    let actions = self.apply(SessionEvent::FrameReceived(frame));
                    self.execute(actions).await;
                },
                Err(e) => tracing::warn!("skipping undecodable frame: {}", e),
            }
        }
        Ok(())
    }

    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                command = self.commands.recv() => Step::Command(command),
                inbound = recv_from(&mut self.conn) => Step::Inbound(inbound),
                () = wait(&mut self.reconnect) => Step::ReconnectDue,
                () = wait(&mut self.poll) => Step::PollDue,
                () = wait(&mut self.handshake) => Step::HandshakeExpired,
            };

            let actions = match step {
                Step::Command(Some(Command::Event(event))) => self.apply(event),
                Step::Command(Some(Command::Shutdown) | None) => {
                    let actions = self.apply(SessionEvent::Shutdown);
                    self.execute(actions).await;
                    break;
                },
                Step::Inbound(Some(Ok(message))) => match self.codec.decode(message) {
                    Ok(frame) => self.apply(SessionEvent::FrameReceived(frame)),
                    Err(e) => {
                        tracing::warn!("skipping undecodable frame: {}", e);
                        continue;
                    },
                },
                Step::Inbound(Some(Err(e))) => {
                    self.conn = None;
                    self.apply(SessionEvent::ConnectionLost { reason: e.to_string() })
                },
                Step::Inbound(None) => {
                    self.conn = None;
                    self.apply(SessionEvent::ConnectionLost { reason: "closed by peer".to_string() })
                },
                Step::ReconnectDue => self.apply(SessionEvent::ReconnectDue),
                Step::PollDue => {
                    self.poll = self.poll_interval.map(|interval| self.timer(interval));
                    self.apply(SessionEvent::TimePollDue)
                },
                Step::HandshakeExpired => {
                    let reason = format!("no welcome within {:?}", self.handshake_timeout);
                    self.apply(SessionEvent::ConnectionLost { reason })
                },
            };
            self.execute(actions).await;

            if self.lock().state() == ConnectionState::Closed {
                break;
            }
        }

        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        tracing::debug!("driver stopped");
    }

    async fn execute(&mut self, actions: Vec<SessionAction>) {
        let mut queue = VecDeque::from(actions);

        while let Some(action) = queue.pop_front() {
            match action {
                SessionAction::Send(frame) => {
                    if let Err(e) = self.send(&frame).await {
                        self.conn = None;
                        let reason = e.to_string();
                        queue.extend(self.apply(SessionEvent::ConnectionLost { reason }));
                    }
                },

                SessionAction::Connect => {
                    let attempt = tokio::select! {
                        result = self.connector.connect(&self.url) => Some(result),
                        () = self.stop.notified() => None,
                    };
                    match attempt {
                        Some(Ok(conn)) => {
                            self.conn = Some(conn);
                            let expiry: Timer =
                                Box::pin(tokio::time::sleep(self.handshake_timeout));
                            self.handshake = Some(expiry);
                            queue.extend(self.apply(SessionEvent::Connected));
                        },
                        Some(Err(e)) => {
                            let reason = e.to_string();
                            queue.extend(self.apply(SessionEvent::ConnectFailed { reason }));
                        },
                        None => {
                            tracing::debug!("shutdown during reconnect attempt");
                            queue.extend(self.apply(SessionEvent::Shutdown));
                        },
                    }
                },

                SessionAction::ScheduleReconnect { delay, attempt } => {
                    tracing::info!("reconnect attempt {} in {:?}", attempt, delay);
                    self.reconnect = Some(self.timer(delay));
                },

                SessionAction::CloseConnection => {
                    if let Some(mut conn) = self.conn.take() {
                        conn.close().await;
                    }
                },

                SessionAction::NotifyInit => {
                    if let Some((callback, handle)) = self.on_init.take() {
                        callback(&handle);
                    }
                },

                SessionAction::NotifyPost(post) => {
                    if self.on_post.is_some() {
                        let history = self.lock().history_snapshot(&post.room);
                        if let Some(callback) = self.on_post.as_mut() {
                            callback(&post, history.as_slice());
                        }
                    }
                },

                SessionAction::NotifyError(err) => {
                    let err = ClientError::from(err);
                    tracing::warn!("{}", err);
                    if let Some(callback) = self.on_error.as_mut() {
                        callback(&err);
                    }
                },

                SessionAction::PublishOffset(offset) => {
                    tracing::debug!("server clock offset {} ms", offset);
                },

                SessionAction::PublishState(state) => {
                    tracing::debug!("connection state {:?}", state);
                    self.poll = match state {
                        ConnectionState::Connected => {
                            self.poll_interval.map(|interval| self.timer(interval))
                        },
                        _ => None,
                    };
                    if matches!(state, ConnectionState::Connected | ConnectionState::Closed) {
                        self.reconnect = None;
                    }
                    if state != ConnectionState::Connecting {
                        self.handshake = None;
                    }
                },

                SessionAction::Log { level, message } => match level {
                    LogLevel::Debug => tracing::debug!("{}", message),
                    LogLevel::Info => tracing::info!("{}", message),
                    LogLevel::Warn => tracing::warn!("{}", message),
                    LogLevel::Error => tracing::error!("{}", message),
                },
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let message = match self.codec.encode_to_bytes(frame) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!("dropping unencodable {:?} frame: {}", frame.opcode(), e);
                return Ok(());
            },
        };

        match self.conn.as_mut() {
            Some(conn) => conn.send(message).await,
            None => {
                tracing::debug!("no connection, dropping {:?} frame", frame.opcode());
                Ok(())
            },
        }
    }
}

async fn recv_from<T: Connection>(conn: &mut Option<T>) -> Option<Result<Bytes, TransportError>> {
    match conn {
        Some(conn) => conn.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait(timer: &mut Option<Timer>) {
    match timer {
        Some(sleep) => {
            sleep.await;
            *timer = None;
        },
        None => std::future::pending().await,
    }
}
