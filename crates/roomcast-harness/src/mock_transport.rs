//! In-memory transport with a scriptable server side.
//!
//! [`mock_pair`] returns a [`MockConnector`] to hand to the client and a
//! [`MockServer`] the test drives. Each successful connect produces one
//! [`ServerConn`]; dropping it looks like the server closing the socket.
//!
//! By default every connection starts with a queued `Welcome`, so the
//! client's credential handshake completes without the test taking part.
//! [`MockServer::reject_next`] queues `Rejected` instead, and
//! [`MockServer::manual_welcome`] leaves the reply to the test.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use roomcast_client::{Connection, Connector, TransportError};
use roomcast_proto::{CodecError, Frame, FrameCodec, Widths};
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct Script {
    attempts: usize,
    fail_next: usize,
    reject_next: usize,
    reject_reason: String,
    manual_welcome: bool,
    stall: bool,
}

impl Script {
    /// Frame to queue ahead of anything the test sends, if any.
    fn greeting(&mut self) -> Option<Frame> {
        if self.reject_next > 0 {
            self.reject_next -= 1;
            return Some(Frame::Rejected { reason: self.reject_reason.clone() });
        }
        (!self.manual_welcome).then_some(Frame::Welcome)
    }
}

/// Client-side connector backed by channels.
#[derive(Clone)]
pub struct MockConnector {
    script: Arc<Mutex<Script>>,
    accepted: mpsc::UnboundedSender<ServerConn>,
    codec: FrameCodec,
}

/// Test-side view of every connection the client opens.
pub struct MockServer {
    script: Arc<Mutex<Script>>,
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

/// Create a connected connector/server pair for the given widths.
pub fn mock_pair(widths: Widths) -> (MockConnector, MockServer) {
    let script = Arc::new(Mutex::new(Script::default()));
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

    let connector = MockConnector {
        script: Arc::clone(&script),
        accepted: accepted_tx,
        codec: FrameCodec::new(widths),
    };
    let server = MockServer { script, accepted: accepted_rx };
    (connector, server)
}

impl MockServer {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` connect attempts fail.
    pub fn fail_next(&self, count: usize) {
        self.script().fail_next = count;
    }

    /// Answer the next `count` connections with `Rejected` instead of
    /// `Welcome`.
    pub fn reject_next(&self, count: usize, reason: &str) {
        let mut script = self.script();
        script.reject_next = count;
        script.reject_reason = reason.to_string();
    }

    /// Stop queueing `Welcome`; the test answers the `Hello` itself.
    pub fn manual_welcome(&self) {
        self.script().manual_welcome = true;
    }

    /// Make connect attempts hang until the client gives up on them.
    pub fn stall_connects(&self) {
        self.script().stall = true;
    }

    /// Connect attempts so far, failed ones included.
    pub fn attempts(&self) -> usize {
        self.script().attempts
    }

    /// Next connection the client opened. `None` once every connector clone
    /// is gone.
    pub async fn accept(&mut self) -> Option<ServerConn> {
        self.accepted.recv().await
    }

    /// A connection if one is already waiting.
    pub fn try_accept(&mut self) -> Option<ServerConn> {
        self.accepted.try_recv().ok()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Connection = MockConnection;

    async fn connect(&self, _url: &str) -> Result<MockConnection, TransportError> {
        let greeting = {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            script.attempts += 1;
            if script.fail_next > 0 {
                script.fail_next -= 1;
                return Err(TransportError::Connect("scripted failure".to_string()));
            }
            (!script.stall).then(|| script.greeting())
        };
        let Some(greeting) = greeting else {
            return std::future::pending().await;
        };

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let conn = ServerConn { to_client: Some(to_client), from_client, codec: self.codec };
        if let Some(frame) = greeting {
            conn.send_frame(&frame)?;
        }

        self.accepted
            .send(conn)
            .map_err(|_| TransportError::Connect("server dropped".to_string()))?;

        Ok(MockConnection { to_server: Some(to_server), from_server })
    }
}

/// Client end of an in-memory connection.
pub struct MockConnection {
    to_server: Option<mpsc::UnboundedSender<Bytes>>,
    from_server: mpsc::UnboundedReceiver<Bytes>,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        let sender = self.to_server.as_ref().ok_or(TransportError::Closed)?;
        sender.send(message).map_err(|_| TransportError::Send("server hung up".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.to_server = None;
        self.from_server.close();
    }
}

/// Server end of an in-memory connection, speaking frames.
pub struct ServerConn {
    to_client: Option<mpsc::UnboundedSender<Bytes>>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
    codec: FrameCodec,
}

impl ServerConn {
    /// Encode and deliver a frame to the client.
    pub fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        let message =
            self.codec.encode_to_bytes(frame).map_err(|e| TransportError::Send(e.to_string()))?;
        self.send_raw(message)
    }

    /// Deliver raw bytes, valid frame or not.
    pub fn send_raw(&self, message: impl Into<Bytes>) -> Result<(), TransportError> {
        let sender = self.to_client.as_ref().ok_or(TransportError::Closed)?;
        sender.send(message.into()).map_err(|_| TransportError::Closed)
    }

    /// Next frame from the client. `None` once the client closed.
    pub async fn recv_frame(&mut self) -> Option<Result<Frame, CodecError>> {
        let message = self.from_client.recv().await?;
        Some(self.codec.decode(message))
    }

    /// A frame if one is already waiting.
    pub fn try_recv_frame(&mut self) -> Option<Result<Frame, CodecError>> {
        let message = self.from_client.try_recv().ok()?;
        Some(self.codec.decode(message))
    }

    /// Hang up. The client sees the connection drop.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}
