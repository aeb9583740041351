//! Pluggable message transport.
//!
//! A [`Connector`] opens [`Connection`]s; a connection carries whole binary
//! messages, one encoded frame each. [`WsConnector`] is the production
//! implementation over WebSocket binary messages. Tests plug in an
//! in-memory connector instead.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite::Message};

/// Transport-level I/O failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The endpoint URL cannot be used by this transport.
    #[error("invalid url {url}: {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Opening the connection failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Opening the connection took too long.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// Writing a message failed.
    #[error("send failed: {0}")]
    Send(String),

    /// Reading a message failed.
    #[error("receive failed: {0}")]
    Receive(String),

    /// The connection is already closed.
    #[error("connection closed")]
    Closed,
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by this connector.
    type Connection: Connection;

    /// Open a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Self::Connection, TransportError>;
}

/// One open, message-oriented connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Write one message.
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError>;

    /// Read the next message. `None` means the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>>;

    /// Close the connection. Errors are ignored.
    async fn close(&mut self);
}

/// WebSocket connector using tokio-tungstenite.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self { connect_timeout: Duration::from_secs(10) }
    }
}

impl WsConnector {
    /// Connector with the default 10s connect timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Connection = WsConnection;

    async fn connect(&self, url: &str) -> Result<WsConnection, TransportError> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl {
                url: url.to_string(),
                reason: "expected ws:// or wss://".to_string(),
            });
        }

        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| TransportError::Timeout(self.connect_timeout))?
                .map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!("websocket connected to {}", url);
        let (sink, stream) = stream.split();
        Ok(WsConnection { sink, stream })
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open WebSocket connection.
pub struct WsConnection {
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.sink
            .send(Message::Binary(message))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(frame)) => {
                    tracing::debug!("websocket closed by peer: {:?}", frame);
                    return None;
                },
                Ok(Message::Text(_)) => {
                    tracing::warn!("ignoring text message on binary protocol");
                },
                // Ping/pong are answered by tungstenite.
                Ok(_) => {},
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            tracing::debug!("websocket close failed: {}", e);
        }
    }
}
