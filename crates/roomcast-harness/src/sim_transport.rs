//! WebSocket transport over turmoil's simulated network.
//!
//! Same framing as the production connector (binary WebSocket messages),
//! but the TCP underneath is turmoil's, so tests control latency, loss and
//! partitions deterministically.

use std::error::Error;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use roomcast_client::{Connection, Connector, TransportError};
use roomcast_proto::{Frame, FrameCodec, Widths};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};
use turmoil::net::{TcpListener, TcpStream};

/// Connector dialing `ws://host:port/...` inside a turmoil simulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimConnector;

fn authority(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("ws://")?;
    let authority = rest.split('/').next()?;
    (!authority.is_empty()).then_some(authority)
}

#[async_trait]
impl Connector for SimConnector {
    type Connection = SimConnection;

    async fn connect(&self, url: &str) -> Result<SimConnection, TransportError> {
        let addr = authority(url).ok_or_else(|| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: "expected ws://host:port".to_string(),
        })?;

        let tcp = TcpStream::connect(addr).await.map_err(|e| TransportError::Connect(e.to_string()))?;
        let (ws, _response) = tokio_tungstenite::client_async(url, tcp)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        Ok(SimConnection { ws })
    }
}

/// Client end of a simulated WebSocket connection.
pub struct SimConnection {
    ws: WebSocketStream<TcpStream>,
}

#[async_trait]
impl Connection for SimConnection {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.ws.send(Message::Binary(message)).await.map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {},
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        // The server may already be gone.
        let _ = self.ws.close(None).await;
    }
}

/// Server side of the simulation: accepts WebSocket clients on a port.
pub struct SimServer {
    listener: TcpListener,
    codec: FrameCodec,
}

impl SimServer {
    /// Listen on `0.0.0.0:port` of the current turmoil host.
    pub async fn bind(port: u16, widths: Widths) -> Result<Self, Box<dyn Error>> {
        let listener = TcpListener::bind(format!("0.0.0.0:{port}").as_str()).await?;
        Ok(Self { listener, codec: FrameCodec::new(widths) })
    }

    /// Accept the next client and complete the WebSocket handshake.
    pub async fn accept(&self) -> Result<SimServerConn, Box<dyn Error>> {
        let (tcp, _peer) = self.listener.accept().await?;
        let ws = tokio_tungstenite::accept_async(tcp).await?;
        Ok(SimServerConn { ws, codec: self.codec })
    }
}

/// Server end of a simulated WebSocket connection, speaking frames.
pub struct SimServerConn {
    ws: WebSocketStream<TcpStream>,
    codec: FrameCodec,
}

impl SimServerConn {
    /// Encode and send a frame.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Box<dyn Error>> {
        let message = self.codec.encode_to_bytes(frame)?;
        self.ws.send(Message::Binary(message)).await?;
        Ok(())
    }

    /// Next frame from the client, `None` once it closed.
    pub async fn recv_frame(&mut self) -> Result<Option<Frame>, Box<dyn Error>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(self.codec.decode(data)?)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => {},
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
