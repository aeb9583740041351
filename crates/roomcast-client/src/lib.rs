//! Roomcast client.
//!
//! Connects to a Roomcast server, watches rooms, publishes fixed-width
//! payloads and keeps an ordered per-room history of what the server
//! delivers. Reconnects with exponential backoff and replays room watches
//! after every reconnect.
//!
//! ## Architecture
//!
//! ```text
//! roomcast-client
//!   ├─ Client / ClientHandle  (public facade, non-blocking actions)
//!   ├─ Driver task            (select loop: commands, inbound, timers)
//!   │    └─ Session           (sans-IO state machine, roomcast-core)
//!   ├─ WsConnector            (WebSocket transport)
//!   └─ SystemEnv              (monotonic clock + tokio timers)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use roomcast_client::{Client, ClientConfig};
//!
//! # async fn run() -> Result<(), roomcast_client::ClientError> {
//! let config = ClientConfig::new(
//!     "ws://localhost:8080",
//!     "0x0000000000000000000000000000000000000000000000000000000000000001",
//! )?;
//!
//! let client = Client::builder(config)
//!     .on_init(|client| {
//!         let _ = client.watch_room("0x123");
//!     })
//!     .on_post(|post, history| {
//!         println!("{} has {} posts, latest {}", post.room, history.len(), post.payload);
//!     })
//!     .connect()
//!     .await?;
//!
//! println!("server time: {:?}", client.get_time());
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod config;
mod error;
mod system_env;
mod transport;

pub use client::{Client, ClientBuilder, ClientHandle, ErrorCallback, InitCallback, PostCallback};
pub use config::{ClientConfig, TimeSyncConfig};
pub use error::ClientError;
pub use roomcast_core::{
    ConnectionError, ConnectionState, Environment, OffsetPolicy, Post, ReconnectPolicy, ServerTime,
    ValidationError,
};
pub use roomcast_proto::{Payload, RoomId};
pub use system_env::SystemEnv;
pub use transport::{Connection, Connector, TransportError, WsConnection, WsConnector};
