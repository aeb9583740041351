//! Test harness for the Roomcast client.
//!
//! - [`SimEnv`]: manual clock; records every sleep so backoff schedules can
//!   be asserted exactly
//! - [`mock_pair`]: in-memory transport where the test plays the server one
//!   frame at a time
//! - [`SimConnector`] / [`SimServer`]: real WebSocket framing over turmoil's
//!   simulated TCP, for end-to-end runs under network faults
//!
//! # Example
//!
//! ```rust,ignore
//! let env = SimEnv::new();
//! let (connector, mut server) = mock_pair(Widths::default());
//! let client = ClientBuilder::with_transport(config, connector, env.clone())
//!     .connect()
//!     .await?;
//! let mut conn = server.accept().await.unwrap();
//! assert!(matches!(conn.recv_frame().await, Some(Ok(Frame::Hello { .. }))));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod mock_transport;
mod sim_env;
mod sim_transport;

pub use mock_transport::{MockConnection, MockConnector, MockServer, ServerConn, mock_pair};
pub use sim_env::SimEnv;
pub use sim_transport::{SimConnection, SimConnector, SimServer, SimServerConn};
