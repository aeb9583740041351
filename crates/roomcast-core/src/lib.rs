//! Roomcast client core.
//!
//! Sans-IO building blocks of the Roomcast client: the session state
//! machine and the state it owns (watched rooms, post ledger, clock offset,
//! reconnect backoff). Nothing here performs I/O; the driver in
//! `roomcast-client` feeds events in and executes the returned actions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod env;
pub mod error;
pub mod ledger;
pub mod session;
pub mod subscriptions;
pub mod time_sync;

pub use backoff::{Backoff, ReconnectPolicy};
pub use env::Environment;
pub use error::{ConnectionError, SessionError, ValidationError};
pub use ledger::{Delivery, Post, PostLedger, Recorded};
pub use session::{
    ConnectionState, LogLevel, Session, SessionAction, SessionConfig, SessionEvent,
};
pub use subscriptions::Subscriptions;
pub use time_sync::{OffsetPolicy, ServerTime, TimeSample, TimeSync};
