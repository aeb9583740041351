//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples session logic from the system clock and
//! from timers. Production code uses the wall clock and tokio timers; tests
//! use a manual clock so time samples and reconnect backoff are exact.
//!
//! # Invariants
//!
//! - `now_millis()` is the local clock in milliseconds since the Unix
//!   epoch, the same scale the server reports its time in
//! - Monotonicity: `now_millis()` never goes backwards, even when the system
//!   wall clock is adjusted
//! - Isolation: implementations must not share global state, so several
//!   clients can run side by side in one process

use std::time::Duration;

/// Abstract environment providing the local clock and async sleeping.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Local clock, milliseconds since the Unix epoch.
    ///
    /// Subsequent calls must return values >= previous calls.
    fn now_millis(&self) -> i64;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code awaits this (reconnect backoff, time polling); the
    /// session state machine never sleeps.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;
}
