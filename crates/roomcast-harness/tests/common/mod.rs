//! Shared fixtures for client integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use roomcast_client::{ClientConfig, ReconnectPolicy};
use roomcast_harness::ServerConn;
use roomcast_proto::{Frame, Payload, RoomId, Widths};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const KEY: &str = "0x00000000000000000000000000000000000000000000000000000000000000ff";
pub const ROOM: &str = "0x123";

pub const WIDTHS: Widths = Widths { room: 8, payload: 32 };

/// Config for the mock transport: no periodic time polls, so the only
/// sleeps a test sees are reconnect delays.
pub fn config() -> ClientConfig {
    let mut config = ClientConfig::new("mock://server", KEY).unwrap();
    config.time_sync.poll_interval_ms = 0;
    config.reconnect = ReconnectPolicy {
        enabled: true,
        initial_delay_ms: 100,
        max_delay_ms: 1_000,
        max_attempts: None,
    };
    config
}

/// Route client logs to the test writer, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(filter)
        .try_init();
}

pub fn room(hex: &str) -> RoomId {
    RoomId::parse(hex, WIDTHS.room).unwrap()
}

pub fn payload_hex(seed: u8) -> String {
    format!("0x{}", format!("{seed:02x}").repeat(WIDTHS.payload))
}

pub fn payload(seed: u8) -> Payload {
    Payload::parse(&payload_hex(seed), WIDTHS.payload).unwrap()
}

pub async fn next_frame(conn: &mut ServerConn) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), conn.recv_frame())
        .await
        .expect("timed out waiting for a client frame")
        .expect("client closed the connection")
        .unwrap()
}

/// Consume the frames every connection starts with.
pub async fn expect_handshake(conn: &mut ServerConn) {
    assert!(matches!(next_frame(conn).await, Frame::Hello { .. }));
    assert_eq!(next_frame(conn).await, Frame::TimeRequest);
}

/// Poll `check` until it holds, giving the driver task time to run.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..2_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(check(), "condition not met in time");
}

/// Let the driver drain anything already queued.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
