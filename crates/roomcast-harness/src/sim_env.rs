//! Manual-clock environment.
//!
//! Time only moves when a test calls [`SimEnv::advance`] or
//! [`SimEnv::set_now`]. Every sleep is recorded, so tests can assert the
//! exact backoff schedule and then release it by advancing the clock.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use roomcast_core::Environment;
use tokio::sync::{Notify, watch};

struct Clock {
    now: watch::Sender<i64>,
    sleeps: Mutex<Vec<Duration>>,
    slept: Notify,
}

/// Environment with a manually advanced clock.
#[derive(Clone)]
pub struct SimEnv {
    clock: Arc<Clock>,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Clock starting at 0 ms.
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Clock starting at `millis`.
    pub fn starting_at(millis: i64) -> Self {
        let (now, _) = watch::channel(millis);
        Self { clock: Arc::new(Clock { now, sleeps: Mutex::new(Vec::new()), slept: Notify::new() }) }
    }

    /// Jump the clock to `millis`. Sleeps whose deadline has passed complete.
    pub fn set_now(&self, millis: i64) {
        self.clock.now.send_replace(millis);
    }

    /// Move the clock forward.
    pub fn advance(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.clock.now.send_modify(|now| *now = now.saturating_add(millis));
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.clock.sleeps.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Wait until at least `count` sleeps have been requested.
    pub async fn wait_for_sleeps(&self, count: usize) -> Vec<Duration> {
        loop {
            let notified = self.clock.slept.notified();
            let sleeps = self.sleeps();
            if sleeps.len() >= count {
                return sleeps;
            }
            notified.await;
        }
    }
}

impl Environment for SimEnv {
    fn now_millis(&self) -> i64 {
        *self.clock.now.borrow()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let deadline = self.now_millis().saturating_add(millis);
        let mut now = self.clock.now.subscribe();

        self.clock.sleeps.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        self.clock.slept.notify_waiters();

        async move {
            while *now.borrow_and_update() < deadline {
                if now.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}
