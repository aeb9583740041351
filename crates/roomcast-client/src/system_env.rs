//! Production Environment implementation using the system clock.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use roomcast_core::Environment;
use tokio::time::Instant;

fn unix_millis(at: SystemTime) -> i64 {
    match at.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        // Clock set before 1970
        Err(before) => i64::try_from(before.duration().as_millis()).map_or(i64::MIN, |ms| -ms),
    }
}

/// Production environment using a monotonic clock and tokio timers.
///
/// The wall clock is read once, at construction. After that time advances
/// with a monotonic [`Instant`], so adjustments to the system clock (NTP
/// steps, manual changes) never move `now_millis` backwards.
#[derive(Debug, Clone, Copy)]
pub struct SystemEnv {
    anchor: Instant,
    anchor_millis: i64,
}

impl Default for SystemEnv {
    fn default() -> Self {
        Self { anchor: Instant::now(), anchor_millis: unix_millis(SystemTime::now()) }
    }
}

impl SystemEnv {
    /// Create a new system environment anchored at the current wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Environment for SystemEnv {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.anchor_millis.saturating_add(elapsed)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_time_advances() {
        let env = SystemEnv::new();

        let t1 = env.now_millis();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = env.now_millis();

        assert!(t2 > t1, "Time should advance");
    }

    #[test]
    fn system_env_time_never_decreases() {
        let env = SystemEnv::new();

        let mut last = env.now_millis();
        for _ in 0..1_000 {
            let now = env.now_millis();
            assert!(now >= last, "went from {last} to {now}");
            last = now;
        }
    }

    #[test]
    fn system_env_time_is_unix_millis() {
        // 2020-01-01T00:00:00Z
        assert!(SystemEnv::new().now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn pre_epoch_clock_is_negative() {
        let before = UNIX_EPOCH - Duration::from_millis(1_500);
        assert_eq!(unix_millis(before), -1_500);
    }

    #[tokio::test]
    async fn system_env_sleep_works() {
        let env = SystemEnv::new();

        let start = std::time::Instant::now();
        env.sleep(Duration::from_millis(50)).await;

        assert!(start.elapsed() >= Duration::from_millis(50), "Sleep should wait at least 50ms");
    }
}
