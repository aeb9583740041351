//! Reconnect policy and exponential backoff.

use std::time::Duration;

use serde::Deserialize;

/// When and how often to reconnect after the connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Reconnect at all. When false, a lost connection closes the session.
    pub enabled: bool,
    /// Delay before the first attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { enabled: true, initial_delay_ms: 100, max_delay_ms: 10_000, max_attempts: None }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects.
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Delay before attempt number `attempt` (0-based): the initial delay
    /// doubled `attempt` times, capped at the max delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// Consecutive-failure counter driving a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
}

impl Backoff {
    /// Fresh backoff with no failed attempts.
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// The policy in use.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Attempts scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Schedule the next attempt.
    ///
    /// Returns the delay and the 1-based attempt number, or `None` when
    /// reconnecting is disabled or the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<(Duration, u32)> {
        if !self.policy.enabled {
            return None;
        }
        if let Some(max) = self.policy.max_attempts
            && self.attempts >= max
        {
            return None;
        }

        let delay = self.policy.delay_for(self.attempts);
        self.attempts += 1;
        Some((delay, self.attempts))
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}
