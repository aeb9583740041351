//! Server clock offset estimation.
//!
//! Each `Time` frame becomes a [`TimeSample`]: the server clock it reports
//! and the local clock when it arrived. The raw offset of a sample is
//! `server_time - local_at_receipt`. [`OffsetPolicy`] decides how raw
//! offsets combine into the running estimate.
//!
//! Reported server time never decreases. A sample that lowers the offset
//! holds the reported value until the estimate catches up with it.

use std::{collections::VecDeque, num::NonZeroUsize};

use serde::Deserialize;

/// How raw sample offsets combine into the estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OffsetPolicy {
    /// The latest sample replaces the estimate.
    #[default]
    LastSample,

    /// Median of the last `size` raw offsets. For an even count the lower
    /// of the two middle values is used.
    WindowMedian {
        /// Number of samples kept.
        size: NonZeroUsize,
    },
}

/// One server clock observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    /// Local clock when the sample arrived (ms).
    pub local_at_receipt: i64,
    /// Server clock carried by the sample (ms).
    pub server_time: i64,
}

impl TimeSample {
    /// Raw offset of this sample.
    pub fn offset(&self) -> i64 {
        self.server_time.saturating_sub(self.local_at_receipt)
    }
}

/// Result of a server time query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerTime {
    /// Estimated server clock (ms).
    Synced(i64),
    /// No sample has been received yet.
    Unsynced,
}

impl ServerTime {
    /// The estimate, if synced.
    pub fn millis(self) -> Option<i64> {
        match self {
            Self::Synced(millis) => Some(millis),
            Self::Unsynced => None,
        }
    }
}

/// Running offset estimate.
#[derive(Debug, Clone)]
pub struct TimeSync {
    policy: OffsetPolicy,
    window: VecDeque<i64>,
    offset: Option<i64>,
    samples: u64,
    /// Highest server time reported so far.
    reported: Option<i64>,
}

impl TimeSync {
    /// Create an estimator with no samples.
    pub fn new(policy: OffsetPolicy) -> Self {
        Self { policy, window: VecDeque::new(), offset: None, samples: 0, reported: None }
    }

    /// Fold a sample into the estimate and return the new offset.
    pub fn observe(&mut self, sample: TimeSample) -> i64 {
        let raw = sample.offset();
        self.samples += 1;

        let offset = match self.policy {
            OffsetPolicy::LastSample => raw,
            OffsetPolicy::WindowMedian { size } => {
                if self.window.len() == size.get() {
                    self.window.pop_front();
                }
                self.window.push_back(raw);

                let mut sorted: Vec<i64> = self.window.iter().copied().collect();
                sorted.sort_unstable();
                sorted.get((sorted.len() - 1) / 2).copied().unwrap_or(raw)
            },
        };

        self.offset = Some(offset);
        offset
    }

    /// Current offset, `None` before the first sample.
    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Number of samples observed.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// Server clock at local time `local_now`, never below a value
    /// returned earlier.
    pub fn server_time(&mut self, local_now: i64) -> ServerTime {
        let Some(offset) = self.offset else {
            return ServerTime::Unsynced;
        };

        let estimate = local_now.saturating_add(offset);
        let now = self.reported.map_or(estimate, |reported| reported.max(estimate));
        self.reported = Some(now);
        ServerTime::Synced(now)
    }
}
