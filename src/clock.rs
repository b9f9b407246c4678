//! The monotonic reference clock.

use std::time::Duration;

use tokio::time::Instant;

/// Monotonic clock reporting nanoseconds since a fixed epoch.
///
/// Backed by [`tokio::time::Instant`], so streams and the devices feeding
/// them share one timeline, and tests running under a paused runtime see
/// deterministic time. Clone handles freely; all clones share the epoch.
#[derive(Debug, Clone)]
pub struct MonoClock {
    epoch: Instant,
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonoClock {
    /// Creates a clock anchored at the current instant.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds elapsed since the epoch.
    pub fn now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    /// Converts a clock reading back to an [`Instant`] for timer arming.
    ///
    /// Readings before the epoch saturate to the epoch.
    pub fn instant_at(&self, ns: i64) -> Instant {
        if ns <= 0 {
            return self.epoch;
        }
        self.epoch + Duration::from_nanos(ns as u64)
    }
}
