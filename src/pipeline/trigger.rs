// Fixed-rate trigger
//
// Fire times sit on a grid of `interval` milliseconds since the epoch, so every
// pipeline with the same interval fires in the same instant and the metric time
// of a round is always a grid point.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedRate {
    interval_ms: i64,
}

impl FixedRate {
    pub fn new(interval: Duration) -> Self {
        FixedRate {
            interval_ms: i64::try_from(interval.as_millis()).unwrap_or(i64::MAX).max(1),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms as u64)
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    /// First grid point strictly after `now`.
    pub fn first(&self, now: i64) -> i64 {
        (now.div_euclid(self.interval_ms) + 1) * self.interval_ms
    }

    /// Fire time following `prev`. Rounds already in the past are skipped.
    pub fn next(&self, prev: i64, now: i64) -> i64 {
        let next = prev + self.interval_ms;
        if next <= now {
            self.first(now)
        } else {
            next
        }
    }
}
