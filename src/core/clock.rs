//! Monotonic timestamps with a single fixed offset to UTC.
//!
//! Frames are stamped from a monotonic clock so buffer ordering survives
//! wall-clock adjustments; the offset to UTC is captured once at startup and
//! applied only at the wire boundary.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
    /// UTC seconds at `start`
    utc_at_start: f64,
}

impl Clock {
    pub fn new() -> Self {
        let utc_at_start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            start: Instant::now(),
            utc_at_start,
        }
    }

    /// Monotonic seconds since process start.
    pub fn now_sec(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Convert a monotonic timestamp to UTC seconds since the Unix epoch.
    pub fn to_utc(&self, monotonic_sec: f64) -> f64 {
        self.utc_at_start + monotonic_sec
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utc_conversion_preserves_deltas() {
        let clock = Clock::new();
        let a = clock.to_utc(1.0);
        let b = clock.to_utc(2.5);
        assert!((b - a - 1.5).abs() < 1e-9);
    }

    #[test]
    fn now_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_sec();
        let b = clock.now_sec();
        assert!(b >= a);
    }
}
