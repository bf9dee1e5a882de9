//! Session metrics
//!
//! Counts transmitted frames and remembers when the last one went out.
//! Cheap enough to update from the render path on every frame.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::utils::monotonic_time_us;

/// Frame transmission counters for one session
pub struct SessionMetrics {
    frames_transmitted: AtomicU64,
    last_transmission_us: AtomicI64,
}

impl SessionMetrics {
    /// Create zeroed metrics
    pub fn new() -> Self {
        Self {
            frames_transmitted: AtomicU64::new(0),
            last_transmission_us: AtomicI64::new(0),
        }
    }

    /// Record one transmitted frame
    pub fn notify_frame_transmission(&self) {
        self.frames_transmitted.fetch_add(1, Ordering::Relaxed);
        self.last_transmission_us
            .store(monotonic_time_us(), Ordering::Relaxed);
    }

    /// Total frames transmitted so far
    pub fn frames_transmitted(&self) -> u64 {
        self.frames_transmitted.load(Ordering::Relaxed)
    }

    /// Monotonic timestamp of the last transmission, µs (0 if none)
    pub fn last_transmission_us(&self) -> i64 {
        self.last_transmission_us.load(Ordering::Relaxed)
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmission_updates_counter_and_timestamp() {
        let metrics = SessionMetrics::new();
        assert_eq!(metrics.frames_transmitted(), 0);
        assert_eq!(metrics.last_transmission_us(), 0);

        metrics.notify_frame_transmission();
        metrics.notify_frame_transmission();

        assert_eq!(metrics.frames_transmitted(), 2);
        assert!(metrics.last_transmission_us() > 0);
    }
}
