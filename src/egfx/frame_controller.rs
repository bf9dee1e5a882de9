//! Frame-pacing controller
//!
//! Tracks the unacknowledged frames of one wire surface and decides when
//! submission must pause. Ack latencies feed the network autodetect as
//! round-trip samples; fresh round-trip times move the soft bound on the
//! unacked window, which grows with the measured latency so a slow link
//! buffers more frames instead of stalling the encoder outright.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

/// Hard ceiling on the unacked-window bound
const MAX_UNACKED_BOUND: usize = 16;

struct ControllerState {
    /// (frame id, encode timestamp in µs of the monotonic clock)
    unacked_frames: VecDeque<(u32, i64)>,
    /// Soft bound derived from the last round-trip time
    unacked_bound: usize,
    /// Nominal frame interval used to scale the bound
    frame_interval: Duration,
}

/// Per-surface unacked window and throttle decision
pub struct FrameController {
    state: Mutex<ControllerState>,
}

impl FrameController {
    /// Create a controller for a surface refreshing at `refresh_rate` Hz
    pub fn new(refresh_rate: u32) -> Self {
        let frame_interval = Duration::from_secs(1) / refresh_rate.max(1);
        Self {
            state: Mutex::new(ControllerState {
                unacked_frames: VecDeque::new(),
                unacked_bound: 1,
                frame_interval,
            }),
        }
    }

    /// Record a newly emitted frame
    pub fn unack_frame(&self, frame_id: u32, enc_time_us: i64) {
        self.state.lock().unacked_frames.push_back((frame_id, enc_time_us));
    }

    /// Acknowledge `frame_id` and everything emitted before it
    ///
    /// Returns one round-trip sample per removed frame (ack time minus
    /// encode time), in emission order.
    pub fn ack_frame(&self, frame_id: u32, ack_time_us: i64) -> Vec<Duration> {
        let mut state = self.state.lock();
        let mut samples = Vec::new();

        // frame ids are acknowledged in FIFO order
        while let Some(&(id, enc_time_us)) = state.unacked_frames.front() {
            let acked = id == frame_id;
            state.unacked_frames.pop_front();
            samples.push(Duration::from_micros(
                ack_time_us.saturating_sub(enc_time_us).max(0) as u64,
            ));
            if acked {
                break;
            }
        }

        samples
    }

    /// Restore one entry at the tail after suspension-mode history rewrites
    pub fn unack_last_acked_frame(&self, frame_id: u32, enc_ack_time_us: i64) {
        self.state.lock().unacked_frames.push_back((frame_id, enc_ack_time_us));
    }

    /// Drop the whole window (suspension, reset)
    pub fn clear_all_unacked(&self) {
        self.state.lock().unacked_frames.clear();
    }

    /// Number of frames awaiting acknowledgement
    pub fn n_unacked_frames(&self) -> usize {
        self.state.lock().unacked_frames.len()
    }

    /// Update the throttle bound from a fresh round-trip sample
    ///
    /// The bound is one frame plus however many frame intervals fit into
    /// the round trip, capped to a fixed ceiling.
    pub fn notify_new_round_trip_time(&self, round_trip_time: Duration) {
        let mut state = self.state.lock();
        let interval_us = state.frame_interval.as_micros().max(1);
        let in_flight = round_trip_time.as_micros().div_ceil(interval_us) as usize;
        state.unacked_bound = (1 + in_flight).min(MAX_UNACKED_BOUND);

        trace!(
            "RTT {:?} -> unacked bound {}",
            round_trip_time,
            state.unacked_bound
        );
    }

    /// Whether submission must pause until the next ack
    pub fn is_rendering_suspended(&self) -> bool {
        let state = self.state.lock();
        state.unacked_frames.len() >= state.unacked_bound
    }
}
