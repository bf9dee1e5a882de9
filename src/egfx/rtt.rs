//! Network autodetect facade
//!
//! The transport's autodetect machinery measures round-trip times and
//! bandwidth on request. The graphics pipeline consumes it through this
//! narrow interface: it votes on how urgently RTT samples are needed and
//! brackets large payloads with bandwidth measurements.

use std::time::Duration;

/// Subsystems voting on RTT measurement urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RttConsumer {
    /// The graphics pipeline
    Rdpgfx,
}

/// How urgently a consumer needs fresh RTT samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RttNecessity {
    /// Keep sampling at the fast cadence
    High,
    /// Sampling may slow down
    Low,
}

/// Transport-side autodetect interface
///
/// Round-trip samples flow back into the pipeline via
/// [`crate::egfx::GraphicsPipeline::notify_new_round_trip_time`].
pub trait NetworkAutodetection: Send + Sync {
    /// Update a consumer's vote on RTT measurement urgency
    fn set_rtt_consumer_necessity(&self, consumer: RttConsumer, necessity: RttNecessity);

    /// Feed one measured round-trip sample (ack time minus encode time)
    fn push_round_trip_sample(&self, sample: Duration);

    /// Begin a bandwidth measurement if none is running
    ///
    /// Returns whether a matching stop must be queued after the payload.
    fn try_bw_measure_start(&self) -> bool;

    /// Queue the stop for a previously started measurement
    fn queue_bw_measure_stop(&self);
}
