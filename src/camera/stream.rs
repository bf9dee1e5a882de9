//! Camera streams
//!
//! One [`CameraStream`] models a single sub-stream of a camera device:
//! the media types the peer advertised, the currently selected
//! descriptor, a frame clock armed at the selected frame rate, and the
//! software decode session. A run-sequence counter distinguishes
//! consecutive start/stop cycles so a late "started" acknowledgement is
//! attributed to the correct run.
//!
//! Decoded frames are republished through a PipeWire video source owned
//! by the device thread; this type only keeps the cross-thread state.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::clock::FrameClock;

use super::decode::DecodeSession;
use super::pdu::{CamMediaFormat, MediaTypeDescription};
use super::sample::SampleBuffer;
use super::Result;

/// Upper bound on samples handed to the decoder but not yet republished
pub const MAX_N_PENDING_FRAMES: u32 = 2;

struct StreamState {
    current_description: Option<MediaTypeDescription>,
    is_enabled: bool,

    current_run_sequence: u32,
    last_acked_run_sequence: u32,

    camera_loop_inhibited: bool,

    decode_session: Option<DecodeSession>,
}

/// One camera sub-stream
pub struct CameraStream {
    device_name: String,
    stream_index: u8,
    media_type_descriptions: Vec<MediaTypeDescription>,

    state: Mutex<StreamState>,
    frame_clock: FrameClock,

    /// Samples requested from the peer, oldest first
    pending_samples: Mutex<VecDeque<Arc<SampleBuffer>>>,
}

impl CameraStream {
    /// Create a stream context
    ///
    /// `on_tick` runs on every frame-clock expiration (it posts the
    /// sample-request work onto the device thread).
    pub fn new<F>(
        device_name: String,
        stream_index: u8,
        media_type_descriptions: Vec<MediaTypeDescription>,
        on_tick: F,
    ) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let frame_clock = FrameClock::new(on_tick)
            .map_err(|e| super::CameraError::DeviceFailed(format!("Failed to create frame clock: {e}")))?;

        Ok(Self {
            device_name,
            stream_index,
            media_type_descriptions,
            state: Mutex::new(StreamState {
                current_description: None,
                is_enabled: false,
                current_run_sequence: 0,
                last_acked_run_sequence: 0,
                camera_loop_inhibited: false,
                decode_session: None,
            }),
            frame_clock,
            pending_samples: Mutex::new(VecDeque::new()),
        })
    }

    /// Stream index within the device
    pub fn stream_index(&self) -> u8 {
        self.stream_index
    }

    /// All media types the peer advertised for this stream
    pub fn media_type_descriptions(&self) -> &[MediaTypeDescription] {
        &self.media_type_descriptions
    }

    /// Media types offered to downstream consumers
    ///
    /// Only sanitized H.264 descriptions are eligible; unsanitized ones
    /// stay in the context but are never offered.
    pub fn offerable_media_types(&self) -> Vec<MediaTypeDescription> {
        self.media_type_descriptions
            .iter()
            .filter(|d| d.format == CamMediaFormat::H264 && d.is_sanitized())
            .cloned()
            .collect()
    }

    /// The currently selected media type
    pub fn current_media_type(&self) -> Option<MediaTypeDescription> {
        self.state.lock().current_description.clone()
    }

    fn can_serve_frames(state: &StreamState) -> bool {
        state.is_enabled
            && state.current_run_sequence == state.last_acked_run_sequence
            && !state.camera_loop_inhibited
    }

    fn maybe_start_camera_loop(&self, state: &StreamState) {
        if !Self::can_serve_frames(state) {
            return;
        }
        if self.frame_clock.is_armed() {
            return;
        }

        let Some(description) = &state.current_description else {
            return;
        };

        debug!(
            "Device \"{}\", stream {}: Starting camera stream",
            self.device_name, self.stream_index
        );
        if let Err(e) = self.frame_clock.arm_timer(
            u64::from(description.frame_rate_numerator),
            u64::from(description.frame_rate_denominator),
        ) {
            warn!(
                "Device \"{}\", stream {}: Failed to arm frame clock: {e}",
                self.device_name, self.stream_index
            );
        }
    }

    /// Begin a new run with `description`
    ///
    /// Frames are not served until the matching "started" acknowledgement
    /// arrives for `run_sequence`.
    pub fn start(&self, description: MediaTypeDescription, run_sequence: u32) -> Result<()> {
        let mut state = self.state.lock();

        let decode_session = DecodeSession::new(description.width, description.height)?;
        state.decode_session = Some(decode_session);
        state.current_description = Some(description);
        state.is_enabled = true;
        state.current_run_sequence = run_sequence;

        Ok(())
    }

    /// Attribute a "started" acknowledgement to its run
    ///
    /// Returns false when `run_sequence` does not match the current run
    /// (a stale acknowledgement from a previous cycle).
    pub fn notify_stream_started(&self, run_sequence: u32) -> bool {
        let mut state = self.state.lock();

        if run_sequence != state.current_run_sequence {
            return false;
        }
        if run_sequence == state.last_acked_run_sequence {
            return true;
        }

        state.last_acked_run_sequence = run_sequence;
        self.maybe_start_camera_loop(&state);

        true
    }

    /// Stop serving frames (consumer detached or restart pending)
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.is_enabled = false;
        state.decode_session = None;
        self.frame_clock.disarm_timer();
        drop(state);

        self.flush_pending_samples();
    }

    /// Pause the camera loop while a stop-all/restart cycle is pending
    pub fn inhibit_camera_loop(&self) {
        let mut state = self.state.lock();
        state.camera_loop_inhibited = true;
        self.frame_clock.disarm_timer();
    }

    /// Resume the camera loop after a restart cycle completed
    pub fn uninhibit_camera_loop(&self) {
        let mut state = self.state.lock();
        state.camera_loop_inhibited = false;
        self.maybe_start_camera_loop(&state);
    }

    /// Whether a sample may be requested right now
    ///
    /// False while disabled, unacked, inhibited, or when the decoder is
    /// saturated.
    pub fn may_request_sample(&self) -> bool {
        let state = self.state.lock();
        if !Self::can_serve_frames(&state) {
            return false;
        }
        let pending = state
            .decode_session
            .as_ref()
            .map(|s| s.n_pending_frames())
            .unwrap_or(0);
        pending <= MAX_N_PENDING_FRAMES
    }

    /// Record a requested sample, oldest first
    pub fn push_pending_sample(&self, sample: Arc<SampleBuffer>) {
        if let Some(session) = self.state.lock().decode_session.as_mut() {
            session.notify_frame_pending();
        }
        self.pending_samples.lock().push_back(sample);
    }

    /// Take the oldest requested sample (response arrived)
    pub fn pop_pending_sample(&self) -> Option<Arc<SampleBuffer>> {
        let sample = self.pending_samples.lock().pop_front();
        if sample.is_some() {
            if let Some(session) = self.state.lock().decode_session.as_mut() {
                session.notify_frame_done();
            }
        }
        sample
    }

    /// Number of samples awaiting a response
    pub fn n_pending_samples(&self) -> usize {
        self.pending_samples.lock().len()
    }

    /// Drop every requested sample (timeout or stop)
    pub fn flush_pending_samples(&self) -> Vec<Arc<SampleBuffer>> {
        let flushed: Vec<_> = self.pending_samples.lock().drain(..).collect();
        let mut state = self.state.lock();
        if let Some(session) = state.decode_session.as_mut() {
            for _ in &flushed {
                session.notify_frame_done();
            }
        }
        flushed
    }

    /// Decode one delivered sample into a BGRA frame
    pub fn decode_sample(&self, sample: &SampleBuffer) -> Result<Option<super::decode::DecodedFrame>> {
        let data = sample.take_data();
        let mut state = self.state.lock();
        let session = state
            .decode_session
            .as_mut()
            .ok_or_else(|| super::CameraError::DecodeFailure("No decode session".into()))?;
        session.decode_sample(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h264_type(frame_rate_numerator: u32) -> MediaTypeDescription {
        MediaTypeDescription {
            format: CamMediaFormat::H264,
            width: 640,
            height: 480,
            frame_rate_numerator,
            frame_rate_denominator: 1,
            pixel_aspect_ratio_numerator: 1,
            pixel_aspect_ratio_denominator: 1,
            flags: 0,
        }
    }

    fn stream() -> CameraStream {
        CameraStream::new("Test Cam".into(), 0, vec![h264_type(30), h264_type(0)], || {}).unwrap()
    }

    #[tokio::test]
    async fn unsanitized_types_are_not_offered() {
        let stream = stream();
        assert_eq!(stream.media_type_descriptions().len(), 2);
        assert_eq!(stream.offerable_media_types().len(), 1);
    }

    #[tokio::test]
    async fn late_started_ack_is_attributed_by_run_sequence() {
        let stream = stream();
        stream.start(h264_type(30), 1).unwrap();

        // stale ack from a previous run
        assert!(!stream.notify_stream_started(0));
        assert!(!stream.may_request_sample());

        // matching ack enables frame serving
        assert!(stream.notify_stream_started(1));
        assert!(stream.may_request_sample());

        // duplicate ack is idempotent
        assert!(stream.notify_stream_started(1));
    }

    #[tokio::test]
    async fn inhibition_pauses_frame_serving() {
        let stream = stream();
        stream.start(h264_type(30), 1).unwrap();
        stream.notify_stream_started(1);

        stream.inhibit_camera_loop();
        assert!(!stream.may_request_sample());

        stream.uninhibit_camera_loop();
        assert!(stream.may_request_sample());
    }

    #[tokio::test]
    async fn decoder_saturation_blocks_requests() {
        let stream = stream();
        stream.start(h264_type(30), 1).unwrap();
        stream.notify_stream_started(1);

        for _ in 0..=MAX_N_PENDING_FRAMES {
            stream.push_pending_sample(Arc::new(SampleBuffer::new(0)));
        }
        assert!(!stream.may_request_sample());

        stream.pop_pending_sample().unwrap();
        assert!(stream.may_request_sample());
    }

    #[tokio::test]
    async fn flush_drains_pending_samples() {
        let stream = stream();
        stream.start(h264_type(30), 1).unwrap();
        stream.push_pending_sample(Arc::new(SampleBuffer::new(0)));
        stream.push_pending_sample(Arc::new(SampleBuffer::new(0)));

        assert_eq!(stream.flush_pending_samples().len(), 2);
        assert_eq!(stream.n_pending_samples(), 0);
    }
}
