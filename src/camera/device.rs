//! Camera device channel
//!
//! One [`CameraDevice`] per announced camera, carrying the [MS-RDPECAM]
//! device protocol on its peer-named dynamic virtual channel.
//!
//! # Initialization
//!
//! ```text
//! PENDING_ACTIVATION ── ActivateDeviceRequest ──► PENDING_ACTIVATION_RESPONSE
//!      ── StreamListRequest ──► PENDING_STREAM_LIST_RESPONSE
//!      ── MediaTypeListRequest (per stream, in order) ──►
//!         PENDING_MEDIA_TYPE_LIST_RESPONSE
//!      ──► PENDING_STREAM_PREPARATION (device thread constructs streams)
//!      ──► INITIALIZATION_DONE
//! ```
//!
//! # Runtime
//!
//! A single client request (StartStreams or StopStreams) is in flight at
//! a time. The protocol cannot stop an individual stream, so
//! reconfiguring one stream stops ALL running streams and queues
//! restarts for the ones that should keep going. Sample requests flow
//! through the per-stream ledgers; two seconds without any response
//! flushes every queued sample as corrupted.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::utils::monotonic_time_us;

use super::pdu::{CamMessage, CamPdu, MediaTypeDescription, StreamDescription};
use super::sample::SampleBuffer;
use super::stream::CameraStream;
use super::{CameraError, Result, SAMPLE_TIMEOUT};

/// Outgoing message sink of one camera DVC
pub trait CamPduSink: Send {
    /// Deliver one message to the peer
    fn send(&mut self, message: CamMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    FatalError,
    PendingActivation,
    PendingActivationResponse,
    PendingStreamListResponse,
    PendingMediaTypeListResponse,
    PendingStreamPreparation,
    InitializationDone,
    InShutdown,
}

impl DeviceState {
    fn as_str(self) -> &'static str {
        match self {
            Self::FatalError => "FATAL_ERROR",
            Self::PendingActivation => "PENDING_ACTIVATION",
            Self::PendingActivationResponse => "PENDING_ACTIVATION_RESPONSE",
            Self::PendingStreamListResponse => "PENDING_STREAM_LIST_RESPONSE",
            Self::PendingMediaTypeListResponse => "PENDING_MEDIA_TYPE_LIST_RESPONSE",
            Self::PendingStreamPreparation => "PENDING_STREAM_PREPARATION",
            Self::InitializationDone => "INITIALIZATION_DONE",
            Self::InShutdown => "IN_SHUTDOWN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientRequestType {
    StartStreams,
    StopStreams,
}

#[derive(Clone)]
struct StreamRunContext {
    description: MediaTypeDescription,
    run_sequence: u32,
}

struct InitState {
    state: DeviceState,
    stream_descriptions: Vec<StreamDescription>,
    /// Stream indices still awaiting their media type list, in order
    pending_media_type_lists: VecDeque<u8>,
    collected_media_types: HashMap<u8, Vec<MediaTypeDescription>>,
}

struct RunState {
    queued_stream_starts: HashMap<u8, StreamRunContext>,
    pending_stream_starts: HashMap<u8, StreamRunContext>,
    running_streams: HashMap<u8, StreamRunContext>,
    pending_stop: bool,
    client_request: Option<ClientRequestType>,
    next_run_sequence: u32,
}

struct DeviceShared {
    dvc_name: Vec<u8>,
    device_name: String,
    protocol_version: u8,

    sink: Mutex<Box<dyn CamPduSink>>,
    on_error: Box<dyn Fn() + Send + Sync>,

    init: Mutex<InitState>,
    run: Mutex<RunState>,
    streams: Mutex<HashMap<u8, Arc<CameraStream>>>,

    /// sample id → owning stream index
    pending_samples: Mutex<HashMap<u64, u8>>,
    last_sample_activity_us: Mutex<i64>,
    sample_timeout_task: Mutex<Option<tokio::task::JoinHandle<()>>>,

    /// PipeWire publishing thread, attached once streams are prepared
    source: Mutex<Option<super::source::CameraSourceThread>>,
}

impl DeviceShared {
    fn send(&self, pdu: CamPdu) -> Result<()> {
        self.sink.lock().send(CamMessage {
            version: self.protocol_version,
            pdu,
        })
    }
}

/// One announced camera device
pub struct CameraDevice {
    shared: Arc<DeviceShared>,
}

impl CameraDevice {
    /// Create a device for the peer-announced channel
    ///
    /// `on_error` fires when the device enters its fatal state; the
    /// enumerator reacts by synthesizing a device removal.
    pub fn new<S, E>(
        dvc_name: Vec<u8>,
        device_name: String,
        protocol_version: u8,
        sink: S,
        on_error: E,
    ) -> Self
    where
        S: CamPduSink + 'static,
        E: Fn() + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(DeviceShared {
                dvc_name,
                device_name,
                protocol_version,
                sink: Mutex::new(Box::new(sink)),
                on_error: Box::new(on_error),
                init: Mutex::new(InitState {
                    state: DeviceState::PendingActivation,
                    stream_descriptions: Vec::new(),
                    pending_media_type_lists: VecDeque::new(),
                    collected_media_types: HashMap::new(),
                }),
                run: Mutex::new(RunState {
                    queued_stream_starts: HashMap::new(),
                    pending_stream_starts: HashMap::new(),
                    running_streams: HashMap::new(),
                    pending_stop: false,
                    client_request: None,
                    next_run_sequence: 1,
                }),
                streams: Mutex::new(HashMap::new()),
                pending_samples: Mutex::new(HashMap::new()),
                last_sample_activity_us: Mutex::new(0),
                sample_timeout_task: Mutex::new(None),
                source: Mutex::new(None),
            }),
        }
    }

    /// Spawn the PipeWire publishing thread and announce the prepared
    /// streams as local video sources
    pub fn attach_video_sources(&self) -> Result<()> {
        let source = super::source::CameraSourceThread::spawn(self.shared.device_name.clone())?;

        let streams = self.shared.streams.lock();
        for stream in streams.values() {
            source.post(super::source::SourceCommand::CreateSource {
                stream_index: stream.stream_index(),
                description: self.shared.device_name.clone(),
            });
        }
        drop(streams);

        *self.shared.source.lock() = Some(source);
        Ok(())
    }

    /// DVC name announced by the peer
    pub fn dvc_name(&self) -> &[u8] {
        &self.shared.dvc_name
    }

    /// Human-readable device name
    pub fn device_name(&self) -> &str {
        &self.shared.device_name
    }

    /// One stream context per prepared stream
    pub fn streams(&self) -> Vec<Arc<CameraStream>> {
        self.shared.streams.lock().values().cloned().collect()
    }

    /// Stream descriptions the peer reported
    pub fn stream_descriptions(&self) -> Vec<StreamDescription> {
        self.shared.init.lock().stream_descriptions.clone()
    }

    /// Begin teardown: stop serving frames and ignore further messages
    pub fn shutdown(&self) {
        self.shared.init.lock().state = DeviceState::InShutdown;

        let streams = self.shared.streams.lock();
        for stream in streams.values() {
            stream.stop();
        }
        drop(streams);

        self.shared.pending_samples.lock().clear();
        if let Some(task) = self.shared.sample_timeout_task.lock().take() {
            task.abort();
        }
    }

    fn state(&self) -> DeviceState {
        self.shared.init.lock().state
    }

    /// Whether initialization finished
    pub fn is_initialized(&self) -> bool {
        self.state() == DeviceState::InitializationDone
    }

    /// The channel is open: begin activation
    pub fn notify_channel_opened(&self) -> Result<()> {
        let mut init = self.shared.init.lock();
        if init.state != DeviceState::PendingActivation {
            return Ok(());
        }
        init.state = DeviceState::PendingActivationResponse;
        drop(init);

        info!(
            "Device \"{}\": Activating (channel \"{}\")",
            self.shared.device_name,
            String::from_utf8_lossy(&self.shared.dvc_name)
        );
        self.shared.send(CamPdu::ActivateDeviceRequest)
    }

    fn transition_into_fatal_error_state(&self, reason: &str) {
        warn!(
            "Device \"{}\" failed in state {}: {reason}. Removing device",
            self.shared.device_name,
            self.state().as_str()
        );
        self.shared.init.lock().state = DeviceState::FatalError;
        (self.shared.on_error)();
    }

    // =========================================================================
    // Incoming messages
    // =========================================================================

    /// Dispatch one message from the peer
    pub fn handle_message(&self, message: CamMessage) -> Result<()> {
        match self.state() {
            DeviceState::FatalError | DeviceState::InShutdown => return Ok(()),
            _ => {}
        }

        match message.pdu {
            CamPdu::SuccessResponse => self.handle_success_response(),
            CamPdu::ErrorResponse { error_code } => {
                self.transition_into_fatal_error_state(&format!("peer error {error_code}"));
                Ok(())
            }
            CamPdu::StreamListResponse { descriptions } => self.handle_stream_list(descriptions),
            CamPdu::MediaTypeListResponse { descriptions } => self.handle_media_type_list(descriptions),
            CamPdu::CurrentMediaTypeResponse { .. } => Ok(()),
            CamPdu::SampleResponse { stream_index, sample } => {
                self.handle_sample_response(stream_index, sample)
            }
            CamPdu::SampleErrorResponse { stream_index, error_code } => {
                debug!(
                    "Device \"{}\", stream {stream_index}: sample error {error_code}",
                    self.shared.device_name
                );
                self.handle_sample_error(stream_index)
            }
            CamPdu::PropertyListResponse { .. } => Ok(()),
            other => {
                self.transition_into_fatal_error_state(&format!(
                    "unexpected message {other:?} in state {}",
                    self.state().as_str()
                ));
                Err(CameraError::ProtocolViolation(
                    "unexpected device message".into(),
                ))
            }
        }
    }

    fn handle_success_response(&self) -> Result<()> {
        let state = self.state();
        match state {
            DeviceState::PendingActivationResponse => {
                self.shared.init.lock().state = DeviceState::PendingStreamListResponse;
                self.shared.send(CamPdu::StreamListRequest)
            }
            DeviceState::InitializationDone => self.handle_runtime_success(),
            _ => {
                self.transition_into_fatal_error_state(&format!(
                    "stray success response in state {}",
                    state.as_str()
                ));
                Err(CameraError::ProtocolViolation("stray success response".into()))
            }
        }
    }

    fn handle_stream_list(&self, descriptions: Vec<StreamDescription>) -> Result<()> {
        {
            let mut init = self.shared.init.lock();
            if init.state != DeviceState::PendingStreamListResponse {
                drop(init);
                self.transition_into_fatal_error_state("unexpected stream list");
                return Err(CameraError::ProtocolViolation("unexpected stream list".into()));
            }
            if descriptions.is_empty() {
                drop(init);
                self.transition_into_fatal_error_state("device has no streams");
                return Err(CameraError::ProtocolViolation("empty stream list".into()));
            }

            init.pending_media_type_lists = (0..descriptions.len() as u8).collect();
            init.stream_descriptions = descriptions;
            init.state = DeviceState::PendingMediaTypeListResponse;
        }

        self.request_next_media_type_list()
    }

    fn request_next_media_type_list(&self) -> Result<()> {
        let stream_index = {
            let init = self.shared.init.lock();
            *init
                .pending_media_type_lists
                .front()
                .expect("a media type list is outstanding")
        };
        self.shared.send(CamPdu::MediaTypeListRequest { stream_index })
    }

    fn handle_media_type_list(&self, descriptions: Vec<MediaTypeDescription>) -> Result<()> {
        let all_collected = {
            let mut init = self.shared.init.lock();
            if init.state != DeviceState::PendingMediaTypeListResponse {
                drop(init);
                self.transition_into_fatal_error_state("unexpected media type list");
                return Err(CameraError::ProtocolViolation("unexpected media type list".into()));
            }

            let stream_index = init
                .pending_media_type_lists
                .pop_front()
                .expect("a media type list is outstanding");
            init.collected_media_types.insert(stream_index, descriptions);

            if init.pending_media_type_lists.is_empty() {
                init.state = DeviceState::PendingStreamPreparation;
                true
            } else {
                false
            }
        };

        if all_collected {
            self.prepare_streams()
        } else {
            self.request_next_media_type_list()
        }
    }

    /// Construct stream contexts for every stream advertising a usable
    /// media type
    ///
    /// Runs from the device thread in production; exposed so the state
    /// machine is drivable without one.
    fn prepare_streams(&self) -> Result<()> {
        let collected = {
            let init = self.shared.init.lock();
            init.collected_media_types.clone()
        };

        let mut streams = self.shared.streams.lock();
        for (stream_index, descriptions) in collected {
            let has_usable_type = descriptions
                .iter()
                .any(|d| d.format == super::pdu::CamMediaFormat::H264 && d.is_sanitized());
            if !has_usable_type {
                debug!(
                    "Device \"{}\", stream {stream_index}: no usable media type",
                    self.shared.device_name
                );
                continue;
            }

            let tick_shared = Arc::downgrade(&self.shared);
            let stream = CameraStream::new(
                self.shared.device_name.clone(),
                stream_index,
                descriptions,
                move || {
                    if let Some(shared) = tick_shared.upgrade() {
                        handle_frame_clock_tick(&shared, stream_index);
                    }
                },
            )?;
            streams.insert(stream_index, Arc::new(stream));
        }

        if streams.is_empty() {
            drop(streams);
            self.transition_into_fatal_error_state("no stream offers a usable media type");
            return Err(CameraError::DeviceFailed("no usable streams".into()));
        }
        drop(streams);

        self.shared.init.lock().state = DeviceState::InitializationDone;
        info!(
            "Device \"{}\": initialization done ({} stream(s))",
            self.shared.device_name,
            self.shared.streams.lock().len()
        );
        Ok(())
    }

    // =========================================================================
    // Stream start/stop (single in-flight client request)
    // =========================================================================

    /// A downstream consumer attached: start `stream_index` with
    /// `description`
    pub fn start_stream(&self, stream_index: u8, description: MediaTypeDescription) -> Result<()> {
        let run_sequence = {
            let mut run = self.shared.run.lock();
            let run_sequence = run.next_run_sequence;
            run.next_run_sequence = run.next_run_sequence.wrapping_add(1);
            run.queued_stream_starts.insert(
                stream_index,
                StreamRunContext {
                    description: description.clone(),
                    run_sequence,
                },
            );
            run_sequence
        };

        if let Some(stream) = self.shared.streams.lock().get(&stream_index) {
            stream.start(description, run_sequence)?;
        }

        self.process_client_requests()
    }

    /// A downstream consumer detached (or a stream is being reconfigured):
    /// stop `stream_index`
    ///
    /// The protocol only stops all streams at once, so every other
    /// running stream is queued for a restart.
    pub fn stop_stream(&self, stream_index: u8) -> Result<()> {
        let to_inhibit: Vec<u8> = {
            let mut run = self.shared.run.lock();
            run.running_streams.remove(&stream_index);
            run.queued_stream_starts.remove(&stream_index);

            let still_running: Vec<(u8, StreamRunContext)> = run.running_streams.drain().collect();
            let indices = still_running.iter().map(|(index, _)| *index).collect();
            for (index, context) in still_running {
                run.queued_stream_starts.entry(index).or_insert(context);
            }

            run.pending_stop = true;
            indices
        };

        {
            let streams = self.shared.streams.lock();
            for index in to_inhibit {
                if let Some(stream) = streams.get(&index) {
                    stream.inhibit_camera_loop();
                }
            }
            if let Some(stream) = streams.get(&stream_index) {
                stream.stop();
            }
        }

        self.process_client_requests()
    }

    /// Drive the queued start/stop work, keeping one request in flight
    fn process_client_requests(&self) -> Result<()> {
        let action = {
            let mut run = self.shared.run.lock();
            if run.client_request.is_some() {
                None
            } else if run.pending_stop {
                run.pending_stop = false;
                run.client_request = Some(ClientRequestType::StopStreams);
                Some(CamPdu::StopStreamsRequest)
            } else if !run.queued_stream_starts.is_empty() {
                let queued: Vec<(u8, StreamRunContext)> = run.queued_stream_starts.drain().collect();
                let infos = queued
                    .iter()
                    .map(|(index, context)| (*index, context.description.clone()))
                    .collect();
                for (index, context) in queued {
                    run.pending_stream_starts.insert(index, context);
                }
                run.client_request = Some(ClientRequestType::StartStreams);
                Some(CamPdu::StartStreamsRequest { infos })
            } else {
                None
            }
        };

        match action {
            Some(pdu) => self.shared.send(pdu),
            None => Ok(()),
        }
    }

    fn handle_runtime_success(&self) -> Result<()> {
        let request = {
            let mut run = self.shared.run.lock();
            match run.client_request.take() {
                Some(request) => request,
                None => {
                    drop(run);
                    self.transition_into_fatal_error_state(
                        "stray success response: no runtime request in flight",
                    );
                    return Err(CameraError::ProtocolViolation("stray success response".into()));
                }
            }
        };

        match request {
            ClientRequestType::StartStreams => self.ack_started_streams(),
            ClientRequestType::StopStreams => self.ack_stopped_streams(),
        }

        // a stop may have queued restarts, a start may race a new stop
        self.process_client_requests()
    }

    fn ack_started_streams(&self) {
        let started: Vec<(u8, StreamRunContext)> = {
            let mut run = self.shared.run.lock();
            let started: Vec<_> = run.pending_stream_starts.drain().collect();
            for (index, context) in &started {
                run.running_streams.insert(*index, context.clone());
            }
            started
        };

        let streams = self.shared.streams.lock();
        for (index, context) in started {
            if let Some(stream) = streams.get(&index) {
                if !stream.notify_stream_started(context.run_sequence) {
                    debug!(
                        "Device \"{}\", stream {index}: stale started ack (run {})",
                        self.shared.device_name, context.run_sequence
                    );
                }
            }
        }
    }

    fn ack_stopped_streams(&self) {
        let queued: Vec<u8> = {
            let run = self.shared.run.lock();
            run.queued_stream_starts.keys().copied().collect()
        };

        let streams = self.shared.streams.lock();
        for index in queued {
            if let Some(stream) = streams.get(&index) {
                stream.uninhibit_camera_loop();
            }
        }
    }

    // =========================================================================
    // Sample flow
    // =========================================================================

    /// Request one sample for `stream` (frame-clock driven)
    pub fn request_sample(&self, stream: &CameraStream, sample: Arc<SampleBuffer>) -> Result<()> {
        {
            let run = self.shared.run.lock();
            assert!(run.client_request != Some(ClientRequestType::StopStreams));
        }

        let stream_index = stream.stream_index();
        self.shared
            .pending_samples
            .lock()
            .insert(sample.id(), stream_index);
        stream.push_pending_sample(sample);

        self.maybe_set_sample_timeout();

        self.shared.send(CamPdu::SampleRequest { stream_index })
    }

    fn note_sample_activity(&self) {
        *self.shared.last_sample_activity_us.lock() = monotonic_time_us();
    }

    /// Arm the watchdog that flushes unanswered samples as corrupted
    fn maybe_set_sample_timeout(&self) {
        self.note_sample_activity();

        let mut task = self.shared.sample_timeout_task.lock();
        if task.is_some() {
            return;
        }

        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SAMPLE_TIMEOUT).await;

                let idle_us = monotonic_time_us() - *shared.last_sample_activity_us.lock();
                let has_pending = !shared.pending_samples.lock().is_empty();

                if !has_pending {
                    break;
                }
                if idle_us >= SAMPLE_TIMEOUT.as_micros() as i64 {
                    warn!(
                        "Device \"{}\": sample timeout, flushing queued samples",
                        shared.device_name
                    );
                    shared.pending_samples.lock().clear();

                    let flushed: Vec<(u8, usize)> = {
                        let streams = shared.streams.lock();
                        streams
                            .values()
                            .map(|stream| (stream.stream_index(), stream.flush_pending_samples().len()))
                            .collect()
                    };

                    // flushed samples surface as corrupted frames so the
                    // consumer can resync
                    if let Some(source) = shared.source.lock().as_ref() {
                        for (stream_index, count) in flushed {
                            for _ in 0..count {
                                source.post(crate::camera::source::SourceCommand::PublishFrame {
                                    stream_index,
                                    frame: crate::camera::decode::DecodedFrame {
                                        width: 0,
                                        height: 0,
                                        data: Vec::new(),
                                    },
                                    corrupted: true,
                                });
                            }
                        }
                    }
                    break;
                }
            }
            shared.sample_timeout_task.lock().take();
        }));
    }

    fn handle_sample_response(&self, stream_index: u8, sample_bytes: Vec<u8>) -> Result<()> {
        self.note_sample_activity();

        let streams = self.shared.streams.lock();
        let Some(stream) = streams.get(&stream_index) else {
            return Err(CameraError::ProtocolViolation(format!(
                "sample for unknown stream {stream_index}"
            )));
        };

        let Some(sample) = stream.pop_pending_sample() else {
            // response without a request: tolerate, the peer may race a stop
            return Ok(());
        };
        self.shared.pending_samples.lock().remove(&sample.id());

        sample.load(sample_bytes);
        match stream.decode_sample(&sample) {
            Ok(Some(frame)) => {
                if let Some(source) = self.shared.source.lock().as_ref() {
                    source.post(super::source::SourceCommand::PublishFrame {
                        stream_index,
                        frame,
                        corrupted: false,
                    });
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(
                    "Device \"{}\", stream {stream_index}: Failed to decode frame: {e}",
                    self.shared.device_name
                );
                self.publish_corrupted(stream_index);
                Ok(())
            }
        }
    }

    /// Queue a corrupted marker so the consumer can resync
    fn publish_corrupted(&self, stream_index: u8) {
        if let Some(source) = self.shared.source.lock().as_ref() {
            source.post(super::source::SourceCommand::PublishFrame {
                stream_index,
                frame: super::decode::DecodedFrame {
                    width: 0,
                    height: 0,
                    data: Vec::new(),
                },
                corrupted: true,
            });
        }
    }

    fn handle_sample_error(&self, stream_index: u8) -> Result<()> {
        self.note_sample_activity();

        let sample = {
            let streams = self.shared.streams.lock();
            streams.get(&stream_index).and_then(|s| s.pop_pending_sample())
        };
        if let Some(sample) = sample {
            self.shared.pending_samples.lock().remove(&sample.id());
        }

        self.publish_corrupted(stream_index);
        Ok(())
    }
}

/// Frame-clock tick: request the next sample for `stream_index`
///
/// Skipped while the stream cannot serve frames or the decoder is
/// saturated. When no buffer is available downstream, the consumer side
/// is too slow; no warning is emitted for that.
fn handle_frame_clock_tick(shared: &Arc<DeviceShared>, stream_index: u8) {
    let stream = shared.streams.lock().get(&stream_index).cloned();
    let Some(stream) = stream else {
        return;
    };
    if !stream.may_request_sample() {
        return;
    }

    let device = CameraDevice {
        shared: Arc::clone(shared),
    };
    let sample = Arc::new(SampleBuffer::new(stream_index));
    if let Err(e) = device.request_sample(&stream, sample) {
        warn!("Device \"{}\": failed to request sample: {e}", shared.device_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::pdu::CamMediaFormat;
    use std::sync::mpsc;

    struct RecordingSink(mpsc::Sender<CamMessage>);

    impl CamPduSink for RecordingSink {
        fn send(&mut self, message: CamMessage) -> Result<()> {
            self.0.send(message).ok();
            Ok(())
        }
    }

    fn h264_type() -> MediaTypeDescription {
        MediaTypeDescription {
            format: CamMediaFormat::H264,
            width: 640,
            height: 480,
            frame_rate_numerator: 30,
            frame_rate_denominator: 1,
            pixel_aspect_ratio_numerator: 1,
            pixel_aspect_ratio_denominator: 1,
            flags: 0,
        }
    }

    fn unsanitized_type() -> MediaTypeDescription {
        MediaTypeDescription {
            frame_rate_denominator: 0,
            ..h264_type()
        }
    }

    fn device() -> (CameraDevice, mpsc::Receiver<CamMessage>, mpsc::Receiver<()>) {
        let (message_tx, message_rx) = mpsc::channel();
        let (error_tx, error_rx) = mpsc::channel();
        let device = CameraDevice::new(
            b"RDCamera_Device_1".to_vec(),
            "Test Cam".into(),
            2,
            RecordingSink(message_tx),
            move || {
                error_tx.send(()).ok();
            },
        );
        (device, message_rx, error_rx)
    }

    fn success() -> CamMessage {
        CamMessage {
            version: 2,
            pdu: CamPdu::SuccessResponse,
        }
    }

    fn drive_to_initialized(
        device: &CameraDevice,
        message_rx: &mpsc::Receiver<CamMessage>,
        n_streams: u8,
    ) {
        device.notify_channel_opened().unwrap();
        assert!(matches!(
            message_rx.try_recv().unwrap().pdu,
            CamPdu::ActivateDeviceRequest
        ));

        device.handle_message(success()).unwrap();
        assert!(matches!(
            message_rx.try_recv().unwrap().pdu,
            CamPdu::StreamListRequest
        ));

        let descriptions = (0..n_streams)
            .map(|_| StreamDescription {
                frame_source_types: 1,
                stream_category: 1,
                selected: 1,
                can_be_shared: 0,
            })
            .collect();
        device
            .handle_message(CamMessage {
                version: 2,
                pdu: CamPdu::StreamListResponse { descriptions },
            })
            .unwrap();

        // one media type list request per stream, in stream order
        for expected_index in 0..n_streams {
            let request = message_rx.try_recv().unwrap();
            assert_eq!(
                request.pdu,
                CamPdu::MediaTypeListRequest {
                    stream_index: expected_index
                }
            );
            device
                .handle_message(CamMessage {
                    version: 2,
                    pdu: CamPdu::MediaTypeListResponse {
                        descriptions: vec![h264_type(), unsanitized_type()],
                    },
                })
                .unwrap();
        }

        assert!(device.is_initialized());
    }

    #[tokio::test]
    async fn initialization_walks_the_state_machine() {
        let (device, message_rx, _error_rx) = device();
        drive_to_initialized(&device, &message_rx, 2);
        assert_eq!(device.streams().len(), 2);
    }

    #[tokio::test]
    async fn empty_stream_list_is_fatal() {
        let (device, message_rx, error_rx) = device();

        device.notify_channel_opened().unwrap();
        device.handle_message(success()).unwrap();
        message_rx.try_iter().count();

        let result = device.handle_message(CamMessage {
            version: 2,
            pdu: CamPdu::StreamListResponse { descriptions: vec![] },
        });
        assert!(result.is_err());
        assert!(error_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn peer_error_escalates_to_device_removal() {
        let (device, message_rx, error_rx) = device();
        drive_to_initialized(&device, &message_rx, 1);

        device
            .handle_message(CamMessage {
                version: 2,
                pdu: CamPdu::ErrorResponse {
                    error_code: crate::camera::pdu::CamErrorCode::UnexpectedError,
                },
            })
            .unwrap();
        assert!(error_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn single_client_request_is_in_flight() {
        let (device, message_rx, _error_rx) = device();
        drive_to_initialized(&device, &message_rx, 2);

        device.start_stream(0, h264_type()).unwrap();
        let first = message_rx.try_recv().unwrap();
        assert!(matches!(first.pdu, CamPdu::StartStreamsRequest { .. }));

        // second start while the first is unanswered: queued, not sent
        device.start_stream(1, h264_type()).unwrap();
        assert!(message_rx.try_recv().is_err());

        // success releases the next request
        device.handle_message(success()).unwrap();
        let second = message_rx.try_recv().unwrap();
        assert!(matches!(second.pdu, CamPdu::StartStreamsRequest { .. }));
    }

    #[tokio::test]
    async fn stopping_one_stream_restarts_the_others() {
        let (device, message_rx, _error_rx) = device();
        drive_to_initialized(&device, &message_rx, 2);

        device.start_stream(0, h264_type()).unwrap();
        device.start_stream(1, h264_type()).unwrap();
        device.handle_message(success()).unwrap();
        device.handle_message(success()).unwrap();
        message_rx.try_iter().count();

        // stopping stream 0 stops everything; stream 1 must restart
        device.stop_stream(0).unwrap();
        let stop = message_rx.try_recv().unwrap();
        assert!(matches!(stop.pdu, CamPdu::StopStreamsRequest));

        device.handle_message(success()).unwrap();
        let restart = message_rx.try_recv().unwrap();
        let CamPdu::StartStreamsRequest { infos } = restart.pdu else {
            panic!("expected a restart for the still-running stream");
        };
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].0, 1);
    }

    #[tokio::test]
    async fn sample_flow_round_trip() {
        let (device, message_rx, _error_rx) = device();
        drive_to_initialized(&device, &message_rx, 1);

        device.start_stream(0, h264_type()).unwrap();
        device.handle_message(success()).unwrap();
        message_rx.try_iter().count();

        let stream = device.streams().into_iter().next().unwrap();
        let sample = Arc::new(SampleBuffer::new(0));
        device.request_sample(&stream, Arc::clone(&sample)).unwrap();

        let request = message_rx.try_recv().unwrap();
        assert_eq!(request.pdu, CamPdu::SampleRequest { stream_index: 0 });
        assert_eq!(stream.n_pending_samples(), 1);

        device
            .handle_message(CamMessage {
                version: 2,
                pdu: CamPdu::SampleResponse {
                    stream_index: 0,
                    sample: vec![0, 0, 0, 1, 0x67],
                },
            })
            .unwrap();
        assert_eq!(stream.n_pending_samples(), 0);
    }

    #[tokio::test]
    async fn sample_error_discards_the_request() {
        let (device, message_rx, _error_rx) = device();
        drive_to_initialized(&device, &message_rx, 1);

        device.start_stream(0, h264_type()).unwrap();
        device.handle_message(success()).unwrap();
        message_rx.try_iter().count();

        let stream = device.streams().into_iter().next().unwrap();
        device
            .request_sample(&stream, Arc::new(SampleBuffer::new(0)))
            .unwrap();

        device
            .handle_message(CamMessage {
                version: 2,
                pdu: CamPdu::SampleErrorResponse {
                    stream_index: 0,
                    error_code: crate::camera::pdu::CamErrorCode::UnexpectedError,
                },
            })
            .unwrap();
        assert_eq!(stream.n_pending_samples(), 0);
    }
}
