//! Dynamic virtual channel adapters
//!
//! Bridge the enumerator and device state machines onto the ironrdp DVC
//! machinery. Responses produced while handling a payload are drained
//! back as the processor's batch; asynchronous sends (sample requests
//! from the frame clock) queue up for the next transport flush.

use std::collections::VecDeque;
use std::sync::Arc;

use ironrdp_core::impl_as_any;
use ironrdp_dvc::{DvcMessage, DvcProcessor, DvcServerProcessor};
use ironrdp_pdu::{decode_err, pdu_other_err, PduResult};
use parking_lot::Mutex;

use super::device::{CamPduSink, CameraDevice};
use super::enumerator::{CameraEnumerator, DeviceFactory};
use super::pdu::CamMessage;
use super::Result;

/// The enumerator's well-known channel name
pub const ENUMERATOR_CHANNEL_NAME: &str = "RDCamera_Device_Enumerator";

impl ironrdp_dvc::DvcPduEncode for CamMessage {}

/// Sink pushing emitted messages onto a shared queue
///
/// Device factories pair one of these with each device they create and
/// hand the queue to the device's [`CameraDeviceProcessor`].
pub struct QueueSink {
    queue: Arc<Mutex<VecDeque<CamMessage>>>,
}

impl QueueSink {
    /// Create a sink and the queue it feeds
    pub fn new() -> (Self, Arc<Mutex<VecDeque<CamMessage>>>) {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                queue: Arc::clone(&queue),
            },
            queue,
        )
    }
}

impl CamPduSink for QueueSink {
    fn send(&mut self, message: CamMessage) -> Result<()> {
        self.queue.lock().push_back(message);
        Ok(())
    }
}

fn drain(queue: &Mutex<VecDeque<CamMessage>>) -> Vec<DvcMessage> {
    queue
        .lock()
        .drain(..)
        .map(|message| Box::new(message) as DvcMessage)
        .collect()
}

/// DVC processor for the enumerator channel
pub struct CameraEnumeratorProcessor {
    enumerator: Arc<CameraEnumerator>,
    outgoing: Arc<Mutex<VecDeque<CamMessage>>>,
}

impl CameraEnumeratorProcessor {
    /// Create the processor and its enumerator
    pub fn new<F, T>(factory: F, on_teardown: T) -> (Self, Arc<CameraEnumerator>)
    where
        F: DeviceFactory + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        let (sink, outgoing) = QueueSink::new();
        let enumerator = Arc::new(CameraEnumerator::new(sink, factory, on_teardown));

        (
            Self {
                enumerator: Arc::clone(&enumerator),
                outgoing,
            },
            enumerator,
        )
    }
}

impl_as_any!(CameraEnumeratorProcessor);

impl DvcProcessor for CameraEnumeratorProcessor {
    fn channel_name(&self) -> &str {
        ENUMERATOR_CHANNEL_NAME
    }

    fn start(&mut self, _channel_id: u32) -> PduResult<Vec<DvcMessage>> {
        Ok(Vec::new())
    }

    fn process(&mut self, _channel_id: u32, payload: &[u8]) -> PduResult<Vec<DvcMessage>> {
        let message: CamMessage = ironrdp_core::decode(payload).map_err(|e| decode_err!(e))?;

        if let Err(e) = self.enumerator.handle_message(message) {
            tracing::warn!("Camera enumerator rejected a message: {e}");
            return Err(pdu_other_err!("camera enumerator protocol error"));
        }

        Ok(drain(&self.outgoing))
    }
}

impl DvcServerProcessor for CameraEnumeratorProcessor {}

/// DVC processor for one device channel
pub struct CameraDeviceProcessor {
    device: Arc<CameraDevice>,
    outgoing: Arc<Mutex<VecDeque<CamMessage>>>,
    channel_name: String,
}

impl CameraDeviceProcessor {
    /// Wrap a device and its outgoing queue
    pub fn new(device: Arc<CameraDevice>, outgoing: Arc<Mutex<VecDeque<CamMessage>>>) -> Self {
        let channel_name = String::from_utf8_lossy(device.dvc_name()).into_owned();
        Self {
            device,
            outgoing,
            channel_name,
        }
    }

    /// Messages queued since the last drain (sample requests)
    pub fn drain_output(&self) -> Vec<DvcMessage> {
        drain(&self.outgoing)
    }
}

impl_as_any!(CameraDeviceProcessor);

impl DvcProcessor for CameraDeviceProcessor {
    fn channel_name(&self) -> &str {
        &self.channel_name
    }

    fn start(&mut self, _channel_id: u32) -> PduResult<Vec<DvcMessage>> {
        if let Err(e) = self.device.notify_channel_opened() {
            tracing::warn!("Camera device activation failed: {e}");
            return Err(pdu_other_err!("camera device activation error"));
        }
        Ok(self.drain_output())
    }

    fn process(&mut self, _channel_id: u32, payload: &[u8]) -> PduResult<Vec<DvcMessage>> {
        let message: CamMessage = ironrdp_core::decode(payload).map_err(|e| decode_err!(e))?;

        if let Err(e) = self.device.handle_message(message) {
            tracing::warn!("Camera device rejected a message: {e}");
            return Err(pdu_other_err!("camera device protocol error"));
        }

        Ok(self.drain_output())
    }
}

impl DvcServerProcessor for CameraDeviceProcessor {}
