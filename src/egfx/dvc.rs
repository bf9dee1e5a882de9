//! Dynamic virtual channel adapter
//!
//! Bridges the [`GraphicsPipeline`] onto the ironrdp DVC machinery: the
//! channel's incoming payloads are decoded and dispatched, and every PDU
//! the pipeline emits while handling them is drained back as the
//! processor's response batch. Server-push frames flow through the same
//! queue and are collected by the transport whenever it flushes.

use std::collections::VecDeque;
use std::sync::Arc;

use ironrdp_core::impl_as_any;
use ironrdp_dvc::{DvcMessage, DvcProcessor, DvcServerProcessor};
use ironrdp_egfx::pdu::GfxPdu;
use ironrdp_pdu::{decode_err, pdu_other_err, PduResult};
use parking_lot::Mutex;

use super::pipeline::{GfxPduSink, GraphicsPipeline, PipelineEvent};
use super::rtt::NetworkAutodetection;
use super::Result;

/// Sink pushing emitted PDUs onto a shared queue
struct QueueSink {
    queue: Arc<Mutex<VecDeque<GfxPdu>>>,
}

impl GfxPduSink for QueueSink {
    fn send(&mut self, pdu: GfxPdu) -> Result<()> {
        self.queue.lock().push_back(pdu);
        Ok(())
    }
}

/// DVC processor for the graphics pipeline channel
pub struct GraphicsDvcProcessor {
    pipeline: Arc<GraphicsPipeline>,
    outgoing: Arc<Mutex<VecDeque<GfxPdu>>>,
}

impl GraphicsDvcProcessor {
    /// Create the processor and its pipeline
    pub fn new<E>(
        events: E,
        network_autodetection: Option<Arc<dyn NetworkAutodetection>>,
    ) -> (Self, Arc<GraphicsPipeline>)
    where
        E: Fn(PipelineEvent) + Send + Sync + 'static,
    {
        let outgoing = Arc::new(Mutex::new(VecDeque::new()));
        let pipeline = Arc::new(GraphicsPipeline::new(
            QueueSink {
                queue: Arc::clone(&outgoing),
            },
            events,
            network_autodetection,
        ));

        (
            Self {
                pipeline: Arc::clone(&pipeline),
                outgoing,
            },
            pipeline,
        )
    }

    /// PDUs queued since the last drain, for transport flushes between
    /// incoming payloads (server-push frames)
    pub fn drain_output(&self) -> Vec<DvcMessage> {
        self.outgoing
            .lock()
            .drain(..)
            .map(|pdu| Box::new(pdu) as DvcMessage)
            .collect()
    }
}

impl_as_any!(GraphicsDvcProcessor);

impl DvcProcessor for GraphicsDvcProcessor {
    fn channel_name(&self) -> &str {
        ironrdp_egfx::CHANNEL_NAME
    }

    fn start(&mut self, _channel_id: u32) -> PduResult<Vec<DvcMessage>> {
        self.pipeline.notify_channel_opened();
        Ok(self.drain_output())
    }

    fn process(&mut self, _channel_id: u32, payload: &[u8]) -> PduResult<Vec<DvcMessage>> {
        let pdu: GfxPdu = ironrdp_core::decode(payload).map_err(|e| decode_err!(e))?;

        if let Err(e) = self.pipeline.handle_pdu(pdu) {
            // the pipeline already notified the session; the channel dies
            tracing::warn!("Graphics pipeline rejected a PDU: {e}");
            return Err(pdu_other_err!("graphics pipeline protocol error"));
        }

        Ok(self.drain_output())
    }
}

impl DvcServerProcessor for GraphicsDvcProcessor {}

#[cfg(test)]
mod tests {
    use super::*;
    use ironrdp_core::encode_vec;
    use ironrdp_egfx::pdu::{CapabilitiesAdvertisePdu, CapabilitiesV104Flags, CapabilitySet};

    #[tokio::test]
    async fn caps_advertise_payload_produces_confirm_batch() {
        let (mut processor, _pipeline) = GraphicsDvcProcessor::new(|_event| {}, None);

        assert_eq!(processor.channel_name(), "Microsoft::Windows::RDS::Graphics");
        assert!(processor.start(7).unwrap().is_empty());

        let advertise = GfxPdu::CapabilitiesAdvertise(CapabilitiesAdvertisePdu(vec![
            CapabilitySet::V10_4 {
                flags: CapabilitiesV104Flags::SMALL_CACHE,
            },
        ]));
        let payload = encode_vec(&advertise).unwrap();

        let responses = processor.process(7, &payload).unwrap();
        assert_eq!(responses.len(), 1); // the CapabilitiesConfirm
    }

    #[tokio::test]
    async fn garbage_payload_is_a_decode_error() {
        let (mut processor, _pipeline) = GraphicsDvcProcessor::new(|_event| {}, None);
        assert!(processor.process(7, &[0xff, 0xff]).is_err());
    }
}
