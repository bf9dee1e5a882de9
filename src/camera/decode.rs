//! Software AVC420 decode session
//!
//! Decodes the H.264 elementary stream of one camera stream and writes
//! BGRA frames sized for the published video source. OpenH264 keeps its
//! own reference state; a decode session lives exactly as long as its
//! stream's current media type.

use openh264::decoder::Decoder;
use openh264::nal_units;

use super::{CameraError, Result};

/// Decoded BGRA frame
pub struct DecodedFrame {
    /// Frame width in pixels
    pub width: usize,
    /// Frame height in pixels
    pub height: usize,
    /// Tightly packed BGRA pixels
    pub data: Vec<u8>,
}

/// One stream's software decode session
pub struct DecodeSession {
    decoder: Decoder,
    expected_width: usize,
    expected_height: usize,
    n_pending_frames: u32,
}

impl DecodeSession {
    /// Create a session expecting frames of the negotiated size
    pub fn new(expected_width: u32, expected_height: u32) -> Result<Self> {
        let decoder = Decoder::new()
            .map_err(|e| CameraError::DecodeFailure(format!("Failed to create decoder: {e}")))?;

        Ok(Self {
            decoder,
            expected_width: expected_width as usize,
            expected_height: expected_height as usize,
            n_pending_frames: 0,
        })
    }

    /// Samples handed to the decoder whose output has not been consumed
    pub fn n_pending_frames(&self) -> u32 {
        self.n_pending_frames
    }

    /// Account for a sample that was requested but not yet decoded
    pub fn notify_frame_pending(&mut self) {
        self.n_pending_frames += 1;
    }

    /// Account for a consumed or discarded sample
    pub fn notify_frame_done(&mut self) {
        self.n_pending_frames = self.n_pending_frames.saturating_sub(1);
    }

    /// Decode one H.264 sample into a BGRA frame
    ///
    /// The peer may fragment an access unit over NAL units; a sample that
    /// completes no picture yields `Ok(None)`.
    pub fn decode_sample(&mut self, sample: &[u8]) -> Result<Option<DecodedFrame>> {
        let mut decoded = None;

        for packet in nal_units(sample) {
            let maybe_yuv = self
                .decoder
                .decode(packet)
                .map_err(|e| CameraError::DecodeFailure(format!("H.264 decode failed: {e}")))?;

            if let Some(yuv) = maybe_yuv {
                let (width, height) = yuv.dimensions();

                let mut data = vec![0u8; width * height * 4];
                yuv.write_rgba8(&mut data);
                // decoded output feeds BGRA consumers: swap R and B in place
                for pixel in data.chunks_exact_mut(4) {
                    pixel.swap(0, 2);
                }

                decoded = Some(DecodedFrame { width, height, data });
            }
        }

        if let Some(frame) = &decoded {
            if frame.width != self.expected_width || frame.height != self.expected_height {
                return Err(CameraError::DecodeFailure(format!(
                    "Decoded frame is {}x{}, media type negotiated {}x{}",
                    frame.width, frame.height, self.expected_width, self.expected_height
                )));
            }
        }

        Ok(decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_creation_succeeds() {
        let session = DecodeSession::new(640, 480).unwrap();
        assert_eq!(session.n_pending_frames(), 0);
    }

    #[test]
    fn pending_frame_accounting_saturates() {
        let mut session = DecodeSession::new(640, 480).unwrap();
        session.notify_frame_pending();
        session.notify_frame_pending();
        assert_eq!(session.n_pending_frames(), 2);

        session.notify_frame_done();
        session.notify_frame_done();
        session.notify_frame_done();
        assert_eq!(session.n_pending_frames(), 0);
    }

    #[test]
    fn garbage_sample_produces_no_frame_or_error() {
        let mut session = DecodeSession::new(640, 480).unwrap();
        // not a valid access unit: either no frame or a decode error,
        // never a bogus frame
        match session.decode_sample(&[0, 0, 0, 1, 0xff, 0xee, 0xdd]) {
            Ok(None) | Err(_) => {}
            Ok(Some(_)) => panic!("garbage must not decode into a frame"),
        }
    }
}
