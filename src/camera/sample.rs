//! Sample buffers
//!
//! A [`SampleBuffer`] carries one encoded sample from the wire to the
//! decode session. The device keys its pending-sample bookkeeping on the
//! buffer's id; the stream remembers which PipeWire buffer the decoded
//! output lands in.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

static NEXT_SAMPLE_ID: AtomicU64 = AtomicU64::new(0);

/// One in-flight encoded sample
pub struct SampleBuffer {
    id: u64,
    stream_index: u8,
    data: Mutex<Vec<u8>>,
}

impl SampleBuffer {
    /// Create an empty sample for `stream_index`
    pub fn new(stream_index: u8) -> Self {
        Self {
            id: NEXT_SAMPLE_ID.fetch_add(1, Ordering::Relaxed),
            stream_index,
            data: Mutex::new(Vec::new()),
        }
    }

    /// Process-unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream the sample belongs to
    pub fn stream_index(&self) -> u8 {
        self.stream_index
    }

    /// Load the encoded bytes delivered by the peer
    pub fn load(&self, bytes: Vec<u8>) {
        *self.data.lock() = bytes;
    }

    /// Take the encoded bytes for decoding
    pub fn take_data(&self) -> Vec<u8> {
        std::mem::take(&mut self.data.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = SampleBuffer::new(0);
        let b = SampleBuffer::new(0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn load_take_round_trip() {
        let sample = SampleBuffer::new(3);
        assert_eq!(sample.stream_index(), 3);

        sample.load(vec![1, 2, 3]);
        assert_eq!(sample.take_data(), vec![1, 2, 3]);
        assert!(sample.take_data().is_empty());
    }
}
