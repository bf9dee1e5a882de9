//! Encode-view creation
//!
//! An encoder consumes a framebuffer either as CPU-visible pixel data or
//! as GPU memory. A [`ViewCreator`] produces that view in two phases:
//! `create_view` starts the work, `finish_view` blocks until the view is
//! usable. The split lets the render thread overlap CPU-side damage
//! detection with GPU-side uploads and downloads.

use thiserror::Error;

use crate::buffer::Buffer;

/// Errors produced during view creation
#[derive(Debug, Error)]
pub enum ViewError {
    /// The framebuffer backing is incompatible with this creator
    #[error("Unsupported framebuffer backing: {0}")]
    UnsupportedBacking(&'static str),

    /// GPU-side work failed
    #[error("View creation failed: {0}")]
    Failed(String),
}

/// Result type for view creation
pub type Result<T> = std::result::Result<T, ViewError>;

/// Two-phase encode-view production
pub trait ViewCreator: Send {
    /// Start producing the encode view for `buffer`
    fn create_view(&mut self, buffer: &mut Buffer) -> Result<()>;

    /// Block until the started view is complete and bind it to `buffer`
    fn finish_view(&mut self, buffer: &mut Buffer) -> Result<()>;
}

/// View creator for CPU-visible framebuffers
///
/// Host and mem-fd backed buffers already carry their pixel data; both
/// phases only validate the backing.
pub struct DirectViewCreator;

impl ViewCreator for DirectViewCreator {
    fn create_view(&mut self, buffer: &mut Buffer) -> Result<()> {
        if buffer.local_data().is_none() {
            return Err(ViewError::UnsupportedBacking(
                "dma-buf frames need a GPU-interop view creator",
            ));
        }
        Ok(())
    }

    fn finish_view(&mut self, _buffer: &mut Buffer) -> Result<()> {
        Ok(())
    }
}

#[cfg(feature = "nvenc")]
pub use gpu::GpuInteropViewCreator;

/// CUDA upload view creator
///
/// Keeps two device copies (current and previous) so the GPU damage
/// detector can compare without re-uploading. The upload runs as a posted
/// task on the EGL worker, serializing it with all other GPU-interop
/// work; `finish_view` waits for the task and attaches the device pointer
/// as the buffer's transient GPU mapping.
#[cfg(feature = "nvenc")]
mod gpu {
    use std::sync::Arc;

    use cudarc::driver::{CudaSlice, CudaStream, DevicePtr};
    use parking_lot::Mutex;

    use crate::buffer::{Buffer, GpuMapping};
    use crate::egl::EglThread;
    use crate::hwaccel::nvidia::NvidiaAccel;
    use crate::utils::SyncPoint;

    use super::{Result, ViewCreator, ViewError};

    /// CUDA upload view creator
    pub struct GpuInteropViewCreator {
        hwaccel: Arc<NvidiaAccel>,
        egl_thread: Arc<EglThread>,
        stream: Arc<CudaStream>,
        slots: [Arc<Mutex<Option<CudaSlice<u8>>>>; 2],
        current_slot: usize,
        pending: Option<(Arc<SyncPoint>, Arc<Mutex<Option<u64>>>)>,
    }

    impl GpuInteropViewCreator {
        /// Create a view creator bound to a per-surface CUDA stream
        pub fn new(
            hwaccel: Arc<NvidiaAccel>,
            egl_thread: Arc<EglThread>,
            stream: Arc<CudaStream>,
        ) -> Self {
            Self {
                hwaccel,
                egl_thread,
                stream,
                slots: [Arc::new(Mutex::new(None)), Arc::new(Mutex::new(None))],
                current_slot: 0,
                pending: None,
            }
        }
    }

    impl ViewCreator for GpuInteropViewCreator {
        fn create_view(&mut self, buffer: &mut Buffer) -> Result<()> {
            let Some(data) = buffer.local_data() else {
                return Err(ViewError::UnsupportedBacking(
                    "zero-copy dma-buf import is handled by the Vulkan adapter",
                ));
            };
            let data = data.to_vec();

            self.current_slot ^= 1;
            let slot = Arc::clone(&self.slots[self.current_slot]);
            let hwaccel = Arc::clone(&self.hwaccel);
            let stream = Arc::clone(&self.stream);

            let sync_point = Arc::new(SyncPoint::new());
            let completion = Arc::clone(&sync_point);
            let ptr_cell = Arc::new(Mutex::new(None::<u64>));
            let ptr_out = Arc::clone(&ptr_cell);

            self.egl_thread.post(move |_context| {
                let mut slot = slot.lock();

                let needs_alloc = slot.as_ref().map(|s| s.len() != data.len()).unwrap_or(true);
                if needs_alloc {
                    match hwaccel.alloc_device_bytes(&stream, data.len()) {
                        Ok(frame) => *slot = Some(frame),
                        Err(_) => {
                            completion.complete(false);
                            return;
                        }
                    }
                }

                let frame = slot.as_mut().expect("slot allocated above");
                if hwaccel.upload_bgrx_frame(&stream, &data, frame).is_err() {
                    completion.complete(false);
                    return;
                }

                let (device_ptr, _record) = frame.device_ptr(&stream);
                *ptr_out.lock() = Some(device_ptr);
                completion.complete(true);
            });

            self.pending = Some((sync_point, ptr_cell));
            Ok(())
        }

        fn finish_view(&mut self, buffer: &mut Buffer) -> Result<()> {
            let Some((sync_point, ptr_cell)) = self.pending.take() else {
                return Ok(());
            };

            if !sync_point.wait_for_completion() {
                return Err(ViewError::Failed("device upload failed".into()));
            }

            let device_ptr = ptr_cell
                .lock()
                .take()
                .ok_or_else(|| ViewError::Failed("upload task produced no view".into()))?;

            buffer.clear_gpu_mapping();
            buffer.set_gpu_mapping(GpuMapping::Cuda(device_ptr));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;

    #[tokio::test]
    async fn direct_creator_accepts_host_frames() {
        let pool = BufferPool::new(1);
        pool.resize_buffers(16, 16, 64).unwrap();
        let mut buffer = pool.acquire();

        let mut creator = DirectViewCreator;
        creator.create_view(&mut buffer).unwrap();
        creator.finish_view(&mut buffer).unwrap();
    }
}
