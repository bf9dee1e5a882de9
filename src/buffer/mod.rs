//! Buffer Substrate
//!
//! Pools reusable framebuffers with single-producer/single-consumer
//! ownership semantics. A [`BufferPool`] owns a set of uniformly sized
//! buffers; consumers acquire a buffer, hold it exclusively, and release it
//! back exactly once. The pool grows lazily past its minimum size and
//! shrinks back on a deferred resize pass once demand drops.
//!
//! Buffers carry one of three storage backings:
//! - host memory (pool-minted),
//! - a dma-buf (fd + offset + DRM format modifier) suitable for GPU import,
//! - a mem-fd mapping shared with the producing side.
//!
//! A buffer may additionally hold a transient GPU-side mapping (CUDA device
//! pointer or Vulkan image import). The mapping is independent of buffer
//! ownership and must be released before the buffer returns to the pool.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Errors produced by the buffer substrate
#[derive(Debug, Error)]
pub enum BufferError {
    /// Resize was requested while buffers are outstanding
    #[error("Buffer pool busy: {outstanding} buffer(s) outstanding")]
    PoolBusy {
        /// Number of buffers currently acquired
        outstanding: u32,
    },

    /// Mapping a mem-fd buffer failed
    #[error("Failed to map buffer memory: {0}")]
    MapFailed(#[from] std::io::Error),
}

/// Result type for buffer operations
pub type Result<T> = std::result::Result<T, BufferError>;

/// Pixel format of a framebuffer
///
/// Both variants are packed 32-bit little-endian layouts; the damage
/// detector and the encoders only rely on the 4-byte pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Blue, green, red, padding
    Bgrx32,
    /// Alpha, red, green, blue
    Argb32,
}

impl FrameFormat {
    /// Bytes per pixel (always 4 for the supported packed formats)
    #[inline]
    pub fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// Transient GPU-side mapping of a buffer
///
/// Held while a GPU adapter has the buffer imported. Released before the
/// buffer is returned to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMapping {
    /// CUDA device pointer obtained from a graphics-resource mapping
    Cuda(u64),
    /// Vulkan image imported from a dma-buf (opaque handle value)
    VulkanImage(u64),
}

/// Storage backing of a [`Buffer`]
pub enum BufferStorage {
    /// Pool-allocated host memory
    Host(Vec<u8>),
    /// dma-buf handle for GPU import; no CPU mapping
    DmaBuf {
        /// dma-buf file descriptor
        fd: OwnedFd,
        /// byte offset of the plane within the dma-buf
        offset: u32,
        /// DRM format modifier
        modifier: u64,
    },
    /// mem-fd shared memory, mapped on this side
    MemFd {
        /// mem-fd file descriptor
        fd: OwnedFd,
        /// writable mapping of the fd
        map: MmapMut,
    },
}

impl std::fmt::Debug for BufferStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host(data) => f.debug_tuple("Host").field(&data.len()).finish(),
            Self::DmaBuf { fd, offset, modifier } => f
                .debug_struct("DmaBuf")
                .field("fd", &fd.as_raw_fd())
                .field("offset", offset)
                .field("modifier", modifier)
                .finish(),
            Self::MemFd { fd, map } => f
                .debug_struct("MemFd")
                .field("fd", &fd.as_raw_fd())
                .field("len", &map.len())
                .finish(),
        }
    }
}

/// One captured framebuffer
#[derive(Debug)]
pub struct Buffer {
    width: u32,
    height: u32,
    stride: u32,
    format: FrameFormat,
    storage: BufferStorage,
    gpu_mapping: Option<GpuMapping>,
}

impl Buffer {
    /// Create a host-memory buffer of the given dimensions
    pub fn new_host(width: u32, height: u32, stride: u32) -> Self {
        Self {
            width,
            height,
            stride,
            format: FrameFormat::Bgrx32,
            storage: BufferStorage::Host(vec![0; stride as usize * height as usize]),
            gpu_mapping: None,
        }
    }

    /// Wrap an externally provided dma-buf
    pub fn from_dma_buf(
        width: u32,
        height: u32,
        stride: u32,
        fd: OwnedFd,
        offset: u32,
        modifier: u64,
    ) -> Self {
        Self {
            width,
            height,
            stride,
            format: FrameFormat::Bgrx32,
            storage: BufferStorage::DmaBuf { fd, offset, modifier },
            gpu_mapping: None,
        }
    }

    /// Wrap and map an externally provided mem-fd
    pub fn from_mem_fd(width: u32, height: u32, stride: u32, fd: OwnedFd) -> Result<Self> {
        let map = unsafe { MmapMut::map_mut(fd.as_raw_fd())? };
        Ok(Self {
            width,
            height,
            stride,
            format: FrameFormat::Bgrx32,
            storage: BufferStorage::MemFd { fd, map },
            gpu_mapping: None,
        })
    }

    /// Buffer width in pixels
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Buffer height in pixels
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in bytes
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Pixel format
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    /// Storage backing
    pub fn storage(&self) -> &BufferStorage {
        &self.storage
    }

    /// CPU-visible pixel data, if the backing has any
    ///
    /// dma-buf backed buffers have no local data; their content is reached
    /// through a GPU import.
    pub fn local_data(&self) -> Option<&[u8]> {
        match &self.storage {
            BufferStorage::Host(data) => Some(data),
            BufferStorage::MemFd { map, .. } => Some(&map[..]),
            BufferStorage::DmaBuf { .. } => None,
        }
    }

    /// Mutable CPU-visible pixel data, if the backing has any
    pub fn local_data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.storage {
            BufferStorage::Host(data) => Some(data),
            BufferStorage::MemFd { map, .. } => Some(&mut map[..]),
            BufferStorage::DmaBuf { .. } => None,
        }
    }

    /// Attach a transient GPU mapping
    pub fn set_gpu_mapping(&mut self, mapping: GpuMapping) {
        debug_assert!(self.gpu_mapping.is_none(), "buffer already mapped on the GPU");
        self.gpu_mapping = Some(mapping);
    }

    /// Current GPU mapping, if any
    pub fn gpu_mapping(&self) -> Option<GpuMapping> {
        self.gpu_mapping
    }

    /// Drop the transient GPU mapping
    pub fn clear_gpu_mapping(&mut self) -> Option<GpuMapping> {
        self.gpu_mapping.take()
    }

    fn resize(&mut self, width: u32, height: u32, stride: u32) {
        self.width = width;
        self.height = height;
        self.stride = stride;
        if let BufferStorage::Host(data) = &mut self.storage {
            data.resize(stride as usize * height as usize, 0);
        }
    }
}

// =============================================================================
// Buffer pool
// =============================================================================

struct BufferSize {
    width: u32,
    height: u32,
    stride: u32,
}

struct PoolState {
    /// Slot id -> (buffer if not taken, taken flag)
    slots: HashMap<u64, Option<Buffer>>,
    next_slot: u64,
    buffers_taken: u32,
    size: Option<BufferSize>,
}

impl PoolState {
    fn pool_size(&self) -> u32 {
        self.slots.len() as u32
    }

    fn add_buffer(&mut self) -> u64 {
        let slot = self.next_slot;
        self.next_slot += 1;

        let buffer = match &self.size {
            Some(size) => Buffer::new_host(size.width, size.height, size.stride),
            None => Buffer::new_host(0, 0, 0),
        };
        self.slots.insert(slot, Some(buffer));

        slot
    }

    fn should_shrink(&self, minimum: u32) -> bool {
        let pool_size = self.pool_size();
        pool_size > minimum && pool_size > self.buffers_taken
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    minimum_pool_size: u32,
    shrink_notify: Notify,
}

/// Pool of uniformly sized framebuffers
///
/// Serves `acquire` / `release` under concurrent access. Releasing arms a
/// deferred shrink task that trims free buffers back down to the minimum
/// pool size; after the task has run, the pool size is exactly
/// `max(minimum, outstanding)`.
pub struct BufferPool {
    shared: Arc<PoolShared>,
    shrink_task: Option<tokio::task::JoinHandle<()>>,
}

impl BufferPool {
    /// Create a pool holding `minimum_size` buffers
    ///
    /// When a runtime is present, releases arm a deferred shrink task;
    /// without one the shrink pass runs on demand via
    /// [`BufferPool::run_deferred_shrink`].
    pub fn new(minimum_size: u32) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                slots: HashMap::new(),
                next_slot: 0,
                buffers_taken: 0,
                size: None,
            }),
            minimum_pool_size: minimum_size,
            shrink_notify: Notify::new(),
        });

        {
            let mut state = shared.state.lock();
            while state.pool_size() < minimum_size {
                state.add_buffer();
            }
        }

        let shrink_task = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let task_shared = Arc::clone(&shared);
            handle.spawn(async move {
                loop {
                    task_shared.shrink_notify.notified().await;
                    shrink_pool(&task_shared);
                }
            })
        });

        Self { shared, shrink_task }
    }

    /// Resize all pooled buffers
    ///
    /// Permitted only while zero buffers are outstanding; fails with
    /// [`BufferError::PoolBusy`] otherwise.
    pub fn resize_buffers(&self, width: u32, height: u32, stride: u32) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.buffers_taken != 0 {
            return Err(BufferError::PoolBusy {
                outstanding: state.buffers_taken,
            });
        }

        state.size = Some(BufferSize { width, height, stride });
        for buffer in state.slots.values_mut() {
            buffer
                .as_mut()
                .expect("no buffer may be taken during resize")
                .resize(width, height, stride);
        }

        debug!("Resized buffer pool to {}x{} (stride {})", width, height, stride);
        Ok(())
    }

    /// Acquire an unused buffer, minting a new one if the free set is empty
    pub fn acquire(&self) -> PooledBuffer {
        let mut state = self.shared.state.lock();

        let slot = state
            .slots
            .iter()
            .find(|(_, buffer)| buffer.is_some())
            .map(|(slot, _)| *slot)
            .unwrap_or_else(|| state.add_buffer());

        let buffer = state
            .slots
            .get_mut(&slot)
            .and_then(Option::take)
            .expect("selected slot holds a free buffer");
        state.buffers_taken += 1;

        trace!("Acquired buffer slot {} ({} taken)", slot, state.buffers_taken);

        PooledBuffer {
            shared: Arc::clone(&self.shared),
            slot,
            buffer: Some(buffer),
        }
    }

    /// Current pool size (free + outstanding)
    pub fn pool_size(&self) -> u32 {
        self.shared.state.lock().pool_size()
    }

    /// Number of buffers currently acquired
    pub fn outstanding(&self) -> u32 {
        self.shared.state.lock().buffers_taken
    }

    /// Run the deferred shrink pass synchronously
    ///
    /// Test hook; production code relies on the armed task.
    pub fn run_deferred_shrink(&self) {
        shrink_pool(&self.shared);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        if let Some(shrink_task) = &self.shrink_task {
            shrink_task.abort();
        }
    }
}

fn shrink_pool(shared: &PoolShared) {
    let mut state = shared.state.lock();

    while state.should_shrink(shared.minimum_pool_size) {
        let free_slot = state
            .slots
            .iter()
            .find(|(_, buffer)| buffer.is_some())
            .map(|(slot, _)| *slot);
        match free_slot {
            Some(slot) => {
                state.slots.remove(&slot);
            }
            None => break,
        }
    }
}

/// Exclusively owned handle to a pooled [`Buffer`]
///
/// Returns the buffer to its pool when dropped. Any GPU mapping must be
/// cleared before that point.
pub struct PooledBuffer {
    shared: Arc<PoolShared>,
    slot: u64,
    buffer: Option<Buffer>,
}

impl PooledBuffer {
    /// Release the buffer back to the pool
    pub fn release(self) {
        drop(self);
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        self.buffer.as_ref().expect("buffer present until drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Buffer {
        self.buffer.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = self.buffer.take().expect("double release");
        // a transient GPU mapping never outlives the loan
        buffer.clear_gpu_mapping();

        let mut state = self.shared.state.lock();
        let slot = state
            .slots
            .get_mut(&self.slot)
            .expect("released buffer belongs to this pool");
        assert!(slot.is_none(), "buffer slot released twice");
        *slot = Some(buffer);
        assert!(state.buffers_taken > 0);
        state.buffers_taken -= 1;

        let queue_shrink = state.should_shrink(self.shared.minimum_pool_size);
        drop(state);

        if queue_shrink {
            self.shared.shrink_notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_starts_at_minimum_size() {
        let pool = BufferPool::new(3);
        assert_eq!(pool.pool_size(), 3);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn acquire_grows_past_minimum() {
        let pool = BufferPool::new(2);

        let a = pool.acquire();
        let b = pool.acquire();
        let c = pool.acquire();
        assert_eq!(pool.pool_size(), 3);
        assert_eq!(pool.outstanding(), 3);

        drop(a);
        drop(b);
        drop(c);
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn deferred_shrink_restores_minimum() {
        let pool = BufferPool::new(2);

        let buffers: Vec<_> = (0..5).map(|_| pool.acquire()).collect();
        assert_eq!(pool.pool_size(), 5);

        drop(buffers);
        pool.run_deferred_shrink();
        assert_eq!(pool.pool_size(), 2);
    }

    #[tokio::test]
    async fn shrink_keeps_outstanding_buffers() {
        let pool = BufferPool::new(1);

        let held: Vec<_> = (0..4).map(|_| pool.acquire()).collect();
        let released = pool.acquire();
        drop(released);

        pool.run_deferred_shrink();
        // max(minimum, outstanding) buffers remain
        assert_eq!(pool.pool_size(), 4);
        drop(held);
    }

    #[tokio::test]
    async fn resize_fails_while_busy() {
        let pool = BufferPool::new(1);
        let held = pool.acquire();

        let result = pool.resize_buffers(1920, 1080, 1920 * 4);
        assert!(matches!(result, Err(BufferError::PoolBusy { outstanding: 1 })));

        drop(held);
        pool.resize_buffers(1920, 1080, 1920 * 4).unwrap();

        let buffer = pool.acquire();
        assert_eq!(buffer.width(), 1920);
        assert_eq!(buffer.local_data().unwrap().len(), 1920 * 4 * 1080);
    }

    #[tokio::test]
    async fn gpu_mapping_is_transient() {
        let pool = BufferPool::new(1);
        pool.resize_buffers(64, 64, 64 * 4).unwrap();

        let mut buffer = pool.acquire();
        buffer.set_gpu_mapping(GpuMapping::Cuda(0xdead_beef));
        assert_eq!(buffer.gpu_mapping(), Some(GpuMapping::Cuda(0xdead_beef)));
        assert_eq!(buffer.clear_gpu_mapping(), Some(GpuMapping::Cuda(0xdead_beef)));
        assert!(buffer.gpu_mapping().is_none());
    }
}
