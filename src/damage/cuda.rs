//! GPU-assisted damage detector
//!
//! Keeps per-pixel damage bytes and a single any-dirty byte in device
//! memory. Per submit, `check_damaged_pixel` runs over the surface; when
//! the region is queried, six column-halving and six row-halving passes
//! reduce the per-pixel array before the tile-granularity downsample is
//! copied back to host memory.

use std::sync::Arc;

use cudarc::driver::{CudaSlice, CudaStream};
use tracing::warn;

use crate::buffer::{GpuMapping, PooledBuffer};
use crate::hwaccel::nvidia::NvidiaAccel;

use super::{
    collect_damage_rects, tile_grid, DamageDetector, DamageError, DamageRegion, Result,
};

/// CUDA damage detector
pub struct CudaDetector {
    hwaccel: Arc<NvidiaAccel>,
    stream: Arc<CudaStream>,

    surface_width: u32,
    surface_height: u32,

    cols: u32,
    rows: u32,

    last_framebuffer: Option<PooledBuffer>,

    region_is_damaged: CudaSlice<u8>,
    damage_array: Option<CudaSlice<u8>>,
    simplified_damage_array: Option<CudaSlice<u8>>,
}

impl CudaDetector {
    /// Create a detector bound to a per-surface CUDA stream
    pub fn new(hwaccel: Arc<NvidiaAccel>, stream: Arc<CudaStream>) -> Result<Self> {
        let region_is_damaged = hwaccel
            .alloc_device_bytes(&stream, 1)
            .map_err(|e| DamageError::GpuFailure(e.to_string()))?;

        Ok(Self {
            hwaccel,
            stream,
            surface_width: 0,
            surface_height: 0,
            cols: 0,
            rows: 0,
            last_framebuffer: None,
            region_is_damaged,
            damage_array: None,
            simplified_damage_array: None,
        })
    }

    fn mark_all_damaged(&mut self) -> Result<()> {
        let damage_array = self.damage_array.as_mut().expect("damage array allocated");
        self.hwaccel
            .memset_device_bytes(&self.stream, damage_array, 1)
            .and_then(|_| {
                self.hwaccel
                    .memset_device_bytes(&self.stream, &mut self.region_is_damaged, 1)
            })
            .map_err(|e| DamageError::GpuFailure(e.to_string()))
    }

    fn mapped_cuda_pointer(buffer: &PooledBuffer) -> Result<u64> {
        match buffer.gpu_mapping() {
            Some(GpuMapping::Cuda(pointer)) => Ok(pointer),
            _ => Err(DamageError::GpuFailure(
                "Framebuffer has no CUDA mapping".into(),
            )),
        }
    }
}

impl DamageDetector for CudaDetector {
    fn invalidate_surface(&mut self) {
        self.last_framebuffer.take();

        if self.damage_array.is_none() {
            return;
        }
        if let Err(e) = self.mark_all_damaged() {
            warn!("Failed to invalidate GPU damage state: {e}");
        }
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()> {
        self.last_framebuffer.take();
        self.damage_array = None;
        self.simplified_damage_array = None;

        self.surface_width = width;
        self.surface_height = height;

        let (cols, rows) = tile_grid(width, height);
        self.cols = cols;
        self.rows = rows;

        let damage_array = self
            .hwaccel
            .alloc_device_bytes(&self.stream, width as usize * height as usize)
            .map_err(|e| DamageError::GpuFailure(e.to_string()))?;
        let simplified = self
            .hwaccel
            .alloc_device_bytes(&self.stream, (cols * rows) as usize)
            .map_err(|e| DamageError::GpuFailure(e.to_string()))?;

        self.damage_array = Some(damage_array);
        self.simplified_damage_array = Some(simplified);

        self.mark_all_damaged()
    }

    fn submit_new_framebuffer(&mut self, buffer: PooledBuffer) -> Result<()> {
        assert!(self.damage_array.is_some());

        let Some(last_framebuffer) = self.last_framebuffer.take() else {
            self.mark_all_damaged()?;
            self.last_framebuffer = Some(buffer);
            return Ok(());
        };

        self.hwaccel
            .memset_device_bytes(&self.stream, &mut self.region_is_damaged, 0)
            .map_err(|e| DamageError::GpuFailure(e.to_string()))?;

        let current = Self::mapped_cuda_pointer(&buffer)?;
        let previous = Self::mapped_cuda_pointer(&last_framebuffer)?;

        self.hwaccel
            .launch_check_damaged_pixel(
                &self.stream,
                self.damage_array.as_mut().expect("allocated"),
                &mut self.region_is_damaged,
                current,
                previous,
                self.surface_width,
                self.surface_height,
            )
            .map_err(|e| DamageError::GpuFailure(e.to_string()))?;

        drop(last_framebuffer);
        self.last_framebuffer = Some(buffer);

        Ok(())
    }

    fn current_framebuffer(&self) -> Option<&crate::buffer::Buffer> {
        self.last_framebuffer.as_deref()
    }

    fn is_region_damaged(&mut self) -> bool {
        assert!(self.damage_array.is_some());
        assert!(self.last_framebuffer.is_some());

        let mut is_damaged = [0u8; 1];
        if let Err(e) =
            self.hwaccel
                .read_device_bytes(&self.stream, &self.region_is_damaged, &mut is_damaged)
        {
            warn!("Failed to read any-dirty byte: {e}");
            // treat as damaged; the region query will surface the failure
            return true;
        }

        is_damaged[0] != 0
    }

    fn get_damage_region(&mut self) -> Result<Vec<DamageRegion>> {
        assert!(self.last_framebuffer.is_some());

        let damage_array = self.damage_array.as_mut().expect("allocated");
        let simplified = self.simplified_damage_array.as_mut().expect("allocated");

        self.hwaccel
            .launch_damage_reduction(
                &self.stream,
                damage_array,
                simplified,
                self.surface_width,
                self.surface_height,
                self.cols,
            )
            .map_err(|e| DamageError::GpuFailure(e.to_string()))?;

        let mut host_tiles = vec![0u8; (self.cols * self.rows) as usize];
        self.hwaccel
            .read_device_bytes(&self.stream, simplified, &mut host_tiles)
            .map_err(|e| DamageError::ReadbackFailed(e.to_string()))?;

        Ok(collect_damage_rects(
            &host_tiles,
            self.cols,
            self.rows,
            self.surface_width,
            self.surface_height,
        ))
    }
}
