//! Byte-compare damage detector
//!
//! Compares each 64×64 tile of the submitted frame against the previous one
//! row by row, marking a tile dirty on the first differing row. Duplicate
//! coverage in the resulting rectangle list is left to the encoder.

use tracing::trace;

use crate::buffer::PooledBuffer;

use super::{
    collect_damage_rects, tile_grid, tile_rect, DamageDetector, DamageError, DamageRegion, Result,
};

/// CPU tile-compare damage detector
pub struct MemcmpDetector {
    surface_width: u32,
    surface_height: u32,

    cols: u32,
    rows: u32,

    last_framebuffer: Option<PooledBuffer>,

    region_is_damaged: bool,
    damage_array: Vec<u8>,
}

impl MemcmpDetector {
    /// Create a detector with no tracked surface
    ///
    /// `resize_surface` must run before the first submit.
    pub fn new() -> Self {
        Self {
            surface_width: 0,
            surface_height: 0,
            cols: 0,
            rows: 0,
            last_framebuffer: None,
            region_is_damaged: false,
            damage_array: Vec::new(),
        }
    }

    fn mark_all_damaged(&mut self) {
        self.damage_array.fill(1);
        self.region_is_damaged = true;
    }
}

impl Default for MemcmpDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Row-by-row comparison of one tile between two frames
///
/// Slices are compared with the platform memcmp; rows are at most
/// 64 pixels (256 bytes) long.
fn is_tile_dirty(
    tile: DamageRegion,
    current: &[u8],
    previous: &[u8],
    stride: usize,
    bytes_per_pixel: usize,
) -> bool {
    let row_len = tile.width as usize * bytes_per_pixel;

    for y in tile.y..tile.y + tile.height {
        let offset = y as usize * stride + tile.x as usize * bytes_per_pixel;
        if current[offset..offset + row_len] != previous[offset..offset + row_len] {
            return true;
        }
    }

    false
}

impl DamageDetector for MemcmpDetector {
    fn invalidate_surface(&mut self) {
        self.last_framebuffer.take();

        if self.damage_array.is_empty() {
            return;
        }
        self.mark_all_damaged();
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<()> {
        self.last_framebuffer.take();

        self.surface_width = width;
        self.surface_height = height;

        let (cols, rows) = tile_grid(width, height);
        self.cols = cols;
        self.rows = rows;
        self.damage_array = vec![1; (cols * rows) as usize];
        self.region_is_damaged = true;

        Ok(())
    }

    fn submit_new_framebuffer(&mut self, buffer: PooledBuffer) -> Result<()> {
        assert!(!self.damage_array.is_empty());

        let Some(last_framebuffer) = self.last_framebuffer.take() else {
            self.last_framebuffer = Some(buffer);
            self.mark_all_damaged();
            return Ok(());
        };

        let current = buffer.local_data().ok_or(DamageError::NoLocalData)?;
        let previous = last_framebuffer.local_data().ok_or(DamageError::NoLocalData)?;

        let stride = buffer.stride() as usize;
        let bpp = buffer.format().bytes_per_pixel();

        let mut region_is_damaged = false;
        for row in 0..self.rows {
            for col in 0..self.cols {
                let tile = tile_rect(col, row, self.surface_width, self.surface_height);

                let tile_damaged = is_tile_dirty(tile, current, previous, stride, bpp);
                if tile_damaged {
                    region_is_damaged = true;
                }

                self.damage_array[(row * self.cols + col) as usize] = u8::from(tile_damaged);
            }
        }

        trace!(
            "Tile comparison: {}x{} grid, damaged: {}",
            self.cols,
            self.rows,
            region_is_damaged
        );

        // previous comparison frame returns to the pool here
        drop(last_framebuffer);
        self.last_framebuffer = Some(buffer);
        self.region_is_damaged = region_is_damaged;

        Ok(())
    }

    fn current_framebuffer(&self) -> Option<&crate::buffer::Buffer> {
        self.last_framebuffer.as_deref()
    }

    fn is_region_damaged(&mut self) -> bool {
        assert!(!self.damage_array.is_empty());
        assert!(self.last_framebuffer.is_some());

        self.region_is_damaged
    }

    fn get_damage_region(&mut self) -> Result<Vec<DamageRegion>> {
        assert!(!self.damage_array.is_empty());
        assert!(self.last_framebuffer.is_some());

        Ok(collect_damage_rects(
            &self.damage_array,
            self.cols,
            self.rows,
            self.surface_width,
            self.surface_height,
        ))
    }
}
