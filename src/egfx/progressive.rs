//! RemoteFX progressive bitstream encoder
//!
//! Produces the non-progressive ("simple tile") subset of the progressive
//! codec: each encoded region carries fully-coded 64×64 tiles. Tiles go
//! through BGRX→YCbCr conversion, a three-level DWT, per-band
//! quantization, differential coding of the DC band, and RLGR1 entropy
//! coding.
//!
//! Block framing per [MS-RDPEGFX] 2.2.4.2 (blockType 0xCCC0..0xCCC5). The
//! quantization-value byte order differs from [MS-RDPRFX]: bands are
//! written LL3, HL3, LH3, HH3, HL2, LH2, HH2, HL1, LH1, HH1.

use std::collections::HashSet;

use bytes::{BufMut, BytesMut};
use ironrdp_graphics::image_processing::PixelFormat as GraphicsPixelFormat;
use ironrdp_graphics::{color_conversion, dwt, rlgr};
use ironrdp_pdu::codecs::rfx::EntropyAlgorithm;

use crate::damage::DamageRegion;

use super::{GfxError, Result};

const TILE_DIM: usize = 64;
const TILE_PIXELS: usize = TILE_DIM * TILE_DIM;

/// Worst-case RLGR output for one component; RLGR1 can expand slightly on
/// noise-like input
const COMPONENT_SCRATCH_SIZE: usize = 4 * TILE_PIXELS;

const BLOCK_SYNC: u16 = 0xCCC0;
const BLOCK_FRAME_BEGIN: u16 = 0xCCC1;
const BLOCK_FRAME_END: u16 = 0xCCC2;
const BLOCK_CONTEXT: u16 = 0xCCC3;
const BLOCK_REGION: u16 = 0xCCC4;
const BLOCK_TILE_SIMPLE: u16 = 0xCCC5;

const SYNC_MAGIC: u32 = 0xCACC_ACCA;
const SYNC_VERSION: u16 = 0x0100;

/// Default quantization values in [MS-RDPRFX] band order:
/// LL3, LH3, HL3, HH3, LH2, HL2, HH2, LH1, HL1, HH1
const DEFAULT_QUANT: [u8; 10] = [6, 6, 6, 6, 7, 7, 8, 8, 8, 9];

/// Coefficient layout after [`dwt::encode`]: (offset, length, quant index)
const SUBBANDS: [(usize, usize, usize); 10] = [
    (0, 1024, 8),    // HL1
    (1024, 1024, 7), // LH1
    (2048, 1024, 9), // HH1
    (3072, 256, 5),  // HL2
    (3328, 256, 4),  // LH2
    (3584, 256, 6),  // HH2
    (3840, 64, 2),   // HL3
    (3904, 64, 1),   // LH3
    (3968, 64, 3),   // HH3
    (4032, 64, 0),   // LL3
];

struct EncodedTile {
    x_idx: u16,
    y_idx: u16,
    y_data: Vec<u8>,
    cb_data: Vec<u8>,
    cr_data: Vec<u8>,
}

impl EncodedTile {
    fn data_len(&self) -> usize {
        self.y_data.len() + self.cb_data.len() + self.cr_data.len()
    }
}

/// Stateful progressive encoder for one session
///
/// Tracks the frame index written into frame-begin blocks; the codec
/// context (sync + context header) is emitted exactly once per wire codec
/// context, controlled by the caller.
pub struct ProgressiveEncoder {
    frame_index: u32,
    temp: Vec<i16>,
}

impl ProgressiveEncoder {
    /// Create an encoder with a fresh frame index
    pub fn new() -> Self {
        Self {
            frame_index: 0,
            temp: vec![0i16; TILE_PIXELS],
        }
    }

    /// Reset the frame index (surface invalidation)
    pub fn reset(&mut self) {
        self.frame_index = 0;
    }

    /// Encode the damaged region of `frame` into a progressive message
    ///
    /// `needs_header` prepends the sync + context blocks; required exactly
    /// once per codec context.
    pub fn encode_region(
        &mut self,
        frame: &[u8],
        stride: usize,
        surface_width: u16,
        surface_height: u16,
        rects: &[DamageRegion],
        needs_header: bool,
    ) -> Result<Vec<u8>> {
        let tiles = self.encode_tiles(frame, stride, surface_width, surface_height, rects)?;

        let mut out = BytesMut::new();

        if needs_header {
            write_sync_and_context(&mut out);
        }
        self.write_frame(&mut out, rects, &tiles);

        Ok(out.to_vec())
    }

    fn encode_tiles(
        &mut self,
        frame: &[u8],
        stride: usize,
        surface_width: u16,
        surface_height: u16,
        rects: &[DamageRegion],
    ) -> Result<Vec<EncodedTile>> {
        let mut seen = HashSet::new();
        let mut tiles = Vec::new();

        for rect in rects {
            let x_first = rect.x as usize / TILE_DIM;
            let x_last = (rect.x + rect.width - 1) as usize / TILE_DIM;
            let y_first = rect.y as usize / TILE_DIM;
            let y_last = (rect.y + rect.height - 1) as usize / TILE_DIM;

            for y_idx in y_first..=y_last {
                for x_idx in x_first..=x_last {
                    if !seen.insert((x_idx, y_idx)) {
                        continue;
                    }
                    tiles.push(self.encode_tile(
                        frame,
                        stride,
                        surface_width,
                        surface_height,
                        x_idx,
                        y_idx,
                    )?);
                }
            }
        }

        Ok(tiles)
    }

    fn encode_tile(
        &mut self,
        frame: &[u8],
        stride: usize,
        surface_width: u16,
        surface_height: u16,
        x_idx: usize,
        y_idx: usize,
    ) -> Result<EncodedTile> {
        let origin_x = x_idx * TILE_DIM;
        let origin_y = y_idx * TILE_DIM;
        let tile_width = (surface_width as usize - origin_x).min(TILE_DIM);
        let tile_height = (surface_height as usize - origin_y).min(TILE_DIM);

        let mut y = [0i16; TILE_PIXELS];
        let mut cb = [0i16; TILE_PIXELS];
        let mut cr = [0i16; TILE_PIXELS];

        let tile_offset = origin_y * stride + origin_x * 4;
        color_conversion::to_64x64_ycbcr_tile(
            &frame[tile_offset..],
            tile_width as u32,
            tile_height as u32,
            stride as u32,
            GraphicsPixelFormat::BgrX32,
            &mut y,
            &mut cb,
            &mut cr,
        );

        Ok(EncodedTile {
            x_idx: x_idx as u16,
            y_idx: y_idx as u16,
            y_data: self.encode_component(&mut y)?,
            cb_data: self.encode_component(&mut cb)?,
            cr_data: self.encode_component(&mut cr)?,
        })
    }

    fn encode_component(&mut self, buffer: &mut [i16; TILE_PIXELS]) -> Result<Vec<u8>> {
        dwt::encode(buffer, &mut self.temp);

        for (offset, len, quant_idx) in SUBBANDS {
            let factor = DEFAULT_QUANT[quant_idx] - 6;
            if factor > 0 {
                for value in &mut buffer[offset..offset + len] {
                    *value >>= factor;
                }
            }
        }

        // differential coding of the DC (LL3) band
        let (_, ll3) = buffer.split_at_mut(TILE_PIXELS - 64);
        for i in (1..ll3.len()).rev() {
            ll3[i] -= ll3[i - 1];
        }

        let mut scratch = vec![0u8; COMPONENT_SCRATCH_SIZE];
        let written = rlgr::encode(EntropyAlgorithm::Rlgr1, buffer, &mut scratch)
            .map_err(|e| GfxError::Wire(format!("RLGR encode failed: {e}")))?;
        scratch.truncate(written);

        Ok(scratch)
    }

    fn write_frame(&mut self, out: &mut BytesMut, rects: &[DamageRegion], tiles: &[EncodedTile]) {
        // RFX_PROGRESSIVE_FRAME_BEGIN
        out.put_u16_le(BLOCK_FRAME_BEGIN);
        out.put_u32_le(12);
        out.put_u32_le(self.frame_index);
        out.put_u16_le(1); // regionCount
        self.frame_index = self.frame_index.wrapping_add(1);

        // RFX_PROGRESSIVE_REGION
        let tiles_data_size: usize = tiles.iter().map(|t| 22 + t.data_len()).sum();
        let block_len = 18 + rects.len() * 8 + 5 + tiles_data_size;

        out.put_u16_le(BLOCK_REGION);
        out.put_u32_le(block_len as u32);
        out.put_u8(0x40); // tileSize
        out.put_u16_le(rects.len() as u16);
        out.put_u8(1); // numQuant
        out.put_u8(0); // numProgQuant
        out.put_u8(0); // flags
        out.put_u16_le(tiles.len() as u16);
        out.put_u32_le(tiles_data_size as u32);

        for rect in rects {
            out.put_u16_le(rect.x as u16);
            out.put_u16_le(rect.y as u16);
            out.put_u16_le(rect.width as u16);
            out.put_u16_le(rect.height as u16);
        }

        // RFX_COMPONENT_CODEC_QUANT: band order differs from [MS-RDPRFX]
        //             0    1    2    3    4    5    6    7    8    9
        // RDPRFX:   LL3, LH3, HL3, HH3, LH2, HL2, HH2, LH1, HL1, HH1
        // RDPEGFX:  LL3, HL3, LH3, HH3, HL2, LH2, HH2, HL1, LH1, HH1
        let qv = &DEFAULT_QUANT;
        out.put_u8(qv[0] | (qv[2] << 4)); // LL3, HL3
        out.put_u8(qv[1] | (qv[3] << 4)); // LH3, HH3
        out.put_u8(qv[5] | (qv[4] << 4)); // HL2, LH2
        out.put_u8(qv[6] | (qv[8] << 4)); // HH2, HL1
        out.put_u8(qv[7] | (qv[9] << 4)); // LH1, HH1

        for tile in tiles {
            // RFX_PROGRESSIVE_TILE_SIMPLE
            out.put_u16_le(BLOCK_TILE_SIMPLE);
            out.put_u32_le((22 + tile.data_len()) as u32);
            out.put_u8(0); // quantIdxY
            out.put_u8(0); // quantIdxCb
            out.put_u8(0); // quantIdxCr
            out.put_u16_le(tile.x_idx);
            out.put_u16_le(tile.y_idx);
            out.put_u8(0); // flags
            out.put_u16_le(tile.y_data.len() as u16);
            out.put_u16_le(tile.cb_data.len() as u16);
            out.put_u16_le(tile.cr_data.len() as u16);
            out.put_u16_le(0); // tailLen
            out.put_slice(&tile.y_data);
            out.put_slice(&tile.cb_data);
            out.put_slice(&tile.cr_data);
        }

        // RFX_PROGRESSIVE_FRAME_END
        out.put_u16_le(BLOCK_FRAME_END);
        out.put_u32_le(6);
    }
}

impl Default for ProgressiveEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn write_sync_and_context(out: &mut BytesMut) {
    // RFX_PROGRESSIVE_SYNC
    out.put_u16_le(BLOCK_SYNC);
    out.put_u32_le(12);
    out.put_u32_le(SYNC_MAGIC);
    out.put_u16_le(SYNC_VERSION);

    // RFX_PROGRESSIVE_CONTEXT
    out.put_u16_le(BLOCK_CONTEXT);
    out.put_u32_le(10);
    out.put_u8(0); // ctxId
    out.put_u16_le(0x0040); // tileSize
    out.put_u8(0); // flags
}

#[cfg(test)]
mod tests {
    use super::*;

    const WIDTH: u16 = 128;
    const HEIGHT: u16 = 128;
    const STRIDE: usize = WIDTH as usize * 4;

    fn gradient_frame() -> Vec<u8> {
        let mut frame = vec![0u8; STRIDE * HEIGHT as usize];
        for y in 0..HEIGHT as usize {
            for x in 0..WIDTH as usize {
                let idx = y * STRIDE + x * 4;
                frame[idx] = x as u8;
                frame[idx + 1] = y as u8;
                frame[idx + 2] = (x + y) as u8;
            }
        }
        frame
    }

    fn read_block_header(data: &[u8]) -> (u16, u32) {
        let block_type = u16::from_le_bytes([data[0], data[1]]);
        let block_len = u32::from_le_bytes([data[2], data[3], data[4], data[5]]);
        (block_type, block_len)
    }

    #[test]
    fn header_is_emitted_exactly_when_requested() {
        let mut encoder = ProgressiveEncoder::new();
        let frame = gradient_frame();
        let rects = [DamageRegion::new(0, 0, 64, 64)];

        let with_header = encoder
            .encode_region(&frame, STRIDE, WIDTH, HEIGHT, &rects, true)
            .unwrap();
        let (block_type, block_len) = read_block_header(&with_header);
        assert_eq!(block_type, BLOCK_SYNC);
        assert_eq!(block_len, 12);
        // context follows sync
        let (context_type, context_len) = read_block_header(&with_header[12..]);
        assert_eq!(context_type, BLOCK_CONTEXT);
        assert_eq!(context_len, 10);

        let without_header = encoder
            .encode_region(&frame, STRIDE, WIDTH, HEIGHT, &rects, false)
            .unwrap();
        let (first_type, _) = read_block_header(&without_header);
        assert_eq!(first_type, BLOCK_FRAME_BEGIN);
    }

    #[test]
    fn frame_index_increments_per_message() {
        let mut encoder = ProgressiveEncoder::new();
        let frame = gradient_frame();
        let rects = [DamageRegion::new(0, 0, 64, 64)];

        let first = encoder
            .encode_region(&frame, STRIDE, WIDTH, HEIGHT, &rects, false)
            .unwrap();
        let second = encoder
            .encode_region(&frame, STRIDE, WIDTH, HEIGHT, &rects, false)
            .unwrap();

        let index_of = |message: &[u8]| {
            u32::from_le_bytes([message[6], message[7], message[8], message[9]])
        };
        assert_eq!(index_of(&first), 0);
        assert_eq!(index_of(&second), 1);

        encoder.reset();
        let after_reset = encoder
            .encode_region(&frame, STRIDE, WIDTH, HEIGHT, &rects, false)
            .unwrap();
        assert_eq!(index_of(&after_reset), 0);
    }

    #[test]
    fn region_block_counts_tiles_and_rects() {
        let mut encoder = ProgressiveEncoder::new();
        let frame = gradient_frame();
        // two rects covering three distinct tiles (one shared)
        let rects = [
            DamageRegion::new(0, 0, 128, 64),
            DamageRegion::new(64, 0, 64, 128),
        ];

        let message = encoder
            .encode_region(&frame, STRIDE, WIDTH, HEIGHT, &rects, false)
            .unwrap();

        // skip frame begin (12 bytes) to the region block
        let region = &message[12..];
        let (block_type, _) = read_block_header(region);
        assert_eq!(block_type, BLOCK_REGION);
        let num_rects = u16::from_le_bytes([region[7], region[8]]);
        let num_tiles = u16::from_le_bytes([region[12], region[13]]);
        assert_eq!(num_rects, 2);
        assert_eq!(num_tiles, 3);

        // message ends with frame end
        let tail = &message[message.len() - 6..];
        let (end_type, end_len) = read_block_header(tail);
        assert_eq!(end_type, BLOCK_FRAME_END);
        assert_eq!(end_len, 6);
    }

    #[test]
    fn tile_blocks_carry_three_components() {
        let mut encoder = ProgressiveEncoder::new();
        let frame = gradient_frame();
        let rects = [DamageRegion::new(64, 64, 64, 64)];

        let message = encoder
            .encode_region(&frame, STRIDE, WIDTH, HEIGHT, &rects, false)
            .unwrap();

        // frame begin (12) + region header (18) + 1 rect (8) + quant (5)
        let tile = &message[12 + 18 + 8 + 5..];
        let (block_type, block_len) = read_block_header(tile);
        assert_eq!(block_type, BLOCK_TILE_SIMPLE);

        let x_idx = u16::from_le_bytes([tile[9], tile[10]]);
        let y_idx = u16::from_le_bytes([tile[11], tile[12]]);
        assert_eq!((x_idx, y_idx), (1, 1));

        let y_len = u16::from_le_bytes([tile[14], tile[15]]) as u32;
        let cb_len = u16::from_le_bytes([tile[16], tile[17]]) as u32;
        let cr_len = u16::from_le_bytes([tile[18], tile[19]]) as u32;
        assert!(y_len > 0 && cb_len > 0 && cr_len > 0);
        assert_eq!(block_len, 22 + y_len + cb_len + cr_len);
    }
}
