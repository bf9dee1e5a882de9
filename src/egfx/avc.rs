//! AVC420 surface-command composition
//!
//! Wraps a hardware-produced AVC420 bitstream into the wire form of a
//! surface command: the clipping rectangle is the bounding box of the
//! damage region, and every damage rectangle carries a quantization
//! descriptor (qp 22, quality 100, progressive after the first frame).

use ironrdp_core::{Encode, WriteCursor};
use ironrdp_egfx::pdu::{Avc420BitmapStream, Codec1Type, PixelFormat, QuantQuality, WireToSurface1Pdu};
use ironrdp_pdu::geometry::InclusiveRectangle;

use crate::damage::{region_extents, DamageRegion};

use super::{GfxError, Result};

/// Fixed quantization parameter for desktop streaming
const AVC420_QP: u8 = 22;

fn to_inclusive_rectangle(rect: &DamageRegion) -> InclusiveRectangle {
    InclusiveRectangle {
        left: rect.x as u16,
        top: rect.y as u16,
        right: (rect.x + rect.width - 1) as u16,
        bottom: (rect.y + rect.height - 1) as u16,
    }
}

/// Compose a WireToSurface1 command carrying an AVC420 bitmap stream
///
/// `has_first_frame` marks all regions progressive (p = 1); the first
/// frame of a session is always sent with p = 0.
pub fn compose_avc420_command(
    surface_id: u16,
    rects: &[DamageRegion],
    has_first_frame: bool,
    avc_data: &[u8],
) -> Result<WireToSurface1Pdu> {
    let extents = region_extents(rects)
        .ok_or_else(|| GfxError::GraphicsSubsystemFailure("Empty damage region".into()))?;

    let rectangles: Vec<InclusiveRectangle> = rects.iter().map(to_inclusive_rectangle).collect();
    let quant_qual_vals = rects
        .iter()
        .map(|_| QuantQuality {
            quantization_parameter: AVC420_QP,
            progressive: has_first_frame,
            quality: 100,
        })
        .collect();

    let stream = Avc420BitmapStream {
        rectangles,
        quant_qual_vals,
        data: avc_data,
    };

    let mut bitmap_data = vec![0u8; stream.size()];
    let mut cursor = WriteCursor::new(&mut bitmap_data);
    stream
        .encode(&mut cursor)
        .map_err(|e| GfxError::Wire(format!("AVC420 stream encode failed: {e}")))?;

    Ok(WireToSurface1Pdu {
        surface_id,
        codec_id: Codec1Type::Avc420,
        pixel_format: PixelFormat::XRgb,
        destination_rectangle: InclusiveRectangle {
            left: 0,
            top: 0,
            right: (extents.x + extents.width - 1) as u16,
            bottom: (extents.y + extents.height - 1) as u16,
        },
        bitmap_data,
    })
}

/// Wire size estimate used for the bandwidth-measure decision
pub fn avc420_payload_size(n_rects: usize, avc_data_len: usize) -> usize {
    4 + n_rects * 10 + avc_data_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_clips_to_damage_extents() {
        let rects = [
            DamageRegion::new(64, 0, 64, 64),
            DamageRegion::new(0, 64, 64, 64),
        ];
        let pdu = compose_avc420_command(3, &rects, false, &[0u8; 16]).unwrap();

        assert_eq!(pdu.surface_id, 3);
        assert_eq!(pdu.codec_id, Codec1Type::Avc420);
        assert_eq!(pdu.destination_rectangle.right, 127);
        assert_eq!(pdu.destination_rectangle.bottom, 127);
        assert_eq!(pdu.destination_rectangle.left, 0);
        assert_eq!(pdu.destination_rectangle.top, 0);
    }

    #[test]
    fn quant_descriptors_follow_first_frame_rule() {
        let rects = [DamageRegion::new(0, 0, 64, 64)];
        let data = [0u8; 8];

        let first = compose_avc420_command(0, &rects, false, &data).unwrap();
        let later = compose_avc420_command(0, &rects, true, &data).unwrap();

        // QuantQuality byte layout: bits 0..6 qp, bit 7 progressive
        // bitmap stream: u32 rect count, one 8-byte rect, then quant pairs
        let quant_byte = |pdu: &WireToSurface1Pdu| pdu.bitmap_data[4 + 8];
        assert_eq!(quant_byte(&first) & 0x3f, AVC420_QP);
        assert_eq!(quant_byte(&first) & 0x80, 0);
        assert_eq!(quant_byte(&later) & 0x80, 0x80);
    }

    #[test]
    fn empty_region_is_rejected() {
        assert!(compose_avc420_command(0, &[], false, &[]).is_err());
    }
}
