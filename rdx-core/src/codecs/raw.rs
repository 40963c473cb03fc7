//! `raw`: tightly packed pixels, no compression.
//!
//! Always available, accepts any colourspace and any size. This is the
//! encoding of last resort for every job.

use crate::codecs::{CodecFactory, CodecInfo, CodecInstance, FALLBACK_ENCODING};
use crate::error::RdxError;
use crate::types::{ColorspaceSet, Snapshot};

pub struct RawCodec {
    info: CodecInfo,
}

impl RawCodec {
    pub fn new() -> Self {
        Self {
            info: CodecInfo {
                name: FALLBACK_ENCODING.to_string(),
                colorspaces: ColorspaceSet::all(),
                min_width: 1,
                min_height: 1,
                max_width: u32::MAX,
                max_height: u32::MAX,
                stateful: false,
                cost: 1,
                lossless: true,
                video: false,
                block_size: 1,
                precompressed: false,
            },
        }
    }
}

impl Default for RawCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecFactory for RawCodec {
    fn info(&self) -> &CodecInfo {
        &self.info
    }

    fn create(&self, width: u32, height: u32) -> Result<Box<dyn CodecInstance>, RdxError> {
        Ok(Box::new(RawEncoder { width, height }))
    }
}

struct RawEncoder {
    width: u32,
    height: u32,
}

impl CodecInstance for RawEncoder {
    fn encode(&mut self, snapshot: &Snapshot, _quality: u8, _speed: u8) -> Result<Vec<u8>, RdxError> {
        if !snapshot.is_well_formed() {
            return Err(RdxError::encode_failure(
                FALLBACK_ENCODING,
                format!(
                    "buffer of {} bytes too small for {}x{} stride {}",
                    snapshot.pixels.len(),
                    snapshot.width(),
                    snapshot.height(),
                    snapshot.stride
                ),
            ));
        }
        Ok(snapshot.to_packed())
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Colorspace, Rect};
    use bytes::Bytes;
    use std::time::Instant;

    #[test]
    fn strips_row_padding() {
        // 2x2 BGRX, stride 12 (4 bytes of padding per row).
        let mut pixels = vec![0xEEu8; 24];
        pixels[..8].copy_from_slice(&[1, 1, 1, 1, 2, 2, 2, 2]);
        pixels[12..20].copy_from_slice(&[3, 3, 3, 3, 4, 4, 4, 4]);
        let snap = Snapshot {
            rect: Rect::new(0, 0, 2, 2),
            stride: 12,
            colorspace: Colorspace::Bgrx,
            pixels: Bytes::from(pixels),
            captured_at: Instant::now(),
        };
        let mut enc = RawCodec::new().create(2, 2).unwrap();
        let out = enc.encode(&snap, 100, 50).unwrap();
        assert_eq!(out, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4]);
    }

    #[test]
    fn short_buffer_is_an_encode_failure() {
        let snap = Snapshot::packed(Rect::new(0, 0, 4, 4), Colorspace::Rgba, Bytes::from(vec![0u8; 10]));
        let mut enc = RawCodec::new().create(4, 4).unwrap();
        assert!(matches!(
            enc.encode(&snap, 100, 50),
            Err(RdxError::EncodeFailure { .. })
        ));
    }
}
