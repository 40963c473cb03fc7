//! `zrgb`: lossless zstd over packed pixels.
//!
//! Speed maps onto the zstd level: speed 100 uses level 1, speed 1 uses
//! [`MAX_LEVEL`]. Quality is ignored since the encoding is lossless.

use crate::codecs::{CodecFactory, CodecInfo, CodecInstance};
use crate::error::RdxError;
use crate::types::{ColorspaceSet, Snapshot};

pub const NAME: &str = "zrgb";

/// Slowest level used; higher levels cost far more CPU for little gain on
/// screen content.
pub const MAX_LEVEL: i32 = 9;

pub struct ZrgbCodec {
    info: CodecInfo,
}

impl ZrgbCodec {
    pub fn new() -> Self {
        Self {
            info: CodecInfo {
                name: NAME.to_string(),
                colorspaces: ColorspaceSet::all(),
                min_width: 1,
                min_height: 1,
                max_width: 16384,
                max_height: 16384,
                stateful: false,
                cost: 3,
                lossless: true,
                video: false,
                block_size: 1,
                precompressed: true,
            },
        }
    }
}

impl Default for ZrgbCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecFactory for ZrgbCodec {
    fn info(&self) -> &CodecInfo {
        &self.info
    }

    fn create(&self, width: u32, height: u32) -> Result<Box<dyn CodecInstance>, RdxError> {
        Ok(Box::new(ZrgbEncoder { width, height }))
    }
}

/// zstd level for a speed in `1..=100`.
pub fn level_for_speed(speed: u8) -> i32 {
    let speed = speed.clamp(1, 100) as i32;
    // 100 -> 1, 1 -> MAX_LEVEL, linear in between.
    MAX_LEVEL - (speed - 1) * (MAX_LEVEL - 1) / 99
}

/// Viewer side: packed pixels back out of a `zrgb` rect.
pub fn decode(data: &[u8]) -> Result<Vec<u8>, RdxError> {
    zstd::decode_all(data).map_err(|e| RdxError::Compression(format!("zrgb decode failed: {e}")))
}

struct ZrgbEncoder {
    width: u32,
    height: u32,
}

impl CodecInstance for ZrgbEncoder {
    fn encode(&mut self, snapshot: &Snapshot, _quality: u8, speed: u8) -> Result<Vec<u8>, RdxError> {
        if !snapshot.is_well_formed() {
            return Err(RdxError::encode_failure(NAME, "malformed pixel buffer"));
        }
        let packed = snapshot.to_packed();
        zstd::encode_all(packed.as_slice(), level_for_speed(speed))
            .map_err(|e| RdxError::encode_failure(NAME, format!("zstd encode failed: {e}")))
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

    #[test]
    fn speed_to_level() {
        assert_eq!(level_for_speed(100), 1);
        assert_eq!(level_for_speed(1), MAX_LEVEL);
        assert_eq!(level_for_speed(0), MAX_LEVEL);
        let mid = level_for_speed(50);
        assert!(mid > 1 && mid < MAX_LEVEL);
    }

    #[test]
    fn output_decodes_to_packed_pixels() {
        let pixels: Vec<u8> = (0..64 * 64 * 4).map(|i| (i / 7) as u8).collect();
        let snap = Snapshot::packed(Rect::new(0, 0, 64, 64), Colorspace::Bgra, Bytes::from(pixels.clone()));
        let mut enc = ZrgbCodec::new().create(64, 64).unwrap();
        let out = enc.encode(&snap, 90, 80).unwrap();
        assert!(out.len() < pixels.len());
        assert_eq!(decode(&out).unwrap(), pixels);
    }
}
