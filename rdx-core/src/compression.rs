//! Per-message payload compression.
//!
//! A small fixed set of algorithms is supported. The transport picks one per
//! message with [`choose`]; payloads produced by codecs that already compress
//! (see [`crate::codecs::CodecInfo::precompressed`]) always travel with
//! [`Compression::None`].

use std::io::{Read, Write};

use crate::error::RdxError;
use crate::message::Channel;

/// Payloads shorter than this are never compressed.
pub const MIN_COMPRESS_SIZE: usize = 256;

/// zstd level used for transport compression. Favour speed.
const ZSTD_LEVEL: i32 = 1;
/// brotli quality / window for bulk data, where ratio matters more than latency.
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;
const BROTLI_BUFFER: usize = 4096;

/// Compression algorithm tag carried in the packet header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Compression {
    None = 0x0,
    Zstd = 0x1,
    Brotli = 0x2,
}

impl TryFrom<u8> for Compression {
    type Error = RdxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Compression::None),
            0x1 => Ok(Compression::Zstd),
            0x2 => Ok(Compression::Brotli),
            _ => Err(RdxError::UnknownVariant {
                type_name: "Compression",
                value: value as u64,
            }),
        }
    }
}

/// Pick the algorithm for a message.
pub fn choose(channel: Channel, len: usize, precompressed: bool) -> Compression {
    if precompressed || len < MIN_COMPRESS_SIZE {
        return Compression::None;
    }
    match channel {
        Channel::Bulk => Compression::Brotli,
        _ => Compression::Zstd,
    }
}

/// Compress `data`. Returns the algorithm actually used, which falls back to
/// [`Compression::None`] when compressing does not shrink the payload.
pub fn compress(algo: Compression, data: &[u8]) -> Result<(Compression, Vec<u8>), RdxError> {
    let out = match algo {
        Compression::None => return Ok((Compression::None, data.to_vec())),
        Compression::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
            .map_err(|e| RdxError::Compression(format!("zstd encode failed: {e}")))?,
        Compression::Brotli => {
            let mut out = Vec::new();
            {
                let mut writer =
                    brotli::CompressorWriter::new(&mut out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LGWIN);
                writer
                    .write_all(data)
                    .map_err(|e| RdxError::Compression(format!("brotli encode failed: {e}")))?;
            }
            out
        }
    };
    if out.len() >= data.len() {
        Ok((Compression::None, data.to_vec()))
    } else {
        Ok((algo, out))
    }
}

/// Decompress `data`, refusing to produce more than `limit` bytes.
pub fn decompress(algo: Compression, data: &[u8], limit: usize) -> Result<Vec<u8>, RdxError> {
    let mut out = Vec::new();
    let cap = limit as u64 + 1;
    match algo {
        Compression::None => out.extend_from_slice(data),
        Compression::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(data)
                .map_err(|e| RdxError::Compression(format!("zstd decode failed: {e}")))?;
            decoder
                .take(cap)
                .read_to_end(&mut out)
                .map_err(|e| RdxError::Compression(format!("zstd decode failed: {e}")))?;
        }
        Compression::Brotli => {
            brotli::Decompressor::new(data, BROTLI_BUFFER)
                .take(cap)
                .read_to_end(&mut out)
                .map_err(|e| RdxError::Compression(format!("brotli decode failed: {e}")))?;
        }
    }
    if out.len() > limit {
        return Err(RdxError::PayloadTooLarge {
            size: out.len(),
            max: limit,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precompressed_and_small_payloads_skip_compression() {
        assert_eq!(choose(Channel::WindowUpdate, 1 << 20, true), Compression::None);
        assert_eq!(choose(Channel::Control, 16, false), Compression::None);
        assert_eq!(choose(Channel::WindowUpdate, 4096, false), Compression::Zstd);
        assert_eq!(choose(Channel::Bulk, 4096, false), Compression::Brotli);
    }

    #[test]
    fn zstd_and_brotli_restore_payload() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        for algo in [Compression::Zstd, Compression::Brotli] {
            let (used, packed) = compress(algo, &data).unwrap();
            assert_eq!(used, algo);
            assert!(packed.len() < data.len());
            assert_eq!(decompress(used, &packed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn incompressible_data_is_sent_plain() {
        // Already-compressed bytes do not shrink further.
        let data = zstd::encode_all(&[7u8; 4096][..], 19).unwrap();
        let (used, packed) = compress(Compression::Zstd, &data).unwrap();
        assert_eq!(used, Compression::None);
        assert_eq!(packed, data);
    }

    #[test]
    fn decompression_limit_is_enforced() {
        let data = vec![0u8; 100_000];
        let (used, packed) = compress(Compression::Zstd, &data).unwrap();
        assert!(matches!(
            decompress(used, &packed, 1000),
            Err(RdxError::PayloadTooLarge { .. })
        ));
    }
}
