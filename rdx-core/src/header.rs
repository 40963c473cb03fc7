//! Fixed-size packet header.
//!
//! ## Wire format (15 bytes, little-endian)
//! ```text
//! message_id:     u32  (4)
//! channel:        u8   (1)
//! type:           u8   (1)
//! compression:    u8   (1)
//! chunk_index:    u16  (2)
//! chunk_count:    u16  (2)
//! payload_length: u32  (4)
//! ```

use crate::compression::Compression;
use crate::error::RdxError;
use crate::message::{Channel, MessageType};

/// Encoded size of a [`PacketHeader`] on the wire.
pub const HEADER_SIZE: usize = 15;

/// Header preceding every packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub message_id: u32,
    pub channel: Channel,
    pub message_type: MessageType,
    pub compression: Compression,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub payload_length: u32,
}

impl PacketHeader {
    /// Serialize to bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.message_id.to_le_bytes());
        buf[4] = self.channel as u8;
        buf[5] = self.message_type as u8;
        buf[6] = self.compression as u8;
        buf[7..9].copy_from_slice(&self.chunk_index.to_le_bytes());
        buf[9..11].copy_from_slice(&self.chunk_count.to_le_bytes());
        buf[11..15].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    /// Deserialize from bytes, validating every tag and the chunk indices.
    pub fn decode(data: &[u8]) -> Result<Self, RdxError> {
        if data.len() < HEADER_SIZE {
            return Err(RdxError::InvalidHeader("header too short"));
        }
        let header = Self {
            message_id: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            channel: Channel::try_from(data[4])?,
            message_type: MessageType::try_from(data[5])?,
            compression: Compression::try_from(data[6])?,
            chunk_index: u16::from_le_bytes([data[7], data[8]]),
            chunk_count: u16::from_le_bytes([data[9], data[10]]),
            payload_length: u32::from_le_bytes([data[11], data[12], data[13], data[14]]),
        };
        header.check_chunks()?;
        Ok(header)
    }

    /// A message has at least one chunk and the index lies inside it.
    pub fn check_chunks(&self) -> Result<(), RdxError> {
        if self.chunk_count == 0 {
            return Err(RdxError::InvalidHeader("chunk_count must be non-zero"));
        }
        if self.chunk_index >= self.chunk_count {
            return Err(RdxError::InvalidHeader("chunk_index out of range"));
        }
        Ok(())
    }

    /// Peek at the declared payload length without validating the rest.
    ///
    /// Used by the frame decoder to apply the size guard before anything
    /// else is trusted.
    pub fn peek_payload_length(data: &[u8]) -> Option<u32> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        Some(u32::from_le_bytes([data[11], data[12], data[13], data[14]]))
    }
}

// ── Tests ────────────────────────────────────────────────────────
