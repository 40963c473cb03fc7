//! Wire packets and logical messages.
//!
//! A [`Message`] is what channels carry; a [`Packet`] is what goes on the
//! wire. Messages larger than the chunk size are split into ordered packets
//! sharing one message id.

use std::fmt::Debug;

use bytes::Bytes;

use crate::compression::Compression;
use crate::error::RdxError;
use crate::header::{HEADER_SIZE, PacketHeader};
use crate::message::{Channel, MessageType};

/// Default chunk payload size: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default receive guard for a single packet payload.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

// ── Message ──────────────────────────────────────────────────────

/// A logical message, as handed to or returned from the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: u32,
    pub channel: Channel,
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("message_id", &self.message_id)
            .field("channel", &self.channel)
            .field("message_type", &self.message_type)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ── Packet ───────────────────────────────────────────────────────

/// One framed unit on the wire.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    header: PacketHeader,
    payload: Bytes,
}

impl Packet {
    /// Build a packet, filling in `payload_length` from the payload.
    pub fn new(mut header: PacketHeader, payload: Bytes) -> Result<Self, RdxError> {
        header.check_chunks()?;
        if payload.len() > u32::MAX as usize {
            return Err(RdxError::PayloadTooLarge {
                size: payload.len(),
                max: u32::MAX as usize,
            });
        }
        header.payload_length = payload.len() as u32;
        Ok(Self { header, payload })
    }

    pub fn header(&self) -> &PacketHeader {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub fn message_id(&self) -> u32 {
        self.header.message_id
    }

    pub fn channel(&self) -> Channel {
        self.header.channel
    }

    /// Total bytes this packet occupies on the wire.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// `true` for the last chunk of its message.
    pub fn is_last_chunk(&self) -> bool {
        self.header.chunk_index + 1 == self.header.chunk_count
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse exactly one packet from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RdxError> {
        let header = PacketHeader::decode(bytes)?;
        let expected = HEADER_SIZE + header.payload_length as usize;
        if bytes.len() != expected {
            return Err(RdxError::ProtocolViolation("packet length does not match header"));
        }
        Ok(Self {
            header,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ── Chunking ─────────────────────────────────────────────────────

/// Number of chunks a payload of `len` bytes needs.
///
/// An empty payload still travels as a single empty chunk.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size).max(1)
}

/// Split an (already compressed) payload into ordered packets.
pub fn split_message(
    message_id: u32,
    channel: Channel,
    message_type: MessageType,
    compression: Compression,
    payload: Bytes,
    chunk_size: usize,
) -> Result<Vec<Packet>, RdxError> {
    assert!(chunk_size > 0, "chunk_size must be > 0");
    let count = chunk_count(payload.len(), chunk_size);
    if count > u16::MAX as usize {
        return Err(RdxError::PayloadTooLarge {
            size: payload.len(),
            max: u16::MAX as usize * chunk_size,
        });
    }

    let mut packets = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * chunk_size;
        let end = (start + chunk_size).min(payload.len());
        let header = PacketHeader {
            message_id,
            channel,
            message_type,
            compression,
            chunk_index: index as u16,
            chunk_count: count as u16,
            payload_length: 0,
        };
        packets.push(Packet::new(header, payload.slice(start..end))?);
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(len: usize, chunk: usize) -> Vec<Packet> {
        let payload = Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>());
        split_message(
            9,
            Channel::WindowUpdate,
            MessageType::WindowUpdate,
            Compression::None,
            payload,
            chunk,
        )
        .unwrap()
    }

    #[test]
    fn chunk_index_must_lie_inside_the_message() {
        let header = |chunk_index, chunk_count| PacketHeader {
            message_id: 1,
            channel: Channel::WindowUpdate,
            message_type: MessageType::WindowUpdate,
            compression: Compression::None,
            chunk_index,
            chunk_count,
            payload_length: 0,
        };
        assert!(matches!(
            Packet::new(header(5, 2), Bytes::from_static(b"x")),
            Err(RdxError::InvalidHeader(_))
        ));
        assert!(matches!(
            Packet::new(header(0, 0), Bytes::new()),
            Err(RdxError::InvalidHeader(_))
        ));
        assert!(Packet::new(header(1, 2), Bytes::from_static(b"x")).is_ok());
    }

    #[test]
    fn five_mib_splits_into_eighty_chunks() {
        let len = 5 * 1024 * 1024;
        assert_eq!(chunk_count(len, 64 * 1024), 80);
        let packets = split(len, 64 * 1024);
        assert_eq!(packets.len(), 80);
        assert!(packets.iter().all(|p| p.header().chunk_count == 80));
        assert!(packets[79].is_last_chunk());
    }

    #[test]
    fn exact_multiple_has_no_empty_tail() {
        let packets = split(4096 * 3, 4096);
        assert_eq!(packets.len(), 3);
        assert!(packets.iter().all(|p| p.payload().len() == 4096));

        let packets = split(4096 * 3 + 1, 4096);
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[3].payload().len(), 1);
    }

    #[test]
    fn empty_payload_is_one_chunk() {
        let packets = split(0, 4096);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_last_chunk());
        assert_eq!(packets[0].header().payload_length, 0);
    }

    #[test]
    fn too_many_chunks_is_rejected() {
        let payload = Bytes::from(vec![0u8; 70_000]);
        let err = split_message(
            1,
            Channel::Bulk,
            MessageType::Bulk,
            Compression::None,
            payload,
            1,
        );
        assert!(matches!(err, Err(RdxError::PayloadTooLarge { .. })));
    }

    #[test]
    fn packet_bytes_roundtrip() {
        let p = &split(100, 64)[1];
        let parsed = Packet::from_bytes(&p.to_bytes()).unwrap();
        assert_eq!(&parsed, p);
        assert!(Packet::from_bytes(&p.to_bytes()[..20]).is_err());
    }
}
