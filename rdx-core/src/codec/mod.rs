//! `tokio_util` framing for [`Packet`]s.
//!
//! The declared payload length is checked against `max_packet_size` before
//! any payload byte is buffered, so a hostile peer cannot make the receiver
//! allocate arbitrary amounts of memory.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RdxError;
use crate::header::{HEADER_SIZE, PacketHeader};
use crate::packet::{DEFAULT_MAX_PACKET_SIZE, Packet};

#[derive(Debug, Clone)]
pub struct RdxCodec {
    max_packet_size: usize,
}

impl RdxCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Default for RdxCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for RdxCodec {
    type Item = Packet;
    type Error = RdxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(declared) = PacketHeader::peek_payload_length(&src[..]) else {
            return Ok(None);
        };
        let declared = declared as usize;
        if declared > self.max_packet_size {
            return Err(RdxError::OversizedPacket {
                size: declared,
                max: self.max_packet_size,
            });
        }

        let header = PacketHeader::decode(&src[..HEADER_SIZE])?;
        if src.len() < HEADER_SIZE + declared {
            src.reserve(HEADER_SIZE + declared - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(declared).freeze();
        Packet::new(header, payload).map(Some)
    }
}

impl Encoder<Packet> for RdxCodec {
    type Error = RdxError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.wire_len());
        dst.put_slice(&item.header().encode());
        dst.put_slice(item.payload());
        Ok(())
    }
}
