//! Receiver-side chunk reassembly.
//!
//! Chunks are buffered per message id until `chunk_count` distinct chunks
//! have arrived. Incomplete sets are discarded after an idle timeout and the
//! number of partially received messages is capped, so a stalled or hostile
//! peer cannot grow this buffer without bound.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use crate::compression::Compression;
use crate::error::RdxError;
use crate::message::{Channel, MessageType};
use crate::packet::Packet;

/// A fully reassembled, still compressed, message.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub message_id: u32,
    pub channel: Channel,
    pub message_type: MessageType,
    pub compression: Compression,
    pub payload: Bytes,
}

struct Partial {
    channel: Channel,
    message_type: MessageType,
    compression: Compression,
    chunks: Vec<Option<Bytes>>,
    received: u16,
    bytes: usize,
    last_seen: Instant,
}

impl Partial {
    fn matches(&self, packet: &Packet) -> bool {
        let h = packet.header();
        h.channel == self.channel
            && h.message_type == self.message_type
            && h.compression == self.compression
            && h.chunk_count as usize == self.chunks.len()
    }
}

pub struct Reassembler {
    pending: HashMap<u32, Partial>,
    timeout: Duration,
    max_pending: usize,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(timeout: Duration, max_pending: usize, max_message_size: usize) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            max_pending: max_pending.max(1),
            max_message_size,
        }
    }

    /// Feed one packet. Returns the message once its last missing chunk arrives.
    pub fn insert(&mut self, packet: Packet, now: Instant) -> Result<Option<Assembled>, RdxError> {
        let h = *packet.header();

        if h.chunk_count == 1 {
            if packet.payload().len() > self.max_message_size {
                return Err(RdxError::PayloadTooLarge {
                    size: packet.payload().len(),
                    max: self.max_message_size,
                });
            }
            return Ok(Some(Assembled {
                message_id: h.message_id,
                channel: h.channel,
                message_type: h.message_type,
                compression: h.compression,
                payload: packet.into_payload(),
            }));
        }

        if let Some(existing) = self.pending.get(&h.message_id) {
            if !existing.matches(&packet) {
                self.pending.remove(&h.message_id);
                return Err(RdxError::ProtocolViolation("chunk header disagrees with its message"));
            }
        } else {
            self.make_room();
            self.pending.insert(
                h.message_id,
                Partial {
                    channel: h.channel,
                    message_type: h.message_type,
                    compression: h.compression,
                    chunks: vec![None; h.chunk_count as usize],
                    received: 0,
                    bytes: 0,
                    last_seen: now,
                },
            );
        }

        let Some(partial) = self.pending.get_mut(&h.message_id) else {
            return Ok(None);
        };
        partial.last_seen = now;
        let slot = &mut partial.chunks[h.chunk_index as usize];
        if slot.is_some() {
            trace!(message_id = h.message_id, chunk = h.chunk_index, "duplicate chunk ignored");
            return Ok(None);
        }
        partial.bytes += packet.payload().len();
        *slot = Some(packet.into_payload());
        partial.received += 1;

        if partial.bytes > self.max_message_size {
            let size = partial.bytes;
            self.pending.remove(&h.message_id);
            return Err(RdxError::PayloadTooLarge {
                size,
                max: self.max_message_size,
            });
        }

        if partial.received as usize != partial.chunks.len() {
            return Ok(None);
        }

        let Some(done) = self.pending.remove(&h.message_id) else {
            return Ok(None);
        };
        let mut payload = BytesMut::with_capacity(done.bytes);
        for chunk in done.chunks.into_iter().flatten() {
            payload.extend_from_slice(&chunk);
        }
        Ok(Some(Assembled {
            message_id: h.message_id,
            channel: done.channel,
            message_type: done.message_type,
            compression: done.compression,
            payload: payload.freeze(),
        }))
    }

    /// Discard incomplete messages idle for longer than the timeout.
    pub fn expire(&mut self, now: Instant) -> Vec<RdxError> {
        let timeout = self.timeout;
        let mut expired = Vec::new();
        self.pending.retain(|&message_id, p| {
            if now.saturating_duration_since(p.last_seen) > timeout {
                expired.push(RdxError::ChunkReassemblyTimeout {
                    message_id,
                    received: p.received,
                    expected: p.chunks.len() as u16,
                });
                false
            } else {
                true
            }
        });
        expired
    }

    /// Number of messages with at least one chunk buffered.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Bytes currently buffered across all partial messages.
    pub fn buffered_bytes(&self) -> usize {
        self.pending.values().map(|p| p.bytes).sum()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn make_room(&mut self) {
        while self.pending.len() >= self.max_pending {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, p)| p.last_seen)
                .map(|(&id, _)| id);
            let Some(id) = oldest else { break };
            warn!(message_id = id, "reassembly buffer full; dropping oldest partial message");
            self.pending.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::split_message;

    fn chunks(id: u32, len: usize, chunk: usize) -> (Vec<u8>, Vec<Packet>) {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 256) as u8).collect();
        let packets = split_message(
            id,
            Channel::WindowUpdate,
            MessageType::WindowUpdate,
            Compression::None,
            Bytes::from(data.clone()),
            chunk,
        )
        .unwrap();
        (data, packets)
    }

    fn reassembler() -> Reassembler {
        Reassembler::new(Duration::from_secs(5), 64, 64 * 1024 * 1024)
    }

    #[test]
    fn five_mib_reassembles_only_after_last_chunk() {
        let mut r = reassembler();
        let now = Instant::now();
        let (data, packets) = chunks(1, 5 * 1024 * 1024, 64 * 1024);
        assert_eq!(packets.len(), 80);

        let total = packets.len();
        for (i, p) in packets.into_iter().enumerate() {
            let out = r.insert(p, now).unwrap();
            if i + 1 < total {
                assert!(out.is_none(), "yielded early at chunk {i}");
            } else {
                assert_eq!(out.unwrap().payload.as_ref(), data.as_slice());
            }
        }
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn out_of_order_chunks_reassemble() {
        let mut r = reassembler();
        let now = Instant::now();
        for len in [1usize, 4095, 4096, 4097, 3 * 4096] {
            let (data, mut packets) = chunks(len as u32, len, 4096);
            packets.reverse();
            let mut result = None;
            for p in packets {
                if let Some(m) = r.insert(p, now).unwrap() {
                    result = Some(m);
                }
            }
            assert_eq!(result.unwrap().payload.as_ref(), data.as_slice(), "len {len}");
        }
    }

    #[test]
    fn incomplete_message_expires_without_affecting_next() {
        let mut r = reassembler();
        let t0 = Instant::now();
        let (_, packets) = chunks(1, 10_000, 4096);
        r.insert(packets[0].clone(), t0).unwrap();
        assert_eq!(r.pending(), 1);

        let expired = r.expire(t0 + Duration::from_secs(6));
        assert_eq!(expired.len(), 1);
        assert!(matches!(
            expired[0],
            RdxError::ChunkReassemblyTimeout { message_id: 1, received: 1, expected: 3 }
        ));
        assert_eq!(r.pending(), 0);

        let (data, packets) = chunks(2, 10_000, 4096);
        let mut out = None;
        for p in packets {
            out = r.insert(p, t0 + Duration::from_secs(7)).unwrap().or(out);
        }
        assert_eq!(out.unwrap().payload.as_ref(), data.as_slice());
    }

    #[test]
    fn pending_messages_are_capped() {
        let mut r = Reassembler::new(Duration::from_secs(5), 2, 1 << 20);
        let now = Instant::now();
        for id in 0..5 {
            let (_, packets) = chunks(id, 100, 10);
            r.insert(packets[0].clone(), now + Duration::from_millis(id as u64)).unwrap();
        }
        assert_eq!(r.pending(), 2);
    }

    #[test]
    fn duplicate_chunk_is_ignored() {
        let mut r = reassembler();
        let now = Instant::now();
        let (data, packets) = chunks(3, 30, 10);
        assert!(r.insert(packets[0].clone(), now).unwrap().is_none());
        assert!(r.insert(packets[0].clone(), now).unwrap().is_none());
        assert!(r.insert(packets[1].clone(), now).unwrap().is_none());
        let m = r.insert(packets[2].clone(), now).unwrap().unwrap();
        assert_eq!(m.payload.as_ref(), data.as_slice());
    }

    #[test]
    fn oversized_message_is_dropped() {
        let mut r = Reassembler::new(Duration::from_secs(5), 8, 15);
        let now = Instant::now();
        let (_, packets) = chunks(4, 30, 10);
        r.insert(packets[0].clone(), now).unwrap();
        assert!(matches!(
            r.insert(packets[1].clone(), now),
            Err(RdxError::PayloadTooLarge { .. })
        ));
        assert_eq!(r.pending(), 0);
    }
}
