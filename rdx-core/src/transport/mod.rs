//! Packet transport: compression, chunking, multiplexing and reassembly.
//!
//! ```text
//! send(channel, type, payload)            on_bytes(raw) / on_packet(p)
//!   │ compress (per message)                │ RdxCodec::decode (size guard)
//!   │ split into chunks                     │ Reassembler::insert
//!   ▼                                       │ decompress
//! Multiplexer ──poll_packet()──► wire       ▼
//!                                         Message
//! ```
//!
//! [`PacketTransport`] is synchronous and owned by one session task; the
//! async plumbing lives in [`connection`].

pub mod connection;
pub mod mux;
pub mod reassembly;

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, warn};

use crate::codec::RdxCodec;
use crate::compression;
use crate::error::RdxError;
use crate::message::{Channel, MessageType};
use crate::packet::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PACKET_SIZE, Message, Packet, split_message};

pub use connection::{Connection, ConnectionReader, ConnectionWriter};
pub use mux::{DEFAULT_QUANTUM, Drained, Multiplexer};
pub use reassembly::{Assembled, Reassembler};

// ── TransportConfig ──────────────────────────────────────────────

/// Tunables for [`PacketTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest payload carried by a single packet.
    pub chunk_size: usize,
    /// Receive guard: packets declaring a larger payload are fatal.
    pub max_packet_size: usize,
    /// Largest logical message accepted after reassembly / decompression.
    pub max_message_size: usize,
    /// Idle time after which an incomplete message is discarded.
    pub reassembly_timeout: Duration,
    /// Cap on partially received messages.
    pub max_pending_messages: usize,
    /// Per-turn packet budget per channel.
    pub quantum: [usize; Channel::COUNT],
    /// Keep a [`SentMessage`] for every message once its last chunk is
    /// written. The owner must drain them with
    /// [`PacketTransport::take_sent`].
    pub record_sent: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_message_size: 64 * 1024 * 1024,
            reassembly_timeout: Duration::from_secs(10),
            max_pending_messages: 64,
            quantum: DEFAULT_QUANTUM,
            record_sent: true,
        }
    }
}

/// A message that has been fully handed to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: u32,
    pub channel: Channel,
    pub wire_bytes: usize,
    pub sent_at: Instant,
}

// ── PacketTransport ──────────────────────────────────────────────

pub struct PacketTransport {
    config: TransportConfig,
    next_message_id: u32,
    mux: Multiplexer,
    reassembler: Reassembler,
    codec: RdxCodec,
    inbound: BytesMut,
    sent: VecDeque<SentMessage>,
}

impl PacketTransport {
    pub fn new(config: TransportConfig) -> Self {
        assert!(config.chunk_size > 0, "chunk_size must be > 0");
        assert!(
            config.chunk_size <= config.max_packet_size,
            "chunk_size must not exceed max_packet_size"
        );
        Self {
            mux: Multiplexer::new(config.quantum),
            reassembler: Reassembler::new(
                config.reassembly_timeout,
                config.max_pending_messages,
                config.max_message_size,
            ),
            codec: RdxCodec::new(config.max_packet_size),
            inbound: BytesMut::new(),
            sent: VecDeque::new(),
            next_message_id: 1,
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Queue a logical message. Returns its message id.
    ///
    /// `precompressed` marks payloads produced by a compressing codec so the
    /// transport does not compress them a second time.
    pub fn send(
        &mut self,
        channel: Channel,
        message_type: MessageType,
        payload: Bytes,
        precompressed: bool,
    ) -> Result<u32, RdxError> {
        let algo = compression::choose(channel, payload.len(), precompressed);
        let (used, body) = compression::compress(algo, &payload)?;
        let message_id = self.allocate_id();
        let packets = split_message(
            message_id,
            channel,
            message_type,
            used,
            Bytes::from(body),
            self.config.chunk_size,
        )?;
        debug!(
            message_id,
            %channel,
            %message_type,
            raw = payload.len(),
            chunks = packets.len(),
            compression = ?used,
            "queued message"
        );
        self.mux.push_message(channel, packets);
        Ok(message_id)
    }

    /// Next packet to write, in multiplexer order.
    pub fn poll_packet(&mut self, now: Instant) -> Option<Packet> {
        let (packet, drained) = self.mux.pop()?;
        if let (Some(d), true) = (drained, self.config.record_sent) {
            self.sent.push_back(SentMessage {
                message_id: d.message_id,
                channel: d.channel,
                wire_bytes: d.wire_bytes,
                sent_at: now,
            });
        }
        Some(packet)
    }

    /// Encode every queued packet into `dst`. Returns the number of packets.
    pub fn drain_to(&mut self, dst: &mut BytesMut, now: Instant) -> Result<usize, RdxError> {
        let mut n = 0;
        while let Some(packet) = self.poll_packet(now) {
            self.codec.encode(packet, dst)?;
            n += 1;
        }
        Ok(n)
    }

    /// Messages whose last chunk went out since the previous call.
    pub fn take_sent(&mut self) -> Vec<SentMessage> {
        self.sent.drain(..).collect()
    }

    pub fn has_outgoing(&self) -> bool {
        !self.mux.is_empty()
    }

    pub fn queued(&self, channel: Channel) -> usize {
        self.mux.queued(channel)
    }

    /// Consume raw inbound bytes and return every message they complete.
    ///
    /// Fatal framing errors (oversized or malformed packets) are returned;
    /// per-message problems are logged and the message dropped.
    pub fn on_bytes(&mut self, raw: &[u8], now: Instant) -> Result<Vec<Message>, RdxError> {
        self.inbound.extend_from_slice(raw);
        let mut out = Vec::new();
        while let Some(packet) = self.codec.decode(&mut self.inbound)? {
            if let Some(message) = self.on_packet(packet, now)? {
                out.push(message);
            }
        }
        Ok(out)
    }

    /// Feed one already-framed packet.
    pub fn on_packet(&mut self, packet: Packet, now: Instant) -> Result<Option<Message>, RdxError> {
        if packet.payload().len() > self.config.max_packet_size {
            return Err(RdxError::OversizedPacket {
                size: packet.payload().len(),
                max: self.config.max_packet_size,
            });
        }
        let assembled = match self.reassembler.insert(packet, now) {
            Ok(Some(a)) => a,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("dropping inbound message: {e}");
                return Ok(None);
            }
        };
        match compression::decompress(
            assembled.compression,
            &assembled.payload,
            self.config.max_message_size,
        ) {
            Ok(payload) => Ok(Some(Message {
                message_id: assembled.message_id,
                channel: assembled.channel,
                message_type: assembled.message_type,
                payload: Bytes::from(payload),
            })),
            Err(e) => {
                warn!(message_id = assembled.message_id, "dropping inbound message: {e}");
                Ok(None)
            }
        }
    }

    /// Reclaim stale reassembly state. Returns the discarded messages.
    pub fn expire(&mut self, now: Instant) -> Vec<RdxError> {
        let expired = self.reassembler.expire(now);
        for e in &expired {
            warn!("{e}");
        }
        expired
    }

    pub fn pending_reassembly(&self) -> usize {
        self.reassembler.pending()
    }

    /// Discard all queued and buffered state.
    pub fn clear(&mut self) {
        self.mux.clear();
        self.reassembler.clear();
        self.inbound.clear();
        self.sent.clear();
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1).max(1);
        id
    }
}

impl Default for PacketTransport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
