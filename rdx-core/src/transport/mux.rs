//! Per-channel send queues drained round-robin.
//!
//! Each scheduling turn visits the channels in [`Channel::SCHEDULE`] order and
//! takes at most `quantum[channel]` packets from each. Chunks of one message
//! stay in order inside their channel, but a large window update is
//! interleaved with control and ack packets instead of blocking them.

use std::collections::{HashMap, VecDeque};

use crate::message::Channel;
use crate::packet::Packet;

/// Default per-turn packet budget, indexed by [`Channel::index`].
pub const DEFAULT_QUANTUM: [usize; Channel::COUNT] = [16, 16, 4, 1];

/// A message whose final chunk has left the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
    pub message_id: u32,
    pub channel: Channel,
    /// Wire bytes of the whole message, headers included.
    pub wire_bytes: usize,
}

pub struct Multiplexer {
    queues: [VecDeque<Packet>; Channel::COUNT],
    quantum: [usize; Channel::COUNT],
    /// Position in `Channel::SCHEDULE`.
    cursor: usize,
    taken_this_turn: usize,
    /// Wire bytes accumulated per message still being drained.
    in_progress: HashMap<u32, usize>,
}

impl Multiplexer {
    pub fn new(quantum: [usize; Channel::COUNT]) -> Self {
        Self {
            queues: Default::default(),
            quantum: quantum.map(|q| q.max(1)),
            cursor: 0,
            taken_this_turn: 0,
            in_progress: HashMap::new(),
        }
    }

    /// Queue every packet of one message.
    pub fn push_message(&mut self, channel: Channel, packets: Vec<Packet>) {
        self.queues[channel.index()].extend(packets);
    }

    /// Next packet according to the round-robin schedule.
    ///
    /// The second value is set when the packet completes its message.
    pub fn pop(&mut self) -> Option<(Packet, Option<Drained>)> {
        if self.is_empty() {
            return None;
        }
        // At most one full lap plus the partially used current slot.
        for _ in 0..=Channel::COUNT {
            let channel = Channel::SCHEDULE[self.cursor];
            let idx = channel.index();
            if self.taken_this_turn < self.quantum[idx] {
                if let Some(packet) = self.queues[idx].pop_front() {
                    self.taken_this_turn += 1;
                    let drained = self.account(&packet);
                    return Some((packet, drained));
                }
            }
            self.cursor = (self.cursor + 1) % Channel::COUNT;
            self.taken_this_turn = 0;
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(VecDeque::is_empty)
    }

    /// Packets waiting on `channel`.
    pub fn queued(&self, channel: Channel) -> usize {
        self.queues[channel.index()].len()
    }

    /// Drop everything; used when the connection goes away.
    pub fn clear(&mut self) {
        for q in &mut self.queues {
            q.clear();
        }
        self.in_progress.clear();
        self.cursor = 0;
        self.taken_this_turn = 0;
    }

    fn account(&mut self, packet: &Packet) -> Option<Drained> {
        let id = packet.message_id();
        let total = self.in_progress.entry(id).or_insert(0);
        *total += packet.wire_len();
        if packet.is_last_chunk() {
            let wire_bytes = self.in_progress.remove(&id).unwrap_or_default();
            Some(Drained {
                message_id: id,
                channel: packet.channel(),
                wire_bytes,
            })
        } else {
            None
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_QUANTUM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::message::MessageType;
    use crate::packet::split_message;
    use bytes::Bytes;

    fn message(id: u32, channel: Channel, ty: MessageType, len: usize, chunk: usize) -> Vec<Packet> {
        split_message(id, channel, ty, Compression::None, Bytes::from(vec![1u8; len]), chunk).unwrap()
    }

    #[test]
    fn control_is_not_starved_by_large_update() {
        let mut mux = Multiplexer::new([16, 16, 4, 1]);
        // 100 chunks of window update queued first.
        mux.push_message(
            Channel::WindowUpdate,
            message(1, Channel::WindowUpdate, MessageType::WindowUpdate, 100 * 10, 10),
        );
        // Drain a few update packets, then a ping arrives.
        for _ in 0..3 {
            mux.pop().unwrap();
        }
        mux.push_message(Channel::Control, message(2, Channel::Control, MessageType::Ping, 8, 10));

        // The ping must go out within the current window-update quantum.
        let mut position = None;
        for i in 0..10 {
            let (p, _) = mux.pop().unwrap();
            if p.channel() == Channel::Control {
                position = Some(i);
                break;
            }
        }
        assert!(position.unwrap() <= 4, "ping waited too long: {position:?}");
    }

    #[test]
    fn chunks_keep_order_within_a_channel() {
        let mut mux = Multiplexer::default();
        mux.push_message(
            Channel::WindowUpdate,
            message(1, Channel::WindowUpdate, MessageType::WindowUpdate, 50, 10),
        );
        mux.push_message(Channel::Bulk, message(2, Channel::Bulk, MessageType::Bulk, 50, 10));
        mux.push_message(
            Channel::WindowUpdate,
            message(3, Channel::WindowUpdate, MessageType::WindowUpdate, 30, 10),
        );

        let mut updates = Vec::new();
        while let Some((p, _)) = mux.pop() {
            if p.channel() == Channel::WindowUpdate {
                updates.push((p.message_id(), p.header().chunk_index));
            }
        }
        let mut sorted = updates.clone();
        sorted.sort();
        assert_eq!(updates, sorted);
        assert_eq!(updates.len(), 8);
    }

    #[test]
    fn bulk_still_progresses() {
        let mut mux = Multiplexer::new([16, 16, 4, 1]);
        mux.push_message(
            Channel::WindowUpdate,
            message(1, Channel::WindowUpdate, MessageType::WindowUpdate, 1000, 10),
        );
        mux.push_message(Channel::Bulk, message(2, Channel::Bulk, MessageType::Bulk, 10, 10));
        let first_bulk = (0..20)
            .position(|_| mux.pop().unwrap().0.channel() == Channel::Bulk)
            .unwrap();
        assert!(first_bulk <= 4);
    }

    #[test]
    fn drained_reports_whole_message_bytes() {
        let mut mux = Multiplexer::default();
        mux.push_message(
            Channel::WindowUpdate,
            message(7, Channel::WindowUpdate, MessageType::WindowUpdate, 25, 10),
        );
        let mut done = None;
        while let Some((_, d)) = mux.pop() {
            if d.is_some() {
                done = d;
            }
        }
        let done = done.unwrap();
        assert_eq!(done.message_id, 7);
        assert_eq!(done.wire_bytes, 25 + 3 * crate::header::HEADER_SIZE);
    }
}
