//! Feedback loop glue: turns the viewer's control traffic into estimator
//! and window state updates.
//!
//! | Inbound            | Effect                                        |
//! |--------------------|-----------------------------------------------|
//! | `Ack`              | throughput + RTT sample for the estimator     |
//! | `Ping`             | reply with a `Pong`                           |
//! | `Pong`             | RTT sample for the estimator                  |
//! | `DamageSequence`   | window's acknowledged sequence, backlog drain |
//! | `EncodingOverride` | per-window or session policy override         |

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::bandwidth::BandwidthEstimator;
use crate::policy::PolicyOverride;
use crate::protocol::{Ack, DamageSequence, Inbound, Ping, Pong};
use crate::window::Window;

/// Unanswered pings remembered for RTT matching.
const MAX_PENDING_PINGS: usize = 16;

/// What the session has to do after a message was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackEffect {
    None,
    /// Send this reply to the viewer.
    Reply(Pong),
    /// A ping round trip completed: pending damage should go out now.
    Flush,
    /// A client override changed the effective policy.
    Override {
        window_id: Option<u32>,
        values: PolicyOverride,
    },
}

pub struct FeedbackLoop {
    epoch: Instant,
    next_ping_id: u64,
    pings: VecDeque<(u64, Instant)>,
}

impl FeedbackLoop {
    pub fn new(epoch: Instant) -> Self {
        Self {
            epoch,
            next_ping_id: 1,
            pings: VecDeque::new(),
        }
    }

    /// Microseconds since the session started.
    pub fn timestamp_us(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_micros() as u64
    }

    /// Build a latency probe and remember when it left.
    pub fn make_ping(&mut self, now: Instant) -> Ping {
        let id = self.next_ping_id;
        self.next_ping_id += 1;
        if self.pings.len() >= MAX_PENDING_PINGS {
            self.pings.pop_front();
        }
        self.pings.push_back((id, now));
        Ping {
            id,
            timestamp_us: self.timestamp_us(now),
        }
    }

    /// Apply one inbound message.
    pub fn apply<T>(
        &mut self,
        inbound: Inbound,
        estimator: &mut BandwidthEstimator,
        windows: &mut BTreeMap<u32, Window<T>>,
        now: Instant,
    ) -> FeedbackEffect {
        match inbound {
            Inbound::Ack(ack) => {
                self.on_ack(&ack, estimator, now);
                FeedbackEffect::None
            }
            Inbound::Ping(ping) => FeedbackEffect::Reply(Pong {
                id: ping.id,
                echo_timestamp_us: ping.timestamp_us,
            }),
            Inbound::Pong(pong) => {
                self.on_pong(&pong, estimator, now);
                FeedbackEffect::Flush
            }
            Inbound::DamageSequence(ds) => {
                on_damage_sequence(&ds, windows);
                FeedbackEffect::None
            }
            Inbound::EncodingOverride(ov) => {
                if let Some(id) = ov.window_id {
                    let Some(window) = windows.get_mut(&id) else {
                        warn!(window_id = id, "override for unknown window ignored");
                        return FeedbackEffect::None;
                    };
                    let merged = window.policy_override.get_or_insert_with(PolicyOverride::default);
                    merged.merge(&ov.values);
                }
                debug!(window_id = ?ov.window_id, values = ?ov.values, "client encoding override");
                FeedbackEffect::Override {
                    window_id: ov.window_id,
                    values: ov.values,
                }
            }
            Inbound::WindowUpdate(u) => {
                warn!(window_id = u.window_id, "unexpected window update from viewer");
                FeedbackEffect::None
            }
            Inbound::Bulk(data) => {
                trace!(len = data.len(), "bulk data ignored");
                FeedbackEffect::None
            }
        }
    }

    fn on_ack(&self, ack: &Ack, estimator: &mut BandwidthEstimator, now: Instant) {
        match estimator.sent(ack.message_id) {
            Some((bytes, sent_at)) => estimator.on_ack(ack.message_id, bytes, sent_at, now),
            None => trace!(message_id = ack.message_id, "ack for untracked message"),
        }
    }

    fn on_pong(&mut self, pong: &Pong, estimator: &mut BandwidthEstimator, now: Instant) {
        match self.pings.iter().position(|(id, _)| *id == pong.id) {
            Some(i) => {
                let (_, sent) = self.pings.remove(i).unwrap_or((pong.id, now));
                // Older pings were lost or overtaken.
                self.pings.drain(..i);
                estimator.record_rtt(now.saturating_duration_since(sent));
            }
            None => {
                // Fall back to the echoed timestamp.
                let sent = self.epoch + Duration::from_micros(pong.echo_timestamp_us);
                if sent <= now {
                    estimator.record_rtt(now - sent);
                }
            }
        }
    }
}

fn on_damage_sequence<T>(ds: &DamageSequence, windows: &mut BTreeMap<u32, Window<T>>) {
    match windows.get_mut(&ds.window_id) {
        Some(w) => {
            w.on_damage_ack(ds.damage_seq);
            trace!(
                window_id = ds.window_id,
                damage_seq = ds.damage_seq,
                decode_us = ds.decode_time_us,
                "damage sequence acknowledged"
            );
        }
        None => trace!(window_id = ds.window_id, "damage sequence for closed window"),
    }
}

// ── Tests ────────────────────────────────────────────────────────
