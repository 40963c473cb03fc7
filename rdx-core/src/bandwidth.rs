//! Bandwidth and latency estimator fed by the client's ack stream.
//!
//! Every acknowledged window update yields a [`BandwidthSample`]. Throughput
//! is measured over the most recent samples and scaled down by how far the
//! smoothed RTT has drifted above the best RTT seen (queueing delay means the
//! link is already saturated). The published estimate may only fall by
//! `max_decay` per update, and never rises while latency is rising.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::trace;

/// Upper bound on tracked unacknowledged messages.
const MAX_TRACKED_SENDS: usize = 4096;

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorConfig {
    /// Sliding window size N.
    pub max_samples: usize,
    /// Congested when smoothed RTT exceeds this multiple of the baseline.
    pub congestion_rtt_factor: f64,
    /// Congested when more messages than this are unacknowledged.
    pub max_outstanding: usize,
    /// Largest fraction the estimate may drop by in one update.
    pub max_decay: f64,
    /// Hard ceiling in bytes/second.
    pub ceiling: Option<u64>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            max_samples: 64,
            congestion_rtt_factor: 2.0,
            max_outstanding: 32,
            max_decay: 0.25,
            ceiling: None,
        }
    }
}

// ── Samples & state ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    pub bytes: u64,
    pub rtt: Duration,
    pub at: Instant,
}

/// What the controller sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BandwidthState {
    /// Bytes/second; `None` until the first throughput measurement.
    pub bandwidth: Option<u64>,
    /// Smoothed RTT.
    pub rtt: Option<Duration>,
    /// Minimum RTT observed.
    pub baseline_rtt: Option<Duration>,
    pub congestion: bool,
    /// Unacknowledged messages.
    pub outstanding: usize,
}

// ── BandwidthEstimator ───────────────────────────────────────────

pub struct BandwidthEstimator {
    config: EstimatorConfig,
    samples: VecDeque<BandwidthSample>,
    /// `(message_id, bytes, sent_at)` in send order.
    outstanding: VecDeque<(u32, u64, Instant)>,
    srtt_us: Option<f64>,
    baseline: Option<Duration>,
    estimate: Option<u64>,
}

impl BandwidthEstimator {
    pub fn new(config: EstimatorConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.max_samples.max(2)),
            config,
            outstanding: VecDeque::new(),
            srtt_us: None,
            baseline: None,
            estimate: None,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Replace the hard ceiling (from the policy's bandwidth limit).
    pub fn set_ceiling(&mut self, ceiling: Option<u64>) {
        self.config.ceiling = ceiling;
        if let (Some(cap), Some(est)) = (ceiling, self.estimate) {
            self.estimate = Some(est.min(cap));
        }
    }

    /// A message that the peer will acknowledge has been written.
    pub fn on_send(&mut self, message_id: u32, bytes: u64, now: Instant) {
        if self.outstanding.len() >= MAX_TRACKED_SENDS {
            self.outstanding.pop_front();
        }
        self.outstanding.push_back((message_id, bytes, now));
    }

    /// `(bytes, sent_at)` recorded for an unacknowledged message.
    pub fn sent(&self, message_id: u32) -> Option<(u64, Instant)> {
        self.outstanding
            .iter()
            .find(|(id, _, _)| *id == message_id)
            .map(|(_, bytes, at)| (*bytes, *at))
    }

    /// The peer acknowledged `message_id` (`bytes` long, sent at
    /// `send_time`) at `ack_time`.
    pub fn on_ack(&mut self, message_id: u32, bytes: u64, send_time: Instant, ack_time: Instant) {
        if let Some(pos) = self.outstanding.iter().position(|(id, _, _)| *id == message_id) {
            self.outstanding.remove(pos);
        }
        let rtt = ack_time.saturating_duration_since(send_time);
        let prev_srtt = self.srtt_us;
        self.record_rtt(rtt);

        if self.samples.len() >= self.config.max_samples.max(2) {
            self.samples.pop_front();
        }
        self.samples.push_back(BandwidthSample { bytes, rtt, at: ack_time });

        self.update_estimate(prev_srtt);
    }

    /// Fold an RTT measurement (ack or ping/pong) into the smoothed RTT.
    pub fn record_rtt(&mut self, rtt: Duration) {
        let us = rtt.as_micros() as f64;
        self.srtt_us = Some(match self.srtt_us {
            None => us,
            // srtt = 7/8 * srtt + 1/8 * sample
            Some(srtt) => srtt * 7.0 / 8.0 + us / 8.0,
        });
        self.baseline = Some(match self.baseline {
            Some(b) => b.min(rtt),
            None => rtt,
        });
    }

    pub fn estimate(&self) -> BandwidthState {
        BandwidthState {
            bandwidth: self.estimate,
            rtt: self.smoothed_rtt(),
            baseline_rtt: self.baseline,
            congestion: self.is_congested(),
            outstanding: self.outstanding.len(),
        }
    }

    pub fn smoothed_rtt(&self) -> Option<Duration> {
        self.srtt_us.map(|us| Duration::from_micros(us as u64))
    }

    pub fn samples(&self) -> impl Iterator<Item = &BandwidthSample> {
        self.samples.iter()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Forget everything (peer reconnected).
    pub fn reset(&mut self) {
        self.samples.clear();
        self.outstanding.clear();
        self.srtt_us = None;
        self.baseline = None;
        self.estimate = None;
    }

    // ── Internal ─────────────────────────────────────────────────

    fn is_congested(&self) -> bool {
        if self.outstanding.len() > self.config.max_outstanding {
            return true;
        }
        match (self.srtt_us, self.baseline) {
            (Some(srtt), Some(base)) if !base.is_zero() => {
                srtt > self.config.congestion_rtt_factor * base.as_micros() as f64
            }
            _ => false,
        }
    }

    /// Raw throughput over the sample window. The first sample only marks
    /// the start of the interval.
    fn raw_throughput(&self) -> Option<f64> {
        let first = self.samples.front()?;
        let last = self.samples.back()?;
        let span = last.at.saturating_duration_since(first.at);
        if self.samples.len() < 2 || span.is_zero() {
            return None;
        }
        let bytes: u64 = self.samples.iter().skip(1).map(|s| s.bytes).sum();
        Some(bytes as f64 / span.as_secs_f64())
    }

    fn latency_factor(&self) -> f64 {
        match (self.srtt_us, self.baseline) {
            (Some(srtt), Some(base)) if srtt > 0.0 => (base.as_micros() as f64 / srtt).min(1.0),
            _ => 1.0,
        }
    }

    fn update_estimate(&mut self, prev_srtt: Option<f64>) {
        let Some(raw) = self.raw_throughput() else {
            return;
        };
        let mut next = raw * self.latency_factor();

        if let Some(prev) = self.estimate {
            let prev = prev as f64;
            let floor = prev * (1.0 - self.config.max_decay.clamp(0.0, 1.0));
            next = next.max(floor);
            let rising = matches!((prev_srtt, self.srtt_us), (Some(a), Some(b)) if b > a);
            if rising {
                next = next.min(prev);
            }
        }

        let mut next = next as u64;
        if let Some(cap) = self.config.ceiling {
            next = next.min(cap);
        }
        trace!(bandwidth = next, rtt_us = ?self.srtt_us, "bandwidth estimate");
        self.estimate = Some(next);
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new(EstimatorConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
