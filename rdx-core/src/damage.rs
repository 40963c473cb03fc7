//! Damage aggregation and batching.
//!
//! Capture reports damaged rectangles per window. Nearby rectangles are
//! merged into their bounding box when that does not waste too much area;
//! otherwise they are kept as a short list which is promoted to a
//! full-window refresh once it grows past `max_regions`.
//!
//! A window's pending damage becomes an [`EncodingJob`] when one of:
//!
//! - the batch delay has elapsed since the first pending region (the delay
//!   grows with the measured RTT);
//! - the pending area exceeds `full_refresh_ratio` of the window;
//! - a flush was requested (ping-pong, resize);
//!
//! and the window has a free in-flight slot. Damage reported while jobs are
//! in flight is merged into the next job.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::RdxError;
use crate::types::Rect;

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorConfig {
    /// Merge two regions when the bounding box area is at most this
    /// multiple of their combined area.
    pub merge_overhead: f64,
    /// Regions kept per window before promoting to a full-window refresh.
    pub max_regions: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the smoothed RTT added to `min_delay`.
    pub rtt_delay_fraction: f64,
    /// Pending area above this fraction of the window triggers an immediate
    /// full-window refresh.
    pub full_refresh_ratio: f64,
    /// Encode jobs a window may have in flight (1 or 2).
    pub max_in_flight: usize,
    /// In-flight slots idle longer than this are reclaimed.
    pub job_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            merge_overhead: 1.25,
            max_regions: 32,
            min_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
            rtt_delay_fraction: 0.5,
            full_refresh_ratio: 0.7,
            max_in_flight: 2,
            job_timeout: Duration::from_secs(5),
        }
    }
}

// ── DamageRegion / EncodingJob ───────────────────────────────────

/// A damaged rectangle and the sequence number it was reported under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DamageRegion {
    pub rect: Rect,
    pub seq: u64,
    pub timestamp: Instant,
}

/// Geometry of one batch of damage, ready for selection and capture.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingJob {
    pub window_id: u32,
    /// Unique per window, increasing in dispatch order.
    pub job_id: u64,
    /// Merged regions; a single window-sized rect when `full_window`.
    pub regions: Vec<Rect>,
    pub full_window: bool,
    /// Highest damage sequence number covered by this job.
    pub damage_seq: u64,
    pub created_at: Instant,
    /// Earlier in-flight jobs whose output this job makes obsolete.
    pub supersedes: Vec<u64>,
}

impl EncodingJob {
    pub fn area(&self) -> u64 {
        self.regions.iter().map(Rect::area).sum()
    }
}

// ── Per-window state ─────────────────────────────────────────────

#[derive(Debug)]
struct InFlight {
    job_id: u64,
    regions: Vec<Rect>,
    full_window: bool,
    damage_seq: u64,
    dispatched_at: Instant,
}

#[derive(Debug)]
struct WindowDamage {
    width: u32,
    height: u32,
    pending: Vec<DamageRegion>,
    full: bool,
    full_seq: u64,
    first_pending_at: Option<Instant>,
    flush: bool,
    refresh_now: bool,
    in_flight: Vec<InFlight>,
    next_seq: u64,
    next_job_id: u64,
}

impl WindowDamage {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pending: Vec::new(),
            full: false,
            full_seq: 0,
            first_pending_at: None,
            flush: false,
            refresh_now: false,
            in_flight: Vec::new(),
            next_seq: 1,
            next_job_id: 1,
        }
    }

    fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width, self.height)
    }

    fn has_pending(&self) -> bool {
        self.full || !self.pending.is_empty()
    }

    fn pending_area(&self) -> u64 {
        if self.full {
            return self.bounds().area();
        }
        self.pending.iter().map(|r| r.rect.area()).sum()
    }

    fn promote_full(&mut self, seq: u64) {
        let max_seq = self.pending.iter().map(|r| r.seq).max().unwrap_or(0);
        self.full = true;
        self.full_seq = self.full_seq.max(max_seq).max(seq);
        self.pending.clear();
    }

    /// Add a clipped region, merging where cheap.
    fn add(&mut self, region: DamageRegion, config: &AggregatorConfig) {
        if self.first_pending_at.is_none() {
            self.first_pending_at = Some(region.timestamp);
        }
        if region.rect.contains(&self.bounds()) {
            self.promote_full(region.seq);
            self.refresh_now |= config.full_refresh_ratio < 1.0;
            return;
        }
        if self.full {
            self.full_seq = self.full_seq.max(region.seq);
            return;
        }

        let mut current = region;
        // Keep merging until the merged box no longer absorbs anything.
        loop {
            let found = self.pending.iter().position(|p| {
                let union = p.rect.union(&current.rect);
                union.area() as f64
                    <= config.merge_overhead * (p.rect.area() + current.rect.area()) as f64
            });
            match found {
                Some(i) => {
                    let p = self.pending.swap_remove(i);
                    current = DamageRegion {
                        rect: p.rect.union(&current.rect),
                        seq: p.seq.max(current.seq),
                        timestamp: p.timestamp.min(current.timestamp),
                    };
                }
                None => break,
            }
        }
        self.pending.push(current);

        if self.pending_area() as f64 > config.full_refresh_ratio * self.bounds().area() as f64 {
            self.promote_full(current.seq);
            self.refresh_now = true;
        } else if self.pending.len() > config.max_regions {
            trace!(regions = self.pending.len(), "too many regions, promoting to full refresh");
            self.promote_full(current.seq);
        }
    }

    fn clear_pending(&mut self) {
        self.pending.clear();
        self.full = false;
        self.full_seq = 0;
        self.first_pending_at = None;
        self.flush = false;
        self.refresh_now = false;
    }
}

// ── DamageAggregator ─────────────────────────────────────────────

pub struct DamageAggregator {
    config: AggregatorConfig,
    windows: BTreeMap<u32, WindowDamage>,
}

impl DamageAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self {
            config,
            windows: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    // ── Window lifecycle ─────────────────────────────────────────

    /// Start tracking a window. The first frame is a full refresh.
    pub fn window_created(&mut self, window_id: u32, width: u32, height: u32, now: Instant) {
        let mut w = WindowDamage::new(width, height);
        w.first_pending_at = Some(now);
        w.promote_full(0);
        w.flush = true;
        self.windows.insert(window_id, w);
    }

    /// Resize clips pending damage and forces a flushed full refresh.
    pub fn window_resized(
        &mut self,
        window_id: u32,
        width: u32,
        height: u32,
        now: Instant,
    ) -> Result<(), RdxError> {
        let w = self
            .windows
            .get_mut(&window_id)
            .ok_or(RdxError::UnknownWindow(window_id))?;
        w.width = width;
        w.height = height;
        w.first_pending_at.get_or_insert(now);
        let seq = w.next_seq;
        w.next_seq += 1;
        w.promote_full(seq);
        w.flush = true;
        Ok(())
    }

    /// Stop tracking a window. Returns the ids of jobs still in flight.
    pub fn window_closed(&mut self, window_id: u32) -> Vec<u64> {
        self.windows
            .remove(&window_id)
            .map(|w| w.in_flight.iter().map(|j| j.job_id).collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, window_id: u32) -> bool {
        self.windows.contains_key(&window_id)
    }

    pub fn window_size(&self, window_id: u32) -> Option<(u32, u32)> {
        self.windows.get(&window_id).map(|w| (w.width, w.height))
    }

    // ── Damage ───────────────────────────────────────────────────

    /// Record damage for a window. Returns the assigned sequence number, or
    /// `None` when the rectangle lies entirely outside the window.
    pub fn notify(&mut self, window_id: u32, rect: Rect, now: Instant) -> Result<Option<u64>, RdxError> {
        let config = &self.config;
        let w = self
            .windows
            .get_mut(&window_id)
            .ok_or(RdxError::UnknownWindow(window_id))?;
        let Some(clipped) = rect.clip_to(w.width, w.height) else {
            return Ok(None);
        };
        let seq = w.next_seq;
        w.next_seq += 1;
        w.add(
            DamageRegion {
                rect: clipped,
                seq,
                timestamp: now,
            },
            config,
        );
        Ok(Some(seq))
    }

    /// Make a window's pending damage ready regardless of the batch delay.
    ///
    /// Has no effect on a window with nothing pending; later damage is
    /// batched normally.
    pub fn request_flush(&mut self, window_id: u32) {
        if let Some(w) = self.windows.get_mut(&window_id) {
            w.flush |= w.has_pending();
        }
    }

    pub fn flush_all(&mut self) {
        for w in self.windows.values_mut() {
            w.flush |= w.has_pending();
        }
    }

    /// Batch delay for a smoothed RTT.
    pub fn batch_delay(&self, srtt: Option<Duration>) -> Duration {
        let extra = srtt
            .map(|rtt| rtt.mul_f64(self.config.rtt_delay_fraction.max(0.0)))
            .unwrap_or_default();
        (self.config.min_delay + extra).clamp(self.config.min_delay, self.config.max_delay.max(self.config.min_delay))
    }

    /// Turn ready pending damage into jobs, in window-id order.
    pub fn collect_ready(&mut self, now: Instant, srtt: Option<Duration>) -> Vec<EncodingJob> {
        let delay = self.batch_delay(srtt);
        let max_in_flight = self.config.max_in_flight.clamp(1, 2);
        let mut jobs = Vec::new();

        for (&window_id, w) in self.windows.iter_mut() {
            if !w.has_pending() || w.in_flight.len() >= max_in_flight {
                continue;
            }
            let waited = w
                .first_pending_at
                .map(|t| now.saturating_duration_since(t) >= delay)
                .unwrap_or(true);
            if !(waited || w.flush || w.refresh_now) {
                continue;
            }

            let full_window = w.full;
            let (regions, damage_seq) = if full_window {
                (vec![w.bounds()], w.full_seq)
            } else {
                (
                    w.pending.iter().map(|r| r.rect).collect::<Vec<_>>(),
                    w.pending.iter().map(|r| r.seq).max().unwrap_or(0),
                )
            };
            let job_id = w.next_job_id;
            w.next_job_id += 1;

            let supersedes = if full_window {
                w.in_flight.drain(..).map(|j| j.job_id).collect()
            } else {
                Vec::new()
            };
            w.in_flight.push(InFlight {
                job_id,
                regions: regions.clone(),
                full_window,
                damage_seq,
                dispatched_at: now,
            });
            w.clear_pending();

            debug!(
                window_id,
                job_id,
                full_window,
                regions = regions.len(),
                "damage batch ready"
            );
            jobs.push(EncodingJob {
                window_id,
                job_id,
                regions,
                full_window,
                damage_seq,
                created_at: now,
                supersedes,
            });
        }
        jobs
    }

    /// Earliest instant at which a window with pending damage becomes ready
    /// by delay alone.
    pub fn next_deadline(&self, srtt: Option<Duration>) -> Option<Instant> {
        let delay = self.batch_delay(srtt);
        let max_in_flight = self.config.max_in_flight.clamp(1, 2);
        self.windows
            .values()
            .filter(|w| w.has_pending() && w.in_flight.len() < max_in_flight)
            .filter_map(|w| w.first_pending_at.map(|t| t + delay))
            .min()
    }

    // ── In-flight bookkeeping ────────────────────────────────────

    /// Release the in-flight slot of a finished job.
    pub fn job_finished(&mut self, window_id: u32, job_id: u64) -> bool {
        let Some(w) = self.windows.get_mut(&window_id) else {
            return false;
        };
        match w.in_flight.iter().position(|j| j.job_id == job_id) {
            Some(i) => {
                w.in_flight.remove(i);
                true
            }
            None => false,
        }
    }

    /// Reclaim slots idle longer than `job_timeout`. Their regions go back
    /// into the pending set. Returns `(window_id, job_id)` for each.
    pub fn expire_in_flight(&mut self, now: Instant) -> Vec<(u32, u64)> {
        let timeout = self.config.job_timeout;
        let config = &self.config;
        let mut expired = Vec::new();
        for (&window_id, w) in self.windows.iter_mut() {
            let (stale, live): (Vec<_>, Vec<_>) = w
                .in_flight
                .drain(..)
                .partition(|j| now.saturating_duration_since(j.dispatched_at) > timeout);
            w.in_flight = live;
            for job in stale {
                debug!(window_id, job_id = job.job_id, "reclaiming stalled encode job");
                if job.full_window {
                    w.first_pending_at.get_or_insert(now);
                    w.promote_full(job.damage_seq);
                } else {
                    for rect in job.regions {
                        if let Some(clipped) = rect.clip_to(w.width, w.height) {
                            w.add(
                                DamageRegion {
                                    rect: clipped,
                                    seq: job.damage_seq,
                                    timestamp: now,
                                },
                                config,
                            );
                        }
                    }
                }
                expired.push((window_id, job.job_id));
            }
        }
        expired
    }

    // ── Introspection ────────────────────────────────────────────

    pub fn in_flight(&self, window_id: u32) -> usize {
        self.windows.get(&window_id).map_or(0, |w| w.in_flight.len())
    }

    pub fn has_pending(&self, window_id: u32) -> bool {
        self.windows.get(&window_id).is_some_and(WindowDamage::has_pending)
    }

    pub fn pending_regions(&self, window_id: u32) -> Vec<Rect> {
        match self.windows.get(&window_id) {
            Some(w) if w.full => vec![w.bounds()],
            Some(w) => w.pending.iter().map(|r| r.rect).collect(),
            None => Vec::new(),
        }
    }

    /// Fraction of the window covered by pending damage (0.0 – 1.0).
    pub fn pending_ratio(&self, window_id: u32) -> f64 {
        let Some(w) = self.windows.get(&window_id) else {
            return 0.0;
        };
        let total = w.bounds().area() as f64;
        if total == 0.0 {
            return 0.0;
        }
        (w.pending_area() as f64 / total).min(1.0)
    }
}

impl Default for DamageAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Aggregator with one 800x600 window whose initial refresh has been
    /// dispatched and finished.
    fn setup(config: AggregatorConfig) -> (DamageAggregator, Instant) {
        let mut agg = DamageAggregator::new(config);
        let t0 = Instant::now();
        agg.window_created(1, 800, 600, t0);
        let jobs = agg.collect_ready(t0, None);
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].full_window);
        assert!(agg.job_finished(1, jobs[0].job_id));
        (agg, t0)
    }

    #[test]
    fn overlapping_regions_merge_into_bounding_box() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        agg.notify(1, Rect::new(0, 0, 100, 100), t0).unwrap();
        agg.notify(1, Rect::new(50, 50, 100, 100), t0).unwrap();

        let jobs = agg.collect_ready(t0 + Duration::from_secs(1), None);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].regions, vec![Rect::new(0, 0, 150, 150)]);
        assert!(!jobs[0].full_window);
    }

    #[test]
    fn distant_regions_stay_separate() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        agg.notify(1, Rect::new(0, 0, 10, 10), t0).unwrap();
        agg.notify(1, Rect::new(500, 400, 10, 10), t0).unwrap();
        let jobs = agg.collect_ready(t0 + Duration::from_secs(1), None);
        assert_eq!(jobs[0].regions.len(), 2);
    }

    #[test]
    fn too_many_regions_promote_to_full_window() {
        let (mut agg, t0) = setup(AggregatorConfig {
            max_regions: 4,
            ..AggregatorConfig::default()
        });
        for i in 0..5 {
            agg.notify(1, Rect::new(i * 150, 0, 5, 5), t0).unwrap();
        }
        let jobs = agg.collect_ready(t0 + Duration::from_secs(1), None);
        assert!(jobs[0].full_window);
        assert_eq!(jobs[0].regions, vec![Rect::new(0, 0, 800, 600)]);
        assert_eq!(jobs[0].damage_seq, 5);
    }

    #[test]
    fn large_damage_triggers_immediate_refresh() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        agg.notify(1, Rect::new(0, 0, 800, 500), t0).unwrap();
        // No delay has elapsed but the window is mostly damaged.
        let jobs = agg.collect_ready(t0, None);
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].full_window);
    }

    #[test]
    fn batch_delay_holds_small_damage() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        agg.notify(1, Rect::new(0, 0, 10, 10), t0).unwrap();
        assert!(agg.collect_ready(t0 + Duration::from_millis(1), None).is_empty());
        assert_eq!(agg.next_deadline(None), Some(t0 + Duration::from_millis(5)));
        assert_eq!(agg.collect_ready(t0 + Duration::from_millis(5), None).len(), 1);
    }

    #[test]
    fn batch_delay_grows_with_rtt_and_is_clamped() {
        let agg = DamageAggregator::default();
        assert_eq!(agg.batch_delay(None), Duration::from_millis(5));
        assert_eq!(
            agg.batch_delay(Some(Duration::from_millis(40))),
            Duration::from_millis(25)
        );
        assert_eq!(
            agg.batch_delay(Some(Duration::from_secs(2))),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn flush_bypasses_delay() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        agg.notify(1, Rect::new(0, 0, 10, 10), t0).unwrap();
        agg.request_flush(1);
        assert_eq!(agg.collect_ready(t0, None).len(), 1);
    }

    #[test]
    fn flush_without_pending_damage_is_not_remembered() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        agg.request_flush(1);
        agg.flush_all();
        agg.notify(1, Rect::new(0, 0, 10, 10), t0).unwrap();
        assert!(agg.collect_ready(t0, None).is_empty());
        assert_eq!(agg.collect_ready(t0 + Duration::from_secs(1), None).len(), 1);
    }

    #[test]
    fn damage_during_flight_waits_for_free_slot() {
        let (mut agg, t0) = setup(AggregatorConfig {
            max_in_flight: 1,
            ..AggregatorConfig::default()
        });
        let later = t0 + Duration::from_secs(1);
        agg.notify(1, Rect::new(0, 0, 10, 10), t0).unwrap();
        let first = agg.collect_ready(later, None);
        assert_eq!(first.len(), 1);

        agg.notify(1, Rect::new(20, 20, 10, 10), later).unwrap();
        agg.notify(1, Rect::new(25, 25, 10, 10), later).unwrap();
        assert!(agg.collect_ready(later + Duration::from_secs(1), None).is_empty());

        agg.job_finished(1, first[0].job_id);
        let second = agg.collect_ready(later + Duration::from_secs(1), None);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].regions, vec![Rect::new(20, 20, 15, 15)]);
        assert!(second[0].job_id > first[0].job_id);
        assert!(second[0].damage_seq > first[0].damage_seq);
    }

    #[test]
    fn in_flight_limit_never_exceeds_two() {
        let (mut agg, t0) = setup(AggregatorConfig {
            max_in_flight: 5,
            ..AggregatorConfig::default()
        });
        let mut t = t0;
        for i in 0..4 {
            t += Duration::from_secs(1);
            agg.notify(1, Rect::new(i * 20, 0, 10, 10), t).unwrap();
            agg.collect_ready(t + Duration::from_secs(1), None);
        }
        assert_eq!(agg.in_flight(1), 2);
        assert_eq!(agg.pending_regions(1).len(), 2);
    }

    #[test]
    fn full_window_job_supersedes_in_flight_jobs() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        let later = t0 + Duration::from_secs(1);
        agg.notify(1, Rect::new(0, 0, 10, 10), t0).unwrap();
        let first = agg.collect_ready(later, None);

        agg.notify(1, Rect::new(0, 0, 800, 600), later).unwrap();
        let second = agg.collect_ready(later, None);
        assert!(second[0].full_window);
        assert_eq!(second[0].supersedes, vec![first[0].job_id]);
        assert_eq!(agg.in_flight(1), 1);
    }

    #[test]
    fn rects_are_clipped_to_window() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        assert_eq!(agg.notify(1, Rect::new(900, 0, 10, 10), t0).unwrap(), None);
        agg.notify(1, Rect::new(790, 590, 50, 50), t0).unwrap();
        assert_eq!(agg.pending_regions(1), vec![Rect::new(790, 590, 10, 10)]);
    }

    #[test]
    fn unknown_window_is_an_error() {
        let mut agg = DamageAggregator::default();
        assert!(matches!(
            agg.notify(9, Rect::new(0, 0, 1, 1), Instant::now()),
            Err(RdxError::UnknownWindow(9))
        ));
    }

    #[test]
    fn stalled_jobs_are_reclaimed_and_requeued() {
        let (mut agg, t0) = setup(AggregatorConfig {
            max_in_flight: 1,
            ..AggregatorConfig::default()
        });
        agg.notify(1, Rect::new(10, 10, 20, 20), t0).unwrap();
        let jobs = agg.collect_ready(t0 + Duration::from_secs(1), None);
        assert_eq!(agg.in_flight(1), 1);

        let expired = agg.expire_in_flight(t0 + Duration::from_secs(10));
        assert_eq!(expired, vec![(1, jobs[0].job_id)]);
        assert_eq!(agg.in_flight(1), 0);
        assert_eq!(agg.pending_regions(1), vec![Rect::new(10, 10, 20, 20)]);
    }

    #[test]
    fn resize_forces_full_refresh() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        agg.window_resized(1, 1024, 768, t0).unwrap();
        let jobs = agg.collect_ready(t0, None);
        assert_eq!(jobs[0].regions, vec![Rect::new(0, 0, 1024, 768)]);
    }

    #[test]
    fn dispatched_jobs_cover_every_notified_region() {
        let (mut agg, t0) = setup(AggregatorConfig {
            max_regions: 8,
            full_refresh_ratio: 2.0,
            ..AggregatorConfig::default()
        });
        let mut notified = Vec::new();
        let mut covered = Vec::new();
        let mut t = t0;
        for i in 0..200u32 {
            let rect = Rect::new((i * 37) % 780, (i * 53) % 580, 5 + i % 40, 5 + i % 30);
            agg.notify(1, rect, t).unwrap();
            notified.push(rect.clip_to(800, 600).unwrap());
            if i % 7 == 0 {
                t += Duration::from_millis(50);
                for job in agg.collect_ready(t, None) {
                    covered.extend(job.regions.iter().copied());
                    agg.job_finished(1, job.job_id);
                }
            }
        }
        agg.flush_all();
        for job in agg.collect_ready(t, None) {
            covered.extend(job.regions.iter().copied());
        }
        for rect in notified {
            assert!(covered.iter().any(|c| c.contains(&rect)), "{rect:?} not covered");
        }
    }

    #[test]
    fn pending_ratio_reports_coverage() {
        let (mut agg, t0) = setup(AggregatorConfig::default());
        agg.notify(1, Rect::new(0, 0, 400, 300), t0).unwrap();
        assert!((agg.pending_ratio(1) - 0.25).abs() < 1e-9);
    }
}
