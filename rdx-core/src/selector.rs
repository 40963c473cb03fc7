//! Per-job encoding selection and the per-window quality/speed controller.
//!
//! The selector turns a job, the session's policy and the current bandwidth
//! state into a [`Selection`]: which encoding to try first, at what quality
//! and speed, and which encodings to fall back to if the encode fails.
//!
//! The controller keeps a little state per window ([`ControllerState`]) so
//! that quality moves smoothly and encodings don't flap.

use tracing::debug;

use crate::bandwidth::BandwidthState;
use crate::codecs::{CodecFactory, CodecRegistry, FALLBACK_ENCODING};
use crate::policy::EncodingPolicy;
use crate::types::{Colorspace, Rect};

use std::sync::Arc;

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Below this many bytes/second auto quality aims at `min_quality`.
    pub low_bandwidth: u64,
    /// At or above this auto quality aims at `max_quality`.
    pub high_bandwidth: u64,
    /// Auto speed with no backlog.
    pub base_speed: u8,
    /// Auto speed added per backlogged update.
    pub backlog_speed_step: u8,
    /// Backlog at or above this counts towards `backlog_persist`.
    pub backlog_threshold: usize,
    /// Consecutive backlogged jobs before non-video encodings are preferred.
    pub backlog_persist: u32,
    /// Consecutive decisions a new encoding must win before switching.
    pub switch_hysteresis: u32,
    /// At or above this speed the cheapest encoding of the preferred class
    /// wins.
    pub cost_tiebreak_speed: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            low_bandwidth: 1_000_000,
            high_bandwidth: 10_000_000,
            base_speed: 50,
            backlog_speed_step: 15,
            backlog_threshold: 2,
            backlog_persist: 3,
            switch_hysteresis: 3,
            cost_tiebreak_speed: 70,
        }
    }
}

// ── Inputs & outputs ─────────────────────────────────────────────

/// What the pixels of a captured job look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentHint {
    #[default]
    Normal,
    /// Every pixel has the same value.
    Solid,
    /// Identical to the previous full-window capture.
    Unchanged,
}

/// Everything the selector needs to know about one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub window_width: u32,
    pub window_height: u32,
    /// Bounding box of the job's regions.
    pub bounds: Rect,
    pub region_count: usize,
    pub full_window: bool,
    pub colorspace: Colorspace,
    /// In-flight plus unacknowledged updates of the window.
    pub backlog: usize,
    pub content: ContentHint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub encoding: String,
    pub quality: u8,
    pub speed: u8,
    /// Encodings to try, in order, if `encoding` fails. Ends with the
    /// fallback encoding unless that is `encoding` itself.
    pub fallbacks: Vec<String>,
}

impl Selection {
    /// `encoding` followed by the fallbacks.
    pub fn chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.encoding.as_str()).chain(self.fallbacks.iter().map(String::as_str))
    }
}

/// Per-window controller memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerState {
    quality: Option<u8>,
    current: Option<String>,
    candidate: Option<String>,
    candidate_streak: u32,
    backlog_streak: u32,
}

impl ControllerState {
    /// Encoding the window is currently using.
    pub fn current_encoding(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn last_quality(&self) -> Option<u8> {
        self.quality
    }

    /// Forget the current encoding; the next decision switches immediately.
    pub fn reset_encoding(&mut self) {
        self.current = None;
        self.candidate = None;
        self.candidate_streak = 0;
    }
}

// ── EncodingSelector ─────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct EncodingSelector {
    config: ControllerConfig,
}

impl EncodingSelector {
    pub fn new(config: ControllerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn select(
        &self,
        state: &mut ControllerState,
        job: &JobContext,
        policy: &EncodingPolicy,
        bandwidth: &BandwidthState,
        registry: &CodecRegistry,
    ) -> Selection {
        let quality = self.next_quality(state, policy, bandwidth);
        let speed = self.next_speed(policy, job.backlog);

        if job.backlog >= self.config.backlog_threshold {
            state.backlog_streak = state.backlog_streak.saturating_add(1);
        } else {
            state.backlog_streak = 0;
        }
        let avoid_video = state.backlog_streak >= self.config.backlog_persist;

        let mut ordered: Vec<Arc<dyn CodecFactory>> = registry
            .effective_encodings(policy)
            .into_iter()
            .filter(|c| can_handle(c.as_ref(), job, policy))
            .collect();
        if avoid_video {
            // Stable: keeps policy order inside each group.
            ordered.sort_by_key(|c| c.info().video);
        }
        if speed >= self.config.cost_tiebreak_speed {
            prefer_cheapest(&mut ordered);
        }
        let names: Vec<String> = ordered.iter().map(|c| c.info().name.clone()).collect();

        let static_content = job.full_window && job.content != ContentHint::Normal;
        let encoding = if static_content {
            ordered
                .iter()
                .find(|c| c.info().lossless)
                .map(|c| c.info().name.clone())
                .unwrap_or_else(|| FALLBACK_ENCODING.to_string())
        } else {
            let desired = names
                .first()
                .cloned()
                .unwrap_or_else(|| FALLBACK_ENCODING.to_string());
            self.apply_hysteresis(state, desired, &names)
        };

        let mut fallbacks: Vec<String> = names.into_iter().filter(|n| *n != encoding).collect();
        fallbacks.retain(|n| n != FALLBACK_ENCODING);
        if encoding != FALLBACK_ENCODING {
            fallbacks.push(FALLBACK_ENCODING.to_string());
        }

        Selection {
            encoding,
            quality,
            speed,
            fallbacks,
        }
    }

    /// Auto-mode quality goal for the current link conditions.
    pub fn target_quality(&self, policy: &EncodingPolicy, bandwidth: &BandwidthState) -> u8 {
        let lo = policy.min_quality.max(1);
        let hi = policy.max_quality.max(lo);
        if bandwidth.congestion {
            return lo;
        }
        match bandwidth.bandwidth {
            None => hi,
            Some(b) if b < self.config.low_bandwidth => lo,
            Some(b) if b >= self.config.high_bandwidth => hi,
            Some(b) => {
                let span = (self.config.high_bandwidth - self.config.low_bandwidth).max(1);
                let frac = (b - self.config.low_bandwidth) as f64 / span as f64;
                lo + ((hi - lo) as f64 * frac) as u8
            }
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    fn next_quality(
        &self,
        state: &mut ControllerState,
        policy: &EncodingPolicy,
        bandwidth: &BandwidthState,
    ) -> u8 {
        if !policy.is_auto_quality() {
            return policy.fixed_quality();
        }
        let target = self.target_quality(policy, bandwidth) as i32;
        let prev = state.quality.map_or(target, i32::from);
        let mut q = prev + (target - prev) / 2;
        if q == prev {
            q = target;
        }
        let q = q.clamp(policy.min_quality.max(1) as i32, policy.max_quality.max(1) as i32) as u8;
        state.quality = Some(q);
        q
    }

    fn next_speed(&self, policy: &EncodingPolicy, backlog: usize) -> u8 {
        if !policy.is_auto_speed() {
            return policy.fixed_speed();
        }
        let raised = self.config.base_speed as usize
            + backlog.saturating_mul(self.config.backlog_speed_step as usize);
        raised.clamp(policy.min_speed.max(1) as usize, 100) as u8
    }

    fn apply_hysteresis(&self, state: &mut ControllerState, desired: String, eligible: &[String]) -> String {
        let current_ok = state
            .current
            .as_ref()
            .is_some_and(|c| eligible.iter().any(|e| e == c));
        if !current_ok {
            if let Some(old) = &state.current {
                debug!(from = %old, to = %desired, "current encoding ineligible, switching");
            }
            state.current = Some(desired.clone());
            state.candidate = None;
            state.candidate_streak = 0;
            return desired;
        }

        let current = state.current.clone().unwrap_or_default();
        if desired == current {
            state.candidate = None;
            state.candidate_streak = 0;
            return current;
        }
        if state.candidate.as_deref() == Some(desired.as_str()) {
            state.candidate_streak += 1;
        } else {
            state.candidate = Some(desired.clone());
            state.candidate_streak = 1;
        }
        if state.candidate_streak >= self.config.switch_hysteresis.max(1) {
            debug!(from = %current, to = %desired, "switching encoding");
            state.current = Some(desired.clone());
            state.candidate = None;
            state.candidate_streak = 0;
            desired
        } else {
            current
        }
    }
}

/// Whether a codec can take this job at all. A colourspace the codec
/// lacks is acceptable only when conversion is enabled; the encode worker
/// then converts the capture with [`crate::types::Snapshot::convert`].
fn can_handle(codec: &dyn CodecFactory, job: &JobContext, policy: &EncodingPolicy) -> bool {
    let info = codec.info();
    if !info.colorspaces.supports(job.colorspace) && !policy.has_csc() {
        return false;
    }
    if info.video {
        let block = info.block_size.max(1);
        return policy.allows_video_encoder(&info.name)
            && job.region_count == 1
            && job.window_width >= block
            && job.window_height >= block
            && info
                .video_output_size(job.bounds.width, job.bounds.height, policy.video_scaling)
                .is_some();
    }
    info.accepts_size(job.bounds.width, job.bounds.height)
}

/// Move the cheapest encoding sharing the first one's lossless class to
/// the front.
fn prefer_cheapest(ordered: &mut Vec<Arc<dyn CodecFactory>>) {
    let Some(first) = ordered.first() else {
        return;
    };
    let class = first.info().lossless;
    let best = ordered
        .iter()
        .enumerate()
        .filter(|(_, c)| c.info().lossless == class)
        .min_by_key(|(i, c)| (c.info().cost, *i))
        .map(|(i, _)| i);
    if let Some(i) = best.filter(|&i| i > 0) {
        let c = ordered.remove(i);
        ordered.insert(0, c);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::tests::FakeCodec;
    use crate::policy::VideoScaling;
    use crate::types::ColorspaceSet;

    fn registry(codecs: Vec<FakeCodec>) -> CodecRegistry {
        let mut reg = CodecRegistry::with_builtins();
        for c in codecs {
            reg.register(Arc::new(c));
        }
        reg
    }

    fn policy(encodings: &[&str]) -> EncodingPolicy {
        EncodingPolicy {
            encodings: encodings.iter().map(|s| s.to_string()).collect(),
            ..EncodingPolicy::default()
        }
    }

    fn job() -> JobContext {
        JobContext {
            window_width: 800,
            window_height: 600,
            bounds: Rect::new(0, 0, 200, 100),
            region_count: 1,
            full_window: false,
            colorspace: Colorspace::Bgrx,
            backlog: 0,
            content: ContentHint::Normal,
        }
    }

    fn bw(bandwidth: Option<u64>, congestion: bool) -> BandwidthState {
        BandwidthState {
            bandwidth,
            congestion,
            ..BandwidthState::default()
        }
    }

    #[test]
    fn auto_quality_moves_toward_min_on_low_bandwidth() {
        let sel = EncodingSelector::default();
        let reg = registry(vec![]);
        let pol = policy(&["zrgb"]);
        let mut state = ControllerState::default();

        let first = sel.select(&mut state, &job(), &pol, &bw(Some(50_000_000), false), &reg);
        assert_eq!(first.quality, 100);

        let mut prev = first.quality;
        for _ in 0..10 {
            let s = sel.select(&mut state, &job(), &pol, &bw(Some(100_000), false), &reg);
            assert!(s.quality <= prev);
            assert!(s.quality >= pol.min_quality);
            prev = s.quality;
        }
        assert_eq!(prev, pol.min_quality);
    }

    #[test]
    fn congestion_targets_min_quality() {
        let sel = EncodingSelector::default();
        let pol = policy(&["zrgb"]);
        assert_eq!(sel.target_quality(&pol, &bw(Some(50_000_000), true)), 30);
        assert_eq!(sel.target_quality(&pol, &bw(None, false)), 100);
        let mid = sel.target_quality(&pol, &bw(Some(5_500_000), false));
        assert!(mid > 30 && mid < 100);
    }

    #[test]
    fn fixed_quality_and_speed_are_clamped() {
        let sel = EncodingSelector::default();
        let reg = registry(vec![]);
        let pol = EncodingPolicy {
            quality: 10,
            min_quality: 40,
            speed: 20,
            min_speed: 60,
            ..policy(&["zrgb"])
        };
        let s = sel.select(&mut ControllerState::default(), &job(), &pol, &bw(None, true), &reg);
        assert_eq!(s.quality, 40);
        assert_eq!(s.speed, 60);
    }

    #[test]
    fn backlog_raises_speed() {
        let sel = EncodingSelector::default();
        let reg = registry(vec![]);
        let pol = policy(&["zrgb"]);
        let mut state = ControllerState::default();
        let idle = sel.select(&mut state, &job(), &pol, &bw(None, false), &reg);
        let busy = sel.select(
            &mut state,
            &JobContext { backlog: 3, ..job() },
            &pol,
            &bw(None, false),
            &reg,
        );
        assert!(busy.speed > idle.speed);
        let swamped = sel.select(
            &mut state,
            &JobContext { backlog: 50, ..job() },
            &pol,
            &bw(None, false),
            &reg,
        );
        assert_eq!(swamped.speed, 100);
    }

    #[test]
    fn switch_requires_consecutive_wins() {
        let sel = EncodingSelector::default();
        let reg = registry(vec![FakeCodec::new("jpeg")]);
        let mut state = ControllerState::default();

        let s = sel.select(&mut state, &job(), &policy(&["zrgb", "jpeg"]), &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");

        // jpeg is now preferred, but must win three times in a row.
        let pol = policy(&["jpeg", "zrgb"]);
        let picks: Vec<String> = (0..3)
            .map(|_| sel.select(&mut state, &job(), &pol, &bw(None, false), &reg).encoding)
            .collect();
        assert_eq!(picks, vec!["zrgb", "zrgb", "jpeg"]);
    }

    #[test]
    fn ineligible_encoding_switches_immediately() {
        let sel = EncodingSelector::default();
        let reg = registry(vec![]);
        let mut state = ControllerState::default();
        let s = sel.select(&mut state, &job(), &policy(&["zrgb", "raw"]), &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");
        let s = sel.select(&mut state, &job(), &policy(&["raw"]), &bw(None, false), &reg);
        assert_eq!(s.encoding, "raw");
        assert_eq!(state.current_encoding(), Some("raw"));
    }

    #[test]
    fn persistent_backlog_prefers_non_video() {
        let sel = EncodingSelector::new(ControllerConfig {
            switch_hysteresis: 1,
            ..ControllerConfig::default()
        });
        let reg = registry(vec![FakeCodec::video("h264")]);
        let pol = policy(&["h264", "zrgb"]);
        let mut state = ControllerState::default();
        let busy = JobContext { backlog: 5, ..job() };

        let picks: Vec<String> = (0..4)
            .map(|_| sel.select(&mut state, &busy, &pol, &bw(None, false), &reg).encoding)
            .collect();
        assert_eq!(picks, vec!["h264", "h264", "zrgb", "zrgb"]);

        // Backlog cleared: video is preferred again.
        let s = sel.select(&mut state, &job(), &pol, &bw(None, false), &reg);
        assert_eq!(s.encoding, "h264");
    }

    #[test]
    fn video_needs_single_region_and_allow_list() {
        let sel = EncodingSelector::default();
        let reg = registry(vec![FakeCodec::video("h264")]);
        let pol = policy(&["h264", "zrgb"]);

        let multi = JobContext { region_count: 2, ..job() };
        let s = sel.select(&mut ControllerState::default(), &multi, &pol, &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");

        let restricted = EncodingPolicy {
            video_encoders: vec!["vp9".into()],
            ..pol.clone()
        };
        let s = sel.select(&mut ControllerState::default(), &job(), &restricted, &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");

        let tiny = JobContext { bounds: Rect::new(0, 0, 8, 8), ..job() };
        let s = sel.select(&mut ControllerState::default(), &tiny, &pol, &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");

        let huge = JobContext {
            window_width: 8000,
            window_height: 6000,
            bounds: Rect::new(0, 0, 8000, 6000),
            ..job()
        };
        let off = EncodingPolicy {
            video_scaling: VideoScaling::Off,
            ..pol.clone()
        };
        let s = sel.select(&mut ControllerState::default(), &huge, &off, &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");
        let s = sel.select(&mut ControllerState::default(), &huge, &pol, &bw(None, false), &reg);
        assert_eq!(s.encoding, "h264");
    }

    #[test]
    fn colourspace_needs_support_or_conversion() {
        let sel = EncodingSelector::default();
        let mut bgrx_only = FakeCodec::new("jpeg");
        bgrx_only.info.colorspaces = ColorspaceSet::BGRX;
        let reg = registry(vec![bgrx_only]);
        let pol = policy(&["jpeg", "zrgb"]);
        let rgb = JobContext { colorspace: Colorspace::Rgb, ..job() };

        let s = sel.select(&mut ControllerState::default(), &rgb, &pol, &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");

        let csc = EncodingPolicy {
            csc_modules: vec!["swscale".into()],
            ..pol
        };
        let s = sel.select(&mut ControllerState::default(), &rgb, &csc, &bw(None, false), &reg);
        assert_eq!(s.encoding, "jpeg");
    }

    #[test]
    fn static_full_window_uses_lossless() {
        let sel = EncodingSelector::default();
        let reg = registry(vec![FakeCodec::new("jpeg")]);
        let pol = policy(&["jpeg", "zrgb"]);
        let mut state = ControllerState::default();
        let solid = JobContext {
            full_window: true,
            content: ContentHint::Solid,
            bounds: Rect::new(0, 0, 800, 600),
            ..job()
        };
        let s = sel.select(&mut state, &solid, &pol, &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");
        assert_eq!(s.fallbacks, vec!["jpeg", "raw"]);

        let unchanged = JobContext { content: ContentHint::Unchanged, ..solid };
        let s = sel.select(&mut state, &unchanged, &pol, &bw(None, false), &reg);
        assert_eq!(s.encoding, "zrgb");
    }

    #[test]
    fn high_speed_prefers_cheapest_of_class() {
        let sel = EncodingSelector::default();
        let mut pricey = FakeCodec::new("webp");
        pricey.info.cost = 20;
        let mut cheap = FakeCodec::new("jpeg");
        cheap.info.cost = 2;
        let reg = registry(vec![pricey, cheap]);
        let pol = EncodingPolicy {
            speed: 90,
            ..policy(&["webp", "jpeg", "zrgb"])
        };
        let s = sel.select(&mut ControllerState::default(), &job(), &pol, &bw(None, false), &reg);
        assert_eq!(s.encoding, "jpeg");

        let slow = EncodingPolicy { speed: 40, ..pol };
        let s = sel.select(&mut ControllerState::default(), &job(), &slow, &bw(None, false), &reg);
        assert_eq!(s.encoding, "webp");
    }

    #[test]
    fn fallback_chain_ends_with_raw() {
        let sel = EncodingSelector::default();
        let reg = registry(vec![FakeCodec::new("jpeg")]);
        let s = sel.select(
            &mut ControllerState::default(),
            &job(),
            &policy(&["jpeg", "zrgb"]),
            &bw(None, false),
            &reg,
        );
        assert_eq!(s.chain().collect::<Vec<_>>(), vec!["jpeg", "zrgb", "raw"]);
    }

    #[test]
    fn nothing_usable_selects_raw() {
        let sel = EncodingSelector::default();
        let reg = CodecRegistry::minimal();
        let s = sel.select(
            &mut ControllerState::default(),
            &job(),
            &policy(&["h264", "vp9"]),
            &bw(None, false),
            &reg,
        );
        assert_eq!(s.encoding, "raw");
        assert!(s.fallbacks.is_empty());
    }
}
