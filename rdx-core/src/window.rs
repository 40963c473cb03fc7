//! Per-window session state.
//!
//! A [`Window`] is owned exclusively by its server session. Besides its size
//! and client overrides it holds:
//!
//! - the controller memory used by the selector;
//! - the active stateful codec instance, if any;
//! - the last full-window content hash (static-content detection);
//! - the reorder buffer that puts encoded output back into job order;
//! - the damage sequence numbers sent and acknowledged.

use std::collections::{BTreeMap, VecDeque};

use tracing::debug;

use crate::codecs::{CodecFactory, CodecInstance};
use crate::error::RdxError;
use crate::policy::PolicyOverride;
use crate::selector::ControllerState;

// ── ReorderBuffer ────────────────────────────────────────────────

/// Releases items strictly in id order, starting at `first`.
///
/// Every id must eventually be either completed or skipped.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u64,
    slots: BTreeMap<u64, Option<T>>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(first: u64) -> Self {
        Self {
            next: first,
            slots: BTreeMap::new(),
        }
    }

    /// Store the output of `id`. Returns `false` if `id` was already
    /// released or skipped.
    pub fn complete(&mut self, id: u64, item: T) -> bool {
        if id < self.next || self.slots.contains_key(&id) {
            return false;
        }
        self.slots.insert(id, Some(item));
        true
    }

    /// Mark `id` as producing nothing.
    pub fn skip(&mut self, id: u64) {
        if id >= self.next {
            self.slots.insert(id, None);
        }
    }

    /// Items now releasable, in order.
    pub fn drain_ready(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(slot) = self.slots.remove(&self.next) {
            out.extend(slot);
            self.next += 1;
        }
        out
    }

    /// Next id to be released.
    pub fn next_expected(&self) -> u64 {
        self.next
    }

    /// Completed or skipped ids still waiting on an earlier one.
    pub fn waiting(&self) -> usize {
        self.slots.len()
    }
}

// ── Active codec ─────────────────────────────────────────────────

struct ActiveCodec {
    encoding: String,
    width: u32,
    height: u32,
    /// `None` while lent to an encode worker.
    instance: Option<Box<dyn CodecInstance>>,
    last_job: u64,
}

// ── Window ───────────────────────────────────────────────────────

pub struct Window<T> {
    id: u32,
    generation: u64,
    width: u32,
    height: u32,
    pub policy_override: Option<PolicyOverride>,
    pub controller: ControllerState,
    active: Option<ActiveCodec>,
    last_full_hash: Option<blake3::Hash>,
    reorder: ReorderBuffer<T>,
    /// Damage sequence numbers of updates sent but not yet acknowledged.
    unacked: VecDeque<u64>,
    last_sent_seq: u64,
    acked_seq: u64,
}

impl<T> Window<T> {
    pub fn new(id: u32, width: u32, height: u32) -> Self {
        Self {
            id,
            generation: 0,
            width,
            height,
            policy_override: None,
            controller: ControllerState::default(),
            active: None,
            last_full_hash: None,
            reorder: ReorderBuffer::new(1),
            unacked: VecDeque::new(),
            last_sent_seq: 0,
            acked_seq: 0,
        }
    }

    /// Tag this window instance, so outputs for an earlier window with the
    /// same id can be told apart.
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// New size: the stateful codec and content hash no longer apply.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.release_codec();
        self.last_full_hash = None;
    }

    // ── Codec ownership ──────────────────────────────────────────

    /// Encoding of the held stateful instance.
    pub fn active_encoding(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.encoding.as_str())
    }

    /// Drop the stateful instance.
    pub fn release_codec(&mut self) {
        if let Some(a) = self.active.take() {
            debug!(window_id = self.id, encoding = %a.encoding, "releasing codec instance");
        }
    }

    /// Release the stateful instance if the window moved to another
    /// encoding.
    pub fn switch_encoding(&mut self, encoding: &str) {
        if self.active.as_ref().is_some_and(|a| a.encoding != encoding) {
            self.release_codec();
        }
    }

    /// Instance for encoding job `job_id` at `width × height`.
    ///
    /// Stateless codecs get a fresh instance every time. A stateful codec's
    /// instance is lent out and must come back through
    /// [`checkin_codec`](Self::checkin_codec); if it is already lent, a
    /// fresh one is created and the newer job's instance is kept.
    pub fn checkout_codec(
        &mut self,
        factory: &dyn CodecFactory,
        width: u32,
        height: u32,
        job_id: u64,
    ) -> Result<Box<dyn CodecInstance>, RdxError> {
        let info = factory.info();
        if !info.stateful {
            return factory.create(width, height);
        }
        if let Some(a) = self.active.as_mut() {
            if a.encoding == info.name && (a.width, a.height) == (width, height) {
                a.last_job = a.last_job.max(job_id);
                return match a.instance.take() {
                    Some(inst) => Ok(inst),
                    None => factory.create(width, height),
                };
            }
        }
        // Release before creating the replacement.
        self.release_codec();
        let inst = factory.create(width, height)?;
        self.active = Some(ActiveCodec {
            encoding: info.name.clone(),
            width,
            height,
            instance: None,
            last_job: job_id,
        });
        Ok(inst)
    }

    /// Return a lent stateful instance after its encode finished.
    pub fn checkin_codec(&mut self, encoding: &str, job_id: u64, instance: Box<dyn CodecInstance>) {
        if let Some(a) = self.active.as_mut() {
            if a.encoding == encoding
                && instance.dimensions() == (a.width, a.height)
                && job_id >= a.last_job
            {
                a.instance = Some(instance);
            }
        }
    }

    // ── Static content ───────────────────────────────────────────

    /// Record a full-window content hash; `true` if it matches the previous.
    pub fn observe_full_hash(&mut self, hash: blake3::Hash) -> bool {
        let unchanged = self.last_full_hash == Some(hash);
        self.last_full_hash = Some(hash);
        unchanged
    }

    // ── Ordering ─────────────────────────────────────────────────

    pub fn reorder(&mut self) -> &mut ReorderBuffer<T> {
        &mut self.reorder
    }

    // ── Sequence tracking ────────────────────────────────────────

    /// An update covering up to `damage_seq` was queued for the viewer.
    pub fn record_sent(&mut self, damage_seq: u64) {
        self.last_sent_seq = self.last_sent_seq.max(damage_seq);
        self.unacked.push_back(damage_seq);
    }

    /// The viewer applied everything up to `damage_seq`.
    pub fn on_damage_ack(&mut self, damage_seq: u64) {
        self.acked_seq = self.acked_seq.max(damage_seq);
        while self.unacked.front().is_some_and(|&s| s <= self.acked_seq) {
            self.unacked.pop_front();
        }
    }

    pub fn unacked(&self) -> usize {
        self.unacked.len()
    }

    pub fn last_sent_seq(&self) -> u64 {
        self.last_sent_seq
    }

    pub fn acked_seq(&self) -> u64 {
        self.acked_seq
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::tests::FakeCodec;
    use std::sync::atomic::Ordering;

    #[test]
    fn reorder_releases_in_id_order() {
        let mut buf = ReorderBuffer::new(1);
        assert!(buf.complete(3, "c"));
        assert!(buf.complete(2, "b"));
        assert!(buf.drain_ready().is_empty());
        assert!(buf.complete(1, "a"));
        assert_eq!(buf.drain_ready(), vec!["a", "b", "c"]);
        assert_eq!(buf.next_expected(), 4);
        assert!(!buf.complete(2, "late"));
    }

    #[test]
    fn skipped_ids_do_not_block() {
        let mut buf = ReorderBuffer::new(1);
        buf.complete(2, 20);
        buf.skip(1);
        buf.complete(4, 40);
        assert_eq!(buf.drain_ready(), vec![20]);
        assert_eq!(buf.waiting(), 1);
        buf.skip(3);
        assert_eq!(buf.drain_ready(), vec![40]);
        // Output of a skipped job that shows up later is ignored.
        assert!(!buf.complete(3, 30));
    }

    #[test]
    fn stateful_instance_is_reused_and_released_on_switch() {
        let video = FakeCodec::video("h264");
        let created = video.created.clone();
        let mut w: Window<()> = Window::new(1, 640, 480);

        let inst = w.checkout_codec(&video, 640, 480, 1).unwrap();
        w.checkin_codec("h264", 1, inst);
        let inst = w.checkout_codec(&video, 640, 480, 2).unwrap();
        w.checkin_codec("h264", 2, inst);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(w.active_encoding(), Some("h264"));

        w.switch_encoding("zrgb");
        assert_eq!(w.active_encoding(), None);
    }

    #[test]
    fn resize_recreates_stateful_instance() {
        let video = FakeCodec::video("h264");
        let created = video.created.clone();
        let mut w: Window<()> = Window::new(1, 640, 480);
        let inst = w.checkout_codec(&video, 640, 480, 1).unwrap();
        w.checkin_codec("h264", 1, inst);

        w.resize(800, 600);
        assert_eq!(w.active_encoding(), None);
        let inst = w.checkout_codec(&video, 800, 600, 2).unwrap();
        assert_eq!(inst.dimensions(), (800, 600));
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_checkout_keeps_newest_instance() {
        let video = FakeCodec::video("h264");
        let created = video.created.clone();
        let mut w: Window<()> = Window::new(1, 640, 480);
        let a = w.checkout_codec(&video, 640, 480, 1).unwrap();
        let b = w.checkout_codec(&video, 640, 480, 2).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);

        w.checkin_codec("h264", 2, b);
        w.checkin_codec("h264", 1, a);
        let _c = w.checkout_codec(&video, 640, 480, 3).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stateless_codecs_are_never_held() {
        let jpeg = FakeCodec::new("jpeg");
        let mut w: Window<()> = Window::new(1, 640, 480);
        let _ = w.checkout_codec(&jpeg, 10, 10, 1).unwrap();
        assert_eq!(w.active_encoding(), None);
    }

    #[test]
    fn damage_acks_drain_backlog() {
        let mut w: Window<()> = Window::new(1, 10, 10);
        w.record_sent(3);
        w.record_sent(7);
        w.record_sent(9);
        assert_eq!(w.unacked(), 3);
        w.on_damage_ack(7);
        assert_eq!(w.unacked(), 1);
        assert_eq!(w.acked_seq(), 7);
        assert_eq!(w.last_sent_seq(), 9);
    }

    #[test]
    fn unchanged_full_window_content_is_detected() {
        let mut w: Window<()> = Window::new(1, 10, 10);
        let h = blake3::hash(b"frame");
        assert!(!w.observe_full_hash(h));
        assert!(w.observe_full_hash(h));
        w.resize(20, 20);
        assert!(!w.observe_full_hash(h));
    }
}
