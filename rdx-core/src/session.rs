//! Server session: one viewer, all of its windows, and the control loop.
//!
//! The session owns every piece of mutable pipeline state (aggregator,
//! controller memory, estimator, transport queues) and is the only task that
//! touches it. Encodes run on the [`EncodePool`]; their results come back as
//! [`EncodeOutcome`]s and are released per window in job order.
//!
//! Two ways to drive it:
//!
//! - step by step, with [`dispatch_ready`](ServerSession::dispatch_ready),
//!   [`on_encoded`](ServerSession::on_encoded),
//!   [`on_bytes`](ServerSession::on_bytes) and
//!   [`drain_to`](ServerSession::drain_to);
//! - [`run`](ServerSession::run) on a byte stream, which does the same
//!   inside a `tokio::select!` loop until the viewer goes away or the stop
//!   handle is cleared.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use crate::bandwidth::{BandwidthEstimator, BandwidthState, EstimatorConfig};
use crate::capture::{CaptureEvent, CaptureSource};
use crate::codec::RdxCodec;
use crate::codecs::{CodecFactory, CodecRegistry, FALLBACK_ENCODING};
use crate::damage::{AggregatorConfig, DamageAggregator, EncodingJob};
use crate::error::RdxError;
use crate::feedback::{FeedbackEffect, FeedbackLoop};
use crate::message::Channel;
use crate::packet::{Message, Packet};
use crate::policy::{EncodingPolicy, PolicyOverride};
use crate::protocol::{self, Inbound, WindowUpdate};
use crate::selector::{ContentHint, ControllerConfig, EncodingSelector, JobContext};
use crate::task::{EncodeOutcome, EncodePool, EncodeRequest};
use crate::transport::{Connection, ConnectionWriter, PacketTransport, TransportConfig};
use crate::types::Rect;
use crate::window::Window;

// ── SessionConfig ────────────────────────────────────────────────

/// Configuration for [`ServerSession`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub aggregator: AggregatorConfig,
    pub controller: ControllerConfig,
    pub estimator: EstimatorConfig,
    pub transport: TransportConfig,
    /// Encodes allowed to run at once.
    pub encode_workers: usize,
    /// Interval between latency probes.
    pub ping_interval: Duration,
    /// Interval between sweeps for stalled jobs and stale reassembly.
    pub housekeeping_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aggregator: AggregatorConfig::default(),
            controller: ControllerConfig::default(),
            estimator: EstimatorConfig::default(),
            transport: TransportConfig::default(),
            encode_workers: 4,
            ping_interval: Duration::from_secs(1),
            housekeeping_interval: Duration::from_millis(500),
        }
    }
}

// ── Public views ─────────────────────────────────────────────────

/// Sent on the session's broadcast channel when the effective policy of
/// the session or of one window changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyChange {
    Session,
    Window(u32),
}

/// What a window is currently encoded with, for presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectivePolicy {
    pub window_id: u32,
    /// Session policy with session and window overrides applied.
    pub policy: EncodingPolicy,
    pub current_encoding: Option<String>,
    pub last_quality: Option<u8>,
    pub bandwidth: BandwidthState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub jobs_dispatched: u64,
    pub updates_sent: u64,
    /// Encoded bytes across all sent updates.
    pub update_bytes: u64,
    /// Jobs that succeeded only after their first encoding failed.
    pub fallbacks: u64,
    pub superseded: u64,
    /// Jobs that produced nothing (capture or every encoding failed).
    pub dropped: u64,
    pub capture_failures: u64,
}

/// Encoded output waiting for its turn in a window's reorder buffer.
#[derive(Debug)]
struct QueuedUpdate {
    update: WindowUpdate,
    precompressed: bool,
}

// ── ServerSession ────────────────────────────────────────────────

pub struct ServerSession {
    config: SessionConfig,
    registry: CodecRegistry,
    policy: Arc<EncodingPolicy>,
    session_override: PolicyOverride,
    windows: BTreeMap<u32, Window<QueuedUpdate>>,
    next_generation: u64,
    aggregator: DamageAggregator,
    selector: EncodingSelector,
    estimator: BandwidthEstimator,
    feedback: FeedbackLoop,
    transport: PacketTransport,
    pool: EncodePool,
    results: Option<mpsc::Receiver<EncodeOutcome>>,
    changes: broadcast::Sender<PolicyChange>,
    stats: SessionStats,
    running: Arc<AtomicBool>,
}

impl ServerSession {
    /// Negotiate codecs and set up an idle session.
    ///
    /// Fails with [`RdxError::NoEncodingsAvailable`] only if even the raw
    /// fallback cannot be used.
    pub fn new(
        config: SessionConfig,
        mut registry: CodecRegistry,
        policy: EncodingPolicy,
    ) -> Result<Self, RdxError> {
        registry.negotiate();
        if let Err(e) = registry.fallback().probe() {
            warn!("'{FALLBACK_ENCODING}' encoding unusable: {e}");
            return Err(RdxError::NoEncodingsAvailable);
        }

        let policy = policy.normalized();
        if registry.effective_encodings(&policy).is_empty() {
            warn!(
                configured = ?policy.encodings,
                "no configured encoding is available, updates will use '{FALLBACK_ENCODING}'"
            );
        }

        let mut estimator = BandwidthEstimator::new(config.estimator.clone());
        if policy.bandwidth_limit.is_some() {
            estimator.set_ceiling(policy.bandwidth_limit);
        }
        let (pool, results) = EncodePool::new(config.encode_workers);
        let (changes, _) = broadcast::channel(64);

        Ok(Self {
            registry,
            policy: Arc::new(policy),
            session_override: PolicyOverride::default(),
            windows: BTreeMap::new(),
            next_generation: 1,
            aggregator: DamageAggregator::new(config.aggregator.clone()),
            selector: EncodingSelector::new(config.controller.clone()),
            estimator,
            feedback: FeedbackLoop::new(Instant::now()),
            transport: PacketTransport::new(config.transport.clone()),
            pool,
            results: Some(results),
            changes,
            stats: SessionStats::default(),
            running: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn bandwidth(&self) -> BandwidthState {
        self.estimator.estimate()
    }

    /// A cloneable handle that stops [`run`](Self::run) when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Windows & damage ─────────────────────────────────────────

    /// A new window; its first full-window update is scheduled immediately.
    pub fn window_created(&mut self, window_id: u32, width: u32, height: u32, now: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;
        if self.windows.contains_key(&window_id) {
            warn!(window_id, "window created twice, replacing");
        }
        self.windows.insert(
            window_id,
            Window::new(window_id, width, height).with_generation(generation),
        );
        self.aggregator.window_created(window_id, width, height, now);
        info!(window_id, width, height, "window created");
    }

    pub fn window_resized(&mut self, window_id: u32, width: u32, height: u32, now: Instant) -> Result<(), RdxError> {
        let window = self
            .windows
            .get_mut(&window_id)
            .ok_or(RdxError::UnknownWindow(window_id))?;
        window.resize(width, height);
        self.aggregator.window_resized(window_id, width, height, now)?;
        debug!(window_id, width, height, "window resized");
        Ok(())
    }

    /// Forget a window. Encodes still running for it are discarded when they
    /// finish.
    pub fn window_closed(&mut self, window_id: u32) {
        let in_flight = self.aggregator.window_closed(window_id);
        if self.windows.remove(&window_id).is_some() {
            info!(window_id, in_flight = in_flight.len(), "window closed");
        }
    }

    pub fn report_damage(&mut self, window_id: u32, rect: Rect, now: Instant) -> Result<(), RdxError> {
        self.aggregator.notify(window_id, rect, now)?;
        Ok(())
    }

    /// Dispatch a window's pending damage on the next pass, without waiting
    /// for the batch delay.
    pub fn flush(&mut self, window_id: u32) {
        self.aggregator.request_flush(window_id);
    }

    pub fn flush_all(&mut self) {
        self.aggregator.flush_all();
    }

    /// Apply a notice from the capture side.
    pub fn on_capture_event(&mut self, event: CaptureEvent, now: Instant) {
        let result = match event {
            CaptureEvent::WindowCreated { window_id, width, height } => {
                self.window_created(window_id, width, height, now);
                Ok(())
            }
            CaptureEvent::WindowResized { window_id, width, height } => {
                self.window_resized(window_id, width, height, now)
            }
            CaptureEvent::WindowClosed { window_id } => {
                self.window_closed(window_id);
                Ok(())
            }
            CaptureEvent::Damage { window_id, rect } => self.report_damage(window_id, rect, now),
        };
        if let Err(e) = result {
            warn!("capture event {event:?} ignored: {e}");
        }
    }

    // ── Policy ───────────────────────────────────────────────────

    /// Replace the session policy. Jobs already dispatched keep the policy
    /// they were selected with.
    pub fn set_policy(&mut self, policy: EncodingPolicy) {
        let policy = policy.normalized();
        self.estimator
            .set_ceiling(policy.bandwidth_limit.or(self.config.estimator.ceiling));
        self.policy = Arc::new(policy);
        self.notify(PolicyChange::Session);
    }

    pub fn policy(&self) -> Arc<EncodingPolicy> {
        Arc::clone(&self.policy)
    }

    /// Server-side override for one window, merged over any existing one.
    pub fn set_window_override(&mut self, window_id: u32, values: &PolicyOverride) -> Result<(), RdxError> {
        let window = self
            .windows
            .get_mut(&window_id)
            .ok_or(RdxError::UnknownWindow(window_id))?;
        window
            .policy_override
            .get_or_insert_with(PolicyOverride::default)
            .merge(values);
        self.notify(PolicyChange::Window(window_id));
        Ok(())
    }

    pub fn get_effective_policy(&self, window_id: u32) -> Result<EffectivePolicy, RdxError> {
        let window = self
            .windows
            .get(&window_id)
            .ok_or(RdxError::UnknownWindow(window_id))?;
        Ok(EffectivePolicy {
            window_id,
            policy: self.effective_policy(window_id),
            current_encoding: window.controller.current_encoding().map(str::to_string),
            last_quality: window.controller.last_quality(),
            bandwidth: self.estimator.estimate(),
        })
    }

    /// Policy change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.changes.subscribe()
    }

    fn effective_policy(&self, window_id: u32) -> EncodingPolicy {
        let mut policy = self.policy.with_override(&self.session_override);
        if let Some(ov) = self.windows.get(&window_id).and_then(|w| w.policy_override.as_ref()) {
            policy = policy.with_override(ov);
        }
        policy
    }

    fn notify(&self, change: PolicyChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Capture, select and submit every job whose batch is ready.
    /// Returns the number of jobs taken from the aggregator.
    pub async fn dispatch_ready(&mut self, capture: &dyn CaptureSource, now: Instant) -> Result<usize, RdxError> {
        let jobs = self.aggregator.collect_ready(now, self.estimator.smoothed_rtt());
        let count = jobs.len();
        for job in jobs {
            let window_id = job.window_id;
            self.dispatch(job, capture).await;
            self.release_ready(window_id)?;
        }
        Ok(count)
    }

    async fn dispatch(&mut self, job: EncodingJob, capture: &dyn CaptureSource) {
        let window_id = job.window_id;
        let job_id = job.job_id;

        let mut snapshots = Vec::with_capacity(job.regions.len());
        for rect in &job.regions {
            match capture.get_window_pixels(window_id, *rect).await {
                Ok(snap) if snap.is_well_formed() => snapshots.push(snap),
                Ok(_) => {
                    warn!(window_id, ?rect, "malformed capture, region dropped");
                    self.stats.capture_failures += 1;
                }
                Err(e) => {
                    warn!(window_id, ?rect, "region dropped: {e}");
                    self.stats.capture_failures += 1;
                }
            }
        }

        let policy = self.effective_policy(window_id);
        let bandwidth = self.estimator.estimate();
        let in_flight = self.aggregator.in_flight(window_id);
        let Some(window) = self.windows.get_mut(&window_id) else {
            self.aggregator.job_finished(window_id, job_id);
            return;
        };

        for superseded in &job.supersedes {
            window.reorder().skip(*superseded);
            trace!(window_id, job_id = superseded, "superseded by full-window job");
        }
        self.stats.superseded += job.supersedes.len() as u64;

        let Some(first) = snapshots.first() else {
            window.reorder().skip(job_id);
            self.aggregator.job_finished(window_id, job_id);
            self.stats.dropped += 1;
            return;
        };
        let colorspace = first.colorspace;
        let bounds = snapshots
            .iter()
            .skip(1)
            .fold(first.rect, |acc, s| acc.union(&s.rect));

        let content = match snapshots.as_slice() {
            [snap] if job.full_window => {
                if window.observe_full_hash(snap.content_hash()) {
                    ContentHint::Unchanged
                } else if snap.is_solid() {
                    ContentHint::Solid
                } else {
                    ContentHint::Normal
                }
            }
            _ => ContentHint::Normal,
        };

        let (window_width, window_height) = window.size();
        let context = JobContext {
            window_width,
            window_height,
            bounds,
            region_count: snapshots.len(),
            full_window: job.full_window,
            colorspace,
            backlog: in_flight.saturating_sub(1) + window.unacked(),
            content,
        };
        let selection = self.selector.select(
            &mut window.controller,
            &context,
            &policy,
            &bandwidth,
            &self.registry,
        );
        window.switch_encoding(&selection.encoding);

        let chain: Vec<Arc<dyn CodecFactory>> = selection
            .chain()
            .filter_map(|name| self.registry.get(name))
            .collect();
        let input_size = (bounds.width, bounds.height);
        let primary = match chain.first() {
            Some(factory) => {
                let info = factory.info();
                let (w, h) = if info.video {
                    info.video_output_size(bounds.width, bounds.height, policy.video_scaling)
                        .unwrap_or(input_size)
                } else {
                    input_size
                };
                match window.checkout_codec(factory.as_ref(), w, h, job_id) {
                    Ok(instance) => Some(instance),
                    Err(e) => {
                        warn!(window_id, job_id, "{e}");
                        None
                    }
                }
            }
            None => None,
        };

        debug!(
            window_id,
            job_id,
            encoding = %selection.encoding,
            quality = selection.quality,
            speed = selection.speed,
            backlog = context.backlog,
            "job dispatched"
        );
        let generation = window.generation();
        self.pool.submit(EncodeRequest {
            job,
            generation,
            selection,
            snapshots,
            chain,
            primary,
            input_size,
        });
        self.stats.jobs_dispatched += 1;
    }

    /// Next finished encode, for callers driving the session by hand.
    pub async fn next_outcome(&mut self) -> Option<EncodeOutcome> {
        match self.results.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Fold a finished encode back into its window and queue whatever is now
    /// releasable in job order.
    pub fn on_encoded(&mut self, outcome: EncodeOutcome) -> Result<(), RdxError> {
        let EncodeOutcome {
            window_id,
            generation,
            job_id,
            result,
            returned,
            elapsed,
        } = outcome;

        let Some(window) = self.windows.get_mut(&window_id) else {
            trace!(window_id, job_id, "result for closed window dropped");
            return Ok(());
        };
        if window.generation() != generation {
            trace!(window_id, job_id, "result for replaced window dropped");
            return Ok(());
        }
        self.aggregator.job_finished(window_id, job_id);
        if let Some((encoding, instance)) = returned {
            window.checkin_codec(&encoding, job_id, instance);
        }

        match result {
            Ok(encoded) => {
                if !encoded.failed.is_empty() {
                    self.stats.fallbacks += 1;
                    // The failed choice should not stick.
                    window.controller.reset_encoding();
                }
                let (window_width, window_height) = window.size();
                let update = WindowUpdate {
                    window_id,
                    job_id,
                    damage_seq: encoded.damage_seq,
                    encoding: encoded.encoding,
                    quality: encoded.quality,
                    speed: encoded.speed,
                    full_window: encoded.full_window,
                    window_width,
                    window_height,
                    colorspace: encoded.colorspace,
                    rects: encoded.rects,
                };
                trace!(window_id, job_id, ?elapsed, bytes = update.data_len(), "encoded");
                let queued = QueuedUpdate {
                    update,
                    precompressed: encoded.precompressed,
                };
                if !window.reorder().complete(job_id, queued) {
                    trace!(window_id, job_id, "output of superseded job discarded");
                }
            }
            Err(e) => {
                warn!(window_id, job_id, "encode job dropped: {e}");
                window.reorder().skip(job_id);
                self.stats.dropped += 1;
            }
        }
        self.release_ready(window_id)
    }

    fn release_ready(&mut self, window_id: u32) -> Result<(), RdxError> {
        let Some(window) = self.windows.get_mut(&window_id) else {
            return Ok(());
        };
        for mut queued in window.reorder().drain_ready() {
            // A re-queued stalled region may carry an older sequence number
            // than what the viewer has already seen.
            let seq = queued.update.damage_seq.max(window.last_sent_seq());
            queued.update.damage_seq = seq;
            let bytes = queued.update.data_len() as u64;
            match protocol::queue(&mut self.transport, &queued.update, queued.precompressed) {
                Ok(message_id) => {
                    window.record_sent(seq);
                    self.stats.updates_sent += 1;
                    self.stats.update_bytes += bytes;
                    trace!(window_id, job_id = queued.update.job_id, message_id, damage_seq = seq, "update queued");
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(window_id, job_id = queued.update.job_id, "update not sent: {e}"),
            }
        }
        Ok(())
    }

    // ── Inbound ──────────────────────────────────────────────────

    /// Apply one reassembled message from the viewer.
    pub fn on_message(&mut self, message: Message, now: Instant) -> Result<(), RdxError> {
        let inbound = match Inbound::decode(message.message_type, &message.payload) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(message_id = message.message_id, "undecodable {:?}: {e}", message.message_type);
                return Ok(());
            }
        };
        match self.feedback.apply(inbound, &mut self.estimator, &mut self.windows, now) {
            FeedbackEffect::None => {}
            FeedbackEffect::Reply(pong) => {
                protocol::queue(&mut self.transport, &pong, false)?;
            }
            FeedbackEffect::Flush => self.aggregator.flush_all(),
            FeedbackEffect::Override { window_id: Some(id), .. } => {
                self.notify(PolicyChange::Window(id));
            }
            FeedbackEffect::Override { window_id: None, values } => {
                self.session_override.merge(&values);
                self.notify(PolicyChange::Session);
            }
        }
        Ok(())
    }

    /// Feed one received packet. Only fatal transport errors are returned.
    pub fn on_packet(&mut self, packet: Packet, now: Instant) -> Result<(), RdxError> {
        if let Some(message) = self.transport.on_packet(packet, now)? {
            self.on_message(message, now)?;
        }
        Ok(())
    }

    /// Feed raw bytes from the viewer.
    pub fn on_bytes(&mut self, raw: &[u8], now: Instant) -> Result<(), RdxError> {
        for message in self.transport.on_bytes(raw, now)? {
            self.on_message(message, now)?;
        }
        Ok(())
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Queue a latency probe.
    pub fn send_ping(&mut self, now: Instant) -> Result<(), RdxError> {
        let ping = self.feedback.make_ping(now);
        protocol::queue(&mut self.transport, &ping, false)?;
        Ok(())
    }

    pub fn has_outgoing(&self) -> bool {
        self.transport.has_outgoing()
    }

    /// Next packet for the wire, in multiplexer order.
    pub fn poll_packet(&mut self, now: Instant) -> Option<Packet> {
        let packet = self.transport.poll_packet(now);
        self.note_sent();
        packet
    }

    /// Encode every queued packet into `dst`.
    pub fn drain_to(&mut self, dst: &mut BytesMut, now: Instant) -> Result<usize, RdxError> {
        let n = self.transport.drain_to(dst, now)?;
        self.note_sent();
        Ok(n)
    }

    fn note_sent(&mut self) {
        for sent in self.transport.take_sent() {
            if sent.channel == Channel::WindowUpdate {
                self.estimator.on_send(sent.message_id, sent.wire_bytes as u64, sent.sent_at);
            }
        }
    }

    /// Hand packets to the writer until it is full or nothing is queued.
    async fn pump(&mut self, writer: &ConnectionWriter) -> Result<(), RdxError> {
        while self.transport.has_outgoing() && writer.capacity() > 0 {
            let Some(packet) = self.poll_packet(Instant::now()) else {
                break;
            };
            match writer.try_send(packet) {
                Ok(()) => {}
                Err(Some(packet)) => writer.send(packet).await?,
                Err(None) => return Err(RdxError::TransportDisconnected),
            }
        }
        Ok(())
    }

    // ── Housekeeping ─────────────────────────────────────────────

    /// Reclaim stalled encode slots and incomplete inbound messages.
    pub fn expire(&mut self, now: Instant) {
        for (window_id, job_id) in self.aggregator.expire_in_flight(now) {
            if let Some(window) = self.windows.get_mut(&window_id) {
                window.reorder().skip(job_id);
            }
            // Skipping may unblock later jobs; queue errors surface on the
            // next release.
            if let Err(e) = self.release_ready(window_id) {
                warn!(window_id, "{e}");
            }
        }
        for e in self.transport.expire(now) {
            debug!("{e}");
        }
    }

    // ── Driver ───────────────────────────────────────────────────

    /// Serve one viewer over `stream` until it disconnects, a fatal error
    /// occurs, or the stop handle is cleared.
    ///
    /// ```no_run
    /// # use std::sync::Arc;
    /// # use rdx_core::capture::{CaptureEvent, MemoryCapture};
    /// # use rdx_core::session::ServerSession;
    /// # async fn example(mut session: ServerSession, stream: tokio::net::TcpStream) {
    /// let (_events_tx, events) = tokio::sync::mpsc::channel::<CaptureEvent>(64);
    /// let handle = session.stop_handle();
    /// let capture = Arc::new(MemoryCapture::new());
    /// tokio::spawn(async move { session.run(stream, capture, events).await });
    /// // … later …
    /// handle.store(false, std::sync::atomic::Ordering::SeqCst);
    /// # }
    /// ```
    pub async fn run<S>(
        &mut self,
        stream: S,
        capture: Arc<dyn CaptureSource>,
        mut events: mpsc::Receiver<CaptureEvent>,
    ) -> Result<(), RdxError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut results = self
            .results
            .take()
            .ok_or_else(|| RdxError::Other("session is already running".into()))?;
        let codec = RdxCodec::new(self.transport.config().max_packet_size);
        let (mut reader, writer) = Connection::spawn(stream, codec);

        self.running.store(true, Ordering::SeqCst);
        let ping_interval = self.config.ping_interval;
        let housekeeping_interval = self.config.housekeeping_interval;
        let mut next_ping = Instant::now();
        let mut next_housekeeping = Instant::now() + housekeeping_interval;
        let mut events_open = true;
        info!("session started");

        let outcome = loop {
            if !self.running.load(Ordering::SeqCst) {
                break Ok(());
            }
            let mut wake = next_ping.min(next_housekeeping);
            if let Some(deadline) = self.aggregator.next_deadline(self.estimator.smoothed_rtt()) {
                wake = wake.min(deadline);
            }
            let blocked = self.transport.has_outgoing();

            let step = tokio::select! {
                packet = reader.recv() => match packet {
                    Ok(packet) => self.on_packet(packet, Instant::now()),
                    Err(e) => Err(e),
                },
                Some(outcome) = results.recv() => self.on_encoded(outcome),
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => self.on_capture_event(event, Instant::now()),
                        None => {
                            debug!("capture event stream ended");
                            events_open = false;
                        }
                    }
                    Ok(())
                }
                ready = writer.ready(), if blocked => ready,
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => Ok(()),
            };
            if let Err(e) = step {
                break Err(e);
            }

            let now = Instant::now();
            if now >= next_ping {
                if let Err(e) = self.send_ping(now) {
                    break Err(e);
                }
                next_ping = now + ping_interval;
            }
            if now >= next_housekeeping {
                self.expire(now);
                next_housekeeping = now + housekeeping_interval;
            }
            if let Err(e) = self.dispatch_ready(capture.as_ref(), now).await {
                break Err(e);
            }
            if let Err(e) = self.pump(&writer).await {
                break Err(e);
            }
        };

        self.running.store(false, Ordering::SeqCst);
        self.results = Some(results);
        writer.shutdown().await;
        match &outcome {
            Ok(()) => info!("session stopped"),
            Err(RdxError::TransportDisconnected) => info!("viewer disconnected"),
            Err(e) => warn!("session ended: {e}"),
        }
        outcome
    }
}

// ── Tests ────────────────────────────────────────────────────────
