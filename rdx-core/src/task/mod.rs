//! Bounded encode worker pool.
//!
//! Encodes are CPU bound, so each request runs on `spawn_blocking`; a
//! semaphore caps how many run at once. Results come back on an mpsc channel
//! to the session task, which alone mutates window and controller state.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Semaphore, mpsc};
use tracing::{trace, warn};

use crate::codecs::{CodecFactory, CodecInstance};
use crate::damage::EncodingJob;
use crate::error::RdxError;
use crate::protocol::EncodedRect;
use crate::selector::Selection;
use crate::types::{Colorspace, Snapshot};

/// Results buffered between workers and the session task.
const RESULT_DEPTH: usize = 256;

// ── Request / outcome ────────────────────────────────────────────

/// A job with its selection and captured pixels, ready to encode.
pub struct EncodeRequest {
    pub job: EncodingJob,
    /// Identifies the window instance, so a reused window id is not
    /// confused with a closed one.
    pub generation: u64,
    pub selection: Selection,
    /// One snapshot per region that was captured successfully.
    pub snapshots: Vec<Snapshot>,
    /// Codecs to try in order: the selected encoding then its fallbacks.
    pub chain: Vec<Arc<dyn CodecFactory>>,
    /// Instance lent by the window for the first codec of the chain.
    pub primary: Option<Box<dyn CodecInstance>>,
    /// Input size for codec instances created by the worker.
    pub input_size: (u32, u32),
}

/// Encoded output of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedJob {
    pub damage_seq: u64,
    pub full_window: bool,
    /// Pixel layout of the encoded data.
    pub colorspace: Colorspace,
    /// Encoding actually used.
    pub encoding: String,
    pub quality: u8,
    pub speed: u8,
    pub rects: Vec<EncodedRect>,
    pub precompressed: bool,
    /// Encodings that failed before `encoding` succeeded.
    pub failed: Vec<String>,
}

pub struct EncodeOutcome {
    pub window_id: u32,
    pub generation: u64,
    pub job_id: u64,
    pub result: Result<EncodedJob, RdxError>,
    /// The lent instance, to be checked back in to the window.
    pub returned: Option<(String, Box<dyn CodecInstance>)>,
    pub elapsed: Duration,
}

// ── Encoding ─────────────────────────────────────────────────────

/// Run one request synchronously, falling back along the chain on failure.
pub fn encode_job(mut req: EncodeRequest) -> EncodeOutcome {
    let started = Instant::now();
    let window_id = req.job.window_id;
    let generation = req.generation;
    let job_id = req.job.job_id;
    let quality = req.selection.quality;
    let speed = req.selection.speed;
    let (w, h) = req.input_size;
    let native = req
        .snapshots
        .first()
        .map_or(Colorspace::Bgrx, |s| s.colorspace);

    let mut returned = None;
    let mut failed = Vec::new();
    let mut last_err = RdxError::NoEncodingsAvailable;
    let mut result = None;

    for (i, factory) in req.chain.iter().enumerate() {
        let info = factory.info();
        let lent = if i == 0 { req.primary.take() } else { None };
        let Some(colorspace) = info.colorspaces.conversion_target(native) else {
            warn!(window_id, job_id, "{} accepts no colourspace", info.name);
            if let Some(inst) = lent {
                returned = Some((info.name.clone(), inst));
            }
            failed.push(info.name.clone());
            last_err = RdxError::encode_failure(&info.name, format!("cannot take {native:?} input"));
            continue;
        };
        let was_lent = lent.is_some();
        let mut instance = match lent {
            Some(inst) => inst,
            None => match factory.create(w, h) {
                Ok(inst) => inst,
                Err(e) => {
                    warn!(window_id, job_id, "cannot create {} encoder: {e}", info.name);
                    failed.push(info.name.clone());
                    last_err = e;
                    continue;
                }
            },
        };

        let mut rects = Vec::with_capacity(req.snapshots.len());
        let mut error = None;
        for snap in &req.snapshots {
            let converted;
            let input = if snap.colorspace == colorspace {
                snap
            } else if snap.is_well_formed() {
                trace!(window_id, job_id, from = ?snap.colorspace, to = ?colorspace, "converting");
                converted = snap.convert(colorspace);
                &converted
            } else {
                error = Some(RdxError::encode_failure(&info.name, "malformed capture"));
                break;
            };
            match instance.encode(input, quality, speed) {
                Ok(data) => rects.push(EncodedRect { rect: snap.rect, data }),
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        if was_lent {
            returned = Some((info.name.clone(), instance));
        }

        match error {
            None => {
                result = Some(EncodedJob {
                    damage_seq: req.job.damage_seq,
                    full_window: req.job.full_window,
                    colorspace,
                    encoding: info.name.clone(),
                    quality,
                    speed,
                    rects,
                    precompressed: info.precompressed,
                    failed: std::mem::take(&mut failed),
                });
                break;
            }
            Some(e) => {
                warn!(window_id, job_id, "{e}, trying next encoding");
                failed.push(info.name.clone());
                last_err = e;
            }
        }
    }

    let elapsed = started.elapsed();
    trace!(window_id, job_id, ?elapsed, "encode finished");
    EncodeOutcome {
        window_id,
        generation,
        job_id,
        result: result.ok_or(last_err),
        returned,
        elapsed,
    }
}

// ── EncodePool ───────────────────────────────────────────────────

pub struct EncodePool {
    permits: Arc<Semaphore>,
    results_tx: mpsc::Sender<EncodeOutcome>,
    active: Arc<AtomicUsize>,
}

impl EncodePool {
    /// Pool running at most `workers` encodes at once, and the receiver its
    /// results arrive on.
    pub fn new(workers: usize) -> (Self, mpsc::Receiver<EncodeOutcome>) {
        let (results_tx, results_rx) = mpsc::channel(RESULT_DEPTH);
        (
            Self {
                permits: Arc::new(Semaphore::new(workers.max(1))),
                results_tx,
                active: Arc::new(AtomicUsize::new(0)),
            },
            results_rx,
        )
    }

    /// Queue a request. Must be called from within a tokio runtime.
    pub fn submit(&self, req: EncodeRequest) {
        let permits = Arc::clone(&self.permits);
        let tx = self.results_tx.clone();
        let active = Arc::clone(&self.active);
        let (window_id, generation, job_id) = (req.job.window_id, req.generation, req.job.job_id);
        active.fetch_add(1, Ordering::SeqCst);

        tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(permit) => {
                    let joined = tokio::task::spawn_blocking(move || encode_job(req)).await;
                    drop(permit);
                    joined.unwrap_or_else(|e| EncodeOutcome {
                        window_id,
                        generation,
                        job_id,
                        result: Err(RdxError::encode_failure("worker", e.to_string())),
                        returned: None,
                        elapsed: Duration::ZERO,
                    })
                }
                Err(_) => EncodeOutcome {
                    window_id,
                    generation,
                    job_id,
                    result: Err(RdxError::ChannelClosed),
                    returned: None,
                    elapsed: Duration::ZERO,
                },
            };
            active.fetch_sub(1, Ordering::SeqCst);
            if tx.send(outcome).await.is_err() {
                trace!(window_id, job_id, "session gone, dropping encode result");
            }
        });
    }

    /// Requests submitted and not yet delivered.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codecs::tests::FakeCodec;
    use crate::codecs::{RawCodec, ZrgbCodec};
    use crate::types::{ColorspaceSet, Rect};
    use bytes::Bytes;

    fn arc(codec: impl CodecFactory + 'static) -> Arc<dyn CodecFactory> {
        Arc::new(codec)
    }

    fn request(chain: Vec<Arc<dyn CodecFactory>>, job_id: u64) -> EncodeRequest {
        let rect = Rect::new(0, 0, 4, 4);
        let snap = Snapshot::packed(rect, Colorspace::Bgrx, Bytes::from(vec![7u8; 64]));
        let encoding = chain[0].info().name.clone();
        EncodeRequest {
            job: EncodingJob {
                window_id: 1,
                job_id,
                regions: vec![rect],
                full_window: false,
                damage_seq: job_id,
                created_at: Instant::now(),
                supersedes: Vec::new(),
            },
            generation: 1,
            selection: Selection {
                encoding,
                quality: 80,
                speed: 50,
                fallbacks: Vec::new(),
            },
            snapshots: vec![snap],
            chain,
            primary: None,
            input_size: (4, 4),
        }
    }

    #[test]
    fn encode_failure_falls_back_within_the_job() {
        let mut broken = FakeCodec::new("jpeg");
        broken.fail_encode = true;
        let out = encode_job(request(
            vec![arc(broken), arc(ZrgbCodec::new()), arc(RawCodec::new())],
            1,
        ));
        let job = out.result.unwrap();
        assert_eq!(job.encoding, "zrgb");
        assert_eq!(job.failed, vec!["jpeg".to_string()]);
        assert!(job.precompressed);
        assert_eq!(job.rects.len(), 1);
    }

    #[test]
    fn lent_instance_is_returned() {
        let video = FakeCodec::video("h264");
        let inst = video.create(4, 4).unwrap();
        let mut req = request(vec![arc(video), arc(RawCodec::new())], 1);
        req.primary = Some(inst);
        let out = encode_job(req);
        let (name, inst) = out.returned.unwrap();
        assert_eq!(name, "h264");
        assert_eq!(inst.dimensions(), (4, 4));
        assert_eq!(out.result.unwrap().encoding, "h264");
    }

    #[test]
    fn input_is_converted_to_a_layout_the_codec_accepts() {
        let mut bgrx_only = FakeCodec::new("jpeg");
        bgrx_only.info.colorspaces = ColorspaceSet::BGRX;
        let mut req = request(vec![arc(bgrx_only), arc(RawCodec::new())], 1);
        let rect = req.snapshots[0].rect;
        req.snapshots[0] = Snapshot::packed(rect, Colorspace::Rgb, Bytes::from(vec![7u8; 48]));

        let job = encode_job(req).result.unwrap();
        assert_eq!(job.encoding, "jpeg");
        assert_eq!(job.colorspace, Colorspace::Bgrx);
        assert!(job.failed.is_empty());
    }

    #[test]
    fn fallback_keeps_the_native_layout() {
        let mut broken = FakeCodec::new("jpeg");
        broken.info.colorspaces = ColorspaceSet::BGRX;
        broken.fail_encode = true;
        let mut req = request(vec![arc(broken), arc(RawCodec::new())], 1);
        let rect = req.snapshots[0].rect;
        req.snapshots[0] = Snapshot::packed(rect, Colorspace::Rgb, Bytes::from(vec![7u8; 48]));

        let job = encode_job(req).result.unwrap();
        assert_eq!(job.encoding, "raw");
        assert_eq!(job.colorspace, Colorspace::Rgb);
        assert_eq!(job.rects[0].data.len(), 48);
    }

    #[test]
    fn malformed_capture_fails_every_encoding() {
        let mut req = request(vec![arc(RawCodec::new())], 1);
        req.snapshots[0].pixels = Bytes::from_static(&[0u8; 3]);
        let out = encode_job(req);
        assert!(matches!(out.result, Err(RdxError::EncodeFailure { .. })));
    }

    #[tokio::test]
    async fn pool_delivers_every_result() {
        let (pool, mut rx) = EncodePool::new(2);
        for id in 1..=8 {
            pool.submit(request(vec![arc(RawCodec::new())], id));
        }
        let mut ids = Vec::new();
        for _ in 0..8 {
            let out = rx.recv().await.unwrap();
            assert!(out.result.is_ok());
            ids.push(out.job_id);
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=8).collect::<Vec<_>>());
        assert_eq!(pool.active(), 0);
    }
}
