//! Synthetic capture source.
//!
//! Drives a [`MemoryCapture`] with a box bouncing across each window so the
//! server has something to stream without a real windowing system.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use rdx_core::capture::{CaptureEvent, MemoryCapture};
use rdx_core::error::RdxError;
use rdx_core::types::{Colorspace, Rect};

use crate::config::TestPatternConfig;

const BOX_SIZE: u32 = 64;
const BACKGROUND: [u8; 4] = [0x20, 0x20, 0x20, 0xff];

/// Moving-box test pattern over an in-memory framebuffer.
pub struct TestPattern {
    config: TestPatternConfig,
    capture: Arc<MemoryCapture>,
    /// Box position per window, indexed by window id − 1.
    boxes: Vec<Rect>,
}

impl TestPattern {
    /// Create the windows and paint their background.
    pub fn new(config: TestPatternConfig) -> Result<Self, RdxError> {
        let capture = Arc::new(MemoryCapture::new());
        let width = config.width.max(BOX_SIZE);
        let height = config.height.max(BOX_SIZE);
        let count = config.windows.max(1);
        for window_id in 1..=count {
            capture.create_window(window_id, width, height, Colorspace::Bgrx)?;
            capture.fill(window_id, Rect::new(0, 0, width, height), &BACKGROUND)?;
        }
        let boxes = (0..count).map(|_| Rect::new(0, 0, BOX_SIZE, BOX_SIZE)).collect();
        Ok(Self {
            config: TestPatternConfig { width, height, windows: count, ..config },
            capture,
            boxes,
        })
    }

    /// Pixel source to hand to a session.
    pub fn capture(&self) -> Arc<MemoryCapture> {
        Arc::clone(&self.capture)
    }

    /// Announce every window with a full-window damage.
    pub fn initial_events(&self) -> Vec<CaptureEvent> {
        let (width, height) = (self.config.width, self.config.height);
        (1..=self.config.windows)
            .flat_map(|window_id| {
                [
                    CaptureEvent::WindowCreated { window_id, width, height },
                    CaptureEvent::Damage { window_id, rect: Rect::new(0, 0, width, height) },
                ]
            })
            .collect()
    }

    /// Advance to frame `n`: erase each box, draw it at its new position and
    /// report both areas as damage.
    pub fn frame(&mut self, n: u64) -> Result<Vec<CaptureEvent>, RdxError> {
        let span_x = u64::from(self.config.width - BOX_SIZE).max(1);
        let span_y = u64::from(self.config.height - BOX_SIZE).max(1);
        let mut events = Vec::with_capacity(self.boxes.len() * 2);

        for (index, current) in self.boxes.iter_mut().enumerate() {
            let window_id = index as u32 + 1;
            // Each window moves at its own speed.
            let step = n * (4 + index as u64 * 3);
            let next = Rect::new(
                bounce(step, span_x),
                bounce(step / 2, span_y),
                BOX_SIZE,
                BOX_SIZE,
            );
            let colour = [(n * 7) as u8, (index as u8).wrapping_mul(80), 0xc0, 0xff];

            if let Some(erased) = self.capture.fill(window_id, *current, &BACKGROUND)? {
                events.push(CaptureEvent::Damage { window_id, rect: erased });
            }
            if let Some(drawn) = self.capture.fill(window_id, next, &colour)? {
                events.push(CaptureEvent::Damage { window_id, rect: drawn });
            }
            *current = next;
        }
        Ok(events)
    }

    /// Emit the initial events, then one frame per tick until `running`
    /// clears or the receiver goes away.
    pub async fn animate(mut self, events: mpsc::Sender<CaptureEvent>, running: Arc<AtomicBool>) -> Result<(), RdxError> {
        for event in self.initial_events() {
            if events.send(event).await.is_err() {
                return Ok(());
            }
        }

        let period = Duration::from_secs_f64(1.0 / f64::from(self.config.fps.clamp(1, 240)));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut n = 0u64;
        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            n += 1;
            for event in self.frame(n)? {
                if events.send(event).await.is_err() {
                    debug!("capture events receiver closed");
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

/// Triangle wave over `0..=span`.
fn bounce(step: u64, span: u64) -> u32 {
    let phase = step % (span * 2);
    let pos = if phase > span { span * 2 - phase } else { phase };
    pos as u32
}

// ── Tests ────────────────────────────────────────────────────────
