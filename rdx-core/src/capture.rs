//! Capture collaborator seam.
//!
//! The windowing system is outside the pipeline: it announces windows and
//! damage as [`CaptureEvent`]s and hands out pixels on request through a
//! [`CaptureSource`]. [`MemoryCapture`] is an in-process framebuffer
//! implementation used by tests and the synthetic server source.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RdxError;
use crate::types::{Colorspace, Rect, Snapshot};

/// Notices from the capture side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureEvent {
    WindowCreated { window_id: u32, width: u32, height: u32 },
    WindowResized { window_id: u32, width: u32, height: u32 },
    WindowClosed { window_id: u32 },
    Damage { window_id: u32, rect: Rect },
}

#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Pixels of `rect` (window coordinates) as they are now.
    ///
    /// Fails with [`RdxError::CaptureFailed`]; the region is then dropped.
    async fn get_window_pixels(&self, window_id: u32, rect: Rect) -> Result<Snapshot, RdxError>;
}

// ── MemoryCapture ────────────────────────────────────────────────

struct FrameBuffer {
    width: u32,
    height: u32,
    colorspace: Colorspace,
    pixels: Vec<u8>,
    failing: bool,
}

impl FrameBuffer {
    fn stride(&self) -> usize {
        self.width as usize * self.colorspace.bytes_per_pixel()
    }
}

/// Framebuffers kept in memory, one per window.
#[derive(Default)]
pub struct MemoryCapture {
    windows: Mutex<HashMap<u32, FrameBuffer>>,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_windows<R>(&self, f: impl FnOnce(&mut HashMap<u32, FrameBuffer>) -> R) -> Result<R, RdxError> {
        let mut guard = self
            .windows
            .lock()
            .map_err(|_| RdxError::Other("capture framebuffer lock poisoned".into()))?;
        Ok(f(&mut guard))
    }

    /// Create or replace a window's framebuffer, filled with zeroes.
    pub fn create_window(&self, window_id: u32, width: u32, height: u32, colorspace: Colorspace) -> Result<(), RdxError> {
        let len = width as usize * height as usize * colorspace.bytes_per_pixel();
        self.with_windows(|w| {
            w.insert(
                window_id,
                FrameBuffer {
                    width,
                    height,
                    colorspace,
                    pixels: vec![0; len],
                    failing: false,
                },
            );
        })
    }

    /// Resize, keeping the overlapping top-left content.
    pub fn resize_window(&self, window_id: u32, width: u32, height: u32) -> Result<(), RdxError> {
        self.with_windows(|w| {
            let fb = w.get_mut(&window_id).ok_or(RdxError::UnknownWindow(window_id))?;
            let bpp = fb.colorspace.bytes_per_pixel();
            let mut pixels = vec![0; width as usize * height as usize * bpp];
            let copy_w = fb.width.min(width) as usize * bpp;
            for y in 0..fb.height.min(height) as usize {
                let src = y * fb.stride();
                let dst = y * width as usize * bpp;
                pixels[dst..dst + copy_w].copy_from_slice(&fb.pixels[src..src + copy_w]);
            }
            fb.width = width;
            fb.height = height;
            fb.pixels = pixels;
            Ok(())
        })?
    }

    pub fn close_window(&self, window_id: u32) -> Result<(), RdxError> {
        self.with_windows(|w| {
            w.remove(&window_id);
        })
    }

    /// Paint `rect` with one pixel value. Returns the clipped rect.
    pub fn fill(&self, window_id: u32, rect: Rect, pixel: &[u8]) -> Result<Option<Rect>, RdxError> {
        self.with_windows(|w| {
            let fb = w.get_mut(&window_id).ok_or(RdxError::UnknownWindow(window_id))?;
            let bpp = fb.colorspace.bytes_per_pixel();
            if pixel.len() != bpp {
                return Err(RdxError::Other(format!(
                    "pixel has {} bytes, colourspace needs {bpp}",
                    pixel.len()
                )));
            }
            let Some(clipped) = rect.clip_to(fb.width, fb.height) else {
                return Ok(None);
            };
            let stride = fb.stride();
            for y in clipped.y..clipped.y + clipped.height {
                let row = y as usize * stride;
                for x in clipped.x..clipped.x + clipped.width {
                    let at = row + x as usize * bpp;
                    fb.pixels[at..at + bpp].copy_from_slice(pixel);
                }
            }
            Ok(Some(clipped))
        })?
    }

    /// Make capture of a window fail (or succeed again).
    pub fn set_failing(&self, window_id: u32, failing: bool) -> Result<(), RdxError> {
        self.with_windows(|w| {
            if let Some(fb) = w.get_mut(&window_id) {
                fb.failing = failing;
            }
        })
    }
}

#[async_trait]
impl CaptureSource for MemoryCapture {
    async fn get_window_pixels(&self, window_id: u32, rect: Rect) -> Result<Snapshot, RdxError> {
        self.with_windows(|w| {
            let fb = w.get(&window_id).ok_or(RdxError::CaptureFailed {
                window_id,
                reason: "no such window".into(),
            })?;
            if fb.failing {
                return Err(RdxError::CaptureFailed {
                    window_id,
                    reason: "capture disabled".into(),
                });
            }
            let clipped = rect.clip_to(fb.width, fb.height).ok_or(RdxError::CaptureFailed {
                window_id,
                reason: format!("{rect:?} outside window"),
            })?;
            let bpp = fb.colorspace.bytes_per_pixel();
            let row_len = clipped.width as usize * bpp;
            let mut out = Vec::with_capacity(row_len * clipped.height as usize);
            for y in clipped.y..clipped.y + clipped.height {
                let start = y as usize * fb.stride() + clipped.x as usize * bpp;
                out.extend_from_slice(&fb.pixels[start..start + row_len]);
            }
            Ok(Snapshot {
                rect: clipped,
                stride: row_len as u32,
                colorspace: fb.colorspace,
                pixels: Bytes::from(out),
                captured_at: Instant::now(),
            })
        })?
    }
}
