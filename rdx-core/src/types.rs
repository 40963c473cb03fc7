//! Shared geometry and pixel types used across the pipeline.
//!
//! These are **internal** representations passed between pipeline stages.
//! The serialisable wire types live in [`crate::protocol`].

use std::time::Instant;

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

// ── Rect ─────────────────────────────────────────────────────────

/// An axis-aligned rectangle in window coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }

    /// Smallest rectangle containing both.
    pub fn union(&self, other: &Rect) -> Rect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, (right - x as u64) as u32, (bottom - y as u64) as u32)
    }

    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= x as u64 || bottom <= y as u64 {
            return None;
        }
        Some(Rect::new(x, y, (right - x as u64) as u32, (bottom - y as u64) as u32))
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Clip to a `width × height` surface anchored at the origin.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<Rect> {
        self.intersection(&Rect::new(0, 0, width, height))
    }
}

// ── Colorspace ───────────────────────────────────────────────────

/// Pixel layout of a captured buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Colorspace {
    /// 4 bytes per pixel: Blue, Green, Red, padding.
    Bgrx,
    /// 4 bytes per pixel: Blue, Green, Red, Alpha.
    Bgra,
    /// 4 bytes per pixel: Red, Green, Blue, padding.
    Rgbx,
    /// 4 bytes per pixel: Red, Green, Blue, Alpha.
    Rgba,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb,
    /// 3 bytes per pixel: Blue, Green, Red.
    Bgr,
}

impl Colorspace {
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            Colorspace::Bgrx | Colorspace::Bgra | Colorspace::Rgbx | Colorspace::Rgba => 4,
            Colorspace::Rgb | Colorspace::Bgr => 3,
        }
    }

    /// Byte offsets of red, green and blue within a pixel, plus alpha
    /// when the layout carries one.
    const fn channels(self) -> ([usize; 3], Option<usize>) {
        match self {
            Colorspace::Bgrx => ([2, 1, 0], None),
            Colorspace::Bgra => ([2, 1, 0], Some(3)),
            Colorspace::Rgbx => ([0, 1, 2], None),
            Colorspace::Rgba => ([0, 1, 2], Some(3)),
            Colorspace::Rgb => ([0, 1, 2], None),
            Colorspace::Bgr => ([2, 1, 0], None),
        }
    }

    pub const fn flag(self) -> ColorspaceSet {
        match self {
            Colorspace::Bgrx => ColorspaceSet::BGRX,
            Colorspace::Bgra => ColorspaceSet::BGRA,
            Colorspace::Rgbx => ColorspaceSet::RGBX,
            Colorspace::Rgba => ColorspaceSet::RGBA,
            Colorspace::Rgb => ColorspaceSet::RGB,
            Colorspace::Bgr => ColorspaceSet::BGR,
        }
    }
}

bitflags! {
    /// Set of colourspaces a codec accepts as input.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorspaceSet: u8 {
        const BGRX = 1 << 0;
        const BGRA = 1 << 1;
        const RGBX = 1 << 2;
        const RGBA = 1 << 3;
        const RGB  = 1 << 4;
        const BGR  = 1 << 5;
    }
}

impl ColorspaceSet {
    pub fn supports(self, cs: Colorspace) -> bool {
        self.contains(cs.flag())
    }

    /// The layout to convert into for a codec accepting this set: `cs`
    /// itself when supported, else the closest one by pixel size.
    pub fn conversion_target(self, cs: Colorspace) -> Option<Colorspace> {
        if self.supports(cs) {
            return Some(cs);
        }
        const ORDER: [Colorspace; 6] = [
            Colorspace::Bgrx,
            Colorspace::Rgbx,
            Colorspace::Bgra,
            Colorspace::Rgba,
            Colorspace::Rgb,
            Colorspace::Bgr,
        ];
        let bpp = cs.bytes_per_pixel();
        ORDER
            .iter()
            .copied()
            .filter(|c| self.supports(*c))
            .min_by_key(|c| c.bytes_per_pixel() != bpp)
    }
}

// ── Snapshot ─────────────────────────────────────────────────────

/// Captured pixels for one rectangle of a window.
///
/// `pixels` holds `height` rows of `stride` bytes each. `stride` may exceed
/// `width * bytes_per_pixel` when the capture source pads its rows.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Where the pixels came from, in window coordinates.
    pub rect: Rect,
    pub stride: u32,
    pub colorspace: Colorspace,
    pub pixels: Bytes,
    pub captured_at: Instant,
}

impl Snapshot {
    /// Tightly packed snapshot of `rect` (stride = width × bpp).
    pub fn packed(rect: Rect, colorspace: Colorspace, pixels: Bytes) -> Self {
        Self {
            rect,
            stride: rect.width * colorspace.bytes_per_pixel() as u32,
            colorspace,
            pixels,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    /// Bytes of actual pixel data per row (no padding).
    pub fn row_len(&self) -> usize {
        self.rect.width as usize * self.colorspace.bytes_per_pixel()
    }

    /// `true` when the buffer is large enough for the declared geometry.
    pub fn is_well_formed(&self) -> bool {
        let rows = self.rect.height as usize;
        if rows == 0 {
            return true;
        }
        (self.stride as usize) >= self.row_len()
            && self.pixels.len() >= (rows - 1) * self.stride as usize + self.row_len()
    }

    /// Row `y` without padding.
    ///
    /// # Panics
    ///
    /// Panics if `y` is out of bounds or the snapshot is not well formed.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.pixels[start..start + self.row_len()]
    }

    /// Rows copied out without padding.
    pub fn to_packed(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.row_len() * self.rect.height as usize);
        for y in 0..self.rect.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }

    /// Packed copy of the visible pixels in another layout. Alpha is
    /// carried over when both layouts have it and is opaque otherwise;
    /// padding bytes are written as `0xff`.
    ///
    /// # Panics
    ///
    /// Panics if the snapshot is not well formed.
    pub fn convert(&self, to: Colorspace) -> Snapshot {
        if to == self.colorspace {
            return Snapshot {
                stride: self.row_len() as u32,
                pixels: Bytes::from(self.to_packed()),
                ..self.clone()
            };
        }
        let (src_rgb, src_alpha) = self.colorspace.channels();
        let (dst_rgb, dst_alpha) = to.channels();
        let src_bpp = self.colorspace.bytes_per_pixel();
        let dst_bpp = to.bytes_per_pixel();

        let pixel_count = self.rect.width as usize * self.rect.height as usize;
        let mut out = vec![0xffu8; pixel_count * dst_bpp];
        let mut dst = out.chunks_exact_mut(dst_bpp);
        for y in 0..self.rect.height {
            for px in self.row(y).chunks_exact(src_bpp) {
                let Some(d) = dst.next() else {
                    break;
                };
                for (s, t) in src_rgb.iter().zip(dst_rgb.iter()) {
                    d[*t] = px[*s];
                }
                if let (Some(s), Some(t)) = (src_alpha, dst_alpha) {
                    d[t] = px[s];
                }
            }
        }
        Snapshot {
            rect: self.rect,
            stride: self.rect.width * dst_bpp as u32,
            colorspace: to,
            pixels: Bytes::from(out),
            captured_at: self.captured_at,
        }
    }

    /// `true` when every pixel has the same value.
    pub fn is_solid(&self) -> bool {
        let bpp = self.colorspace.bytes_per_pixel();
        if self.rect.is_empty() || !self.is_well_formed() {
            return false;
        }
        let first = &self.pixels[..bpp];
        (0..self.rect.height).all(|y| self.row(y).chunks_exact(bpp).all(|px| px == first))
    }

    /// Content hash over the visible pixels (padding excluded).
    pub fn content_hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.rect.width.to_le_bytes());
        hasher.update(&self.rect.height.to_le_bytes());
        for y in 0..self.rect.height {
            hasher.update(self.row(y));
        }
        hasher.finalize()
    }
}

// ── Tests ────────────────────────────────────────────────────────
