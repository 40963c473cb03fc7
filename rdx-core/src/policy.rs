//! Encoding policy: which encodings are enabled and the quality / speed
//! envelope the controller works inside.
//!
//! A policy is an immutable snapshot. Sessions hold it in an `Arc` and swap
//! the whole `Arc` on change, so encode workers can keep reading an old
//! snapshot without locking.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RdxError;

/// Value of `quality` / `speed` meaning "let the controller decide".
pub const AUTO: u8 = 0;

// ── VideoScaling ─────────────────────────────────────────────────

/// How video encoders may rescale a window before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoScaling {
    /// Encode at native size; only letterbox padding to the codec block size.
    Off,
    /// Downscale as needed to fit the codec's dimension limits.
    #[default]
    Auto,
    /// Always scale by `num / den`.
    Fixed { num: u32, den: u32 },
}

impl FromStr for VideoScaling {
    type Err = RdxError;

    /// Accepts `off`, `auto`, or a ratio written `N/D` or `N:D`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "off" | "none" | "false" => return Ok(VideoScaling::Off),
            "auto" | "on" | "true" => return Ok(VideoScaling::Auto),
            _ => {}
        }
        let (n, d) = s
            .split_once(['/', ':'])
            .ok_or_else(|| RdxError::Other(format!("invalid video scaling '{s}'")))?;
        let num: u32 = n
            .trim()
            .parse()
            .map_err(|_| RdxError::Other(format!("invalid video scaling '{s}'")))?;
        let den: u32 = d
            .trim()
            .parse()
            .map_err(|_| RdxError::Other(format!("invalid video scaling '{s}'")))?;
        if num == 0 || den == 0 || num > den {
            return Err(RdxError::Other(format!(
                "video scaling ratio must be in (0, 1]: '{s}'"
            )));
        }
        Ok(VideoScaling::Fixed { num, den })
    }
}

impl fmt::Display for VideoScaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoScaling::Off => write!(f, "off"),
            VideoScaling::Auto => write!(f, "auto"),
            VideoScaling::Fixed { num, den } => write!(f, "{num}/{den}"),
        }
    }
}

// ── EncodingPolicy ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingPolicy {
    /// Enabled encodings, most preferred first.
    pub encodings: Vec<String>,
    /// Target quality, 0 = auto.
    pub quality: u8,
    pub min_quality: u8,
    /// Ceiling used by auto quality.
    pub max_quality: u8,
    /// Target speed, 0 = auto.
    pub speed: u8,
    pub min_speed: u8,
    pub video_scaling: VideoScaling,
    /// Video encoders allowed for this session; empty allows all.
    pub video_encoders: Vec<String>,
    /// Colourspace conversion backends; non-empty lets a codec be chosen
    /// for input in a colourspace it does not natively support, which is
    /// then converted before encoding.
    pub csc_modules: Vec<String>,
    /// Hard bandwidth ceiling in bytes/second.
    pub bandwidth_limit: Option<u64>,
}

impl Default for EncodingPolicy {
    fn default() -> Self {
        Self {
            encodings: vec!["zrgb".into(), "raw".into()],
            quality: AUTO,
            min_quality: 30,
            max_quality: 100,
            speed: AUTO,
            min_speed: 30,
            video_scaling: VideoScaling::Auto,
            video_encoders: Vec::new(),
            csc_modules: Vec::new(),
            bandwidth_limit: None,
        }
    }
}

impl EncodingPolicy {
    /// Clamp every numeric field into range and drop duplicate encodings.
    pub fn normalized(mut self) -> Self {
        self.quality = self.quality.min(100);
        self.min_quality = self.min_quality.min(100);
        self.max_quality = self.max_quality.clamp(self.min_quality.max(1), 100);
        self.speed = self.speed.min(100);
        self.min_speed = self.min_speed.min(100);
        let mut seen = Vec::with_capacity(self.encodings.len());
        self.encodings.retain(|e| {
            let keep = !e.is_empty() && !seen.contains(e);
            if keep {
                seen.push(e.clone());
            }
            keep
        });
        if self.bandwidth_limit == Some(0) {
            self.bandwidth_limit = None;
        }
        self
    }

    pub fn is_auto_quality(&self) -> bool {
        self.quality == AUTO
    }

    pub fn is_auto_speed(&self) -> bool {
        self.speed == AUTO
    }

    /// Quality used when not in auto mode.
    pub fn fixed_quality(&self) -> u8 {
        self.quality.clamp(self.min_quality.max(1), 100)
    }

    /// Speed used when not in auto mode.
    pub fn fixed_speed(&self) -> u8 {
        self.speed.clamp(self.min_speed.max(1), 100)
    }

    pub fn allows_video_encoder(&self, name: &str) -> bool {
        self.video_encoders.is_empty() || self.video_encoders.iter().any(|v| v == name)
    }

    pub fn has_csc(&self) -> bool {
        !self.csc_modules.is_empty()
    }

    /// Apply a client override on top of this policy.
    pub fn with_override(&self, ov: &PolicyOverride) -> Self {
        let mut p = self.clone();
        if let Some(enc) = &ov.encoding {
            p.encodings.retain(|e| e != enc);
            p.encodings.insert(0, enc.clone());
        }
        if let Some(q) = ov.quality {
            p.quality = q;
        }
        if let Some(s) = ov.speed {
            p.speed = s;
        }
        p.normalized()
    }
}

/// Client-requested adjustments for one window or the whole session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyOverride {
    pub encoding: Option<String>,
    pub quality: Option<u8>,
    pub speed: Option<u8>,
}

impl PolicyOverride {
    pub fn is_empty(&self) -> bool {
        self.encoding.is_none() && self.quality.is_none() && self.speed.is_none()
    }

    /// Later values win.
    pub fn merge(&mut self, other: &PolicyOverride) {
        if other.encoding.is_some() {
            self.encoding.clone_from(&other.encoding);
        }
        if other.quality.is_some() {
            self.quality = other.quality;
        }
        if other.speed.is_some() {
            self.speed = other.speed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_scaling_parsing() {
        assert_eq!("off".parse::<VideoScaling>().unwrap(), VideoScaling::Off);
        assert_eq!("AUTO".parse::<VideoScaling>().unwrap(), VideoScaling::Auto);
        assert_eq!(
            "1/2".parse::<VideoScaling>().unwrap(),
            VideoScaling::Fixed { num: 1, den: 2 }
        );
        assert_eq!(
            "2:3".parse::<VideoScaling>().unwrap(),
            VideoScaling::Fixed { num: 2, den: 3 }
        );
        assert!("3/2".parse::<VideoScaling>().is_err());
        assert!("sideways".parse::<VideoScaling>().is_err());
        assert_eq!(VideoScaling::Fixed { num: 1, den: 2 }.to_string(), "1/2");
    }

    #[test]
    fn normalization_clamps_and_dedups() {
        let p = EncodingPolicy {
            encodings: vec!["raw".into(), "zrgb".into(), "raw".into(), String::new()],
            quality: 200,
            min_quality: 150,
            speed: 101,
            bandwidth_limit: Some(0),
            ..EncodingPolicy::default()
        }
        .normalized();
        assert_eq!(p.encodings, vec!["raw".to_string(), "zrgb".to_string()]);
        assert_eq!(p.quality, 100);
        assert_eq!(p.min_quality, 100);
        assert_eq!(p.max_quality, 100);
        assert_eq!(p.speed, 100);
        assert_eq!(p.bandwidth_limit, None);
    }

    #[test]
    fn fixed_values_respect_minimums() {
        let p = EncodingPolicy {
            quality: 10,
            min_quality: 40,
            speed: 5,
            min_speed: 20,
            ..EncodingPolicy::default()
        };
        assert_eq!(p.fixed_quality(), 40);
        assert_eq!(p.fixed_speed(), 20);
    }

    #[test]
    fn override_moves_encoding_to_front() {
        let base = EncodingPolicy::default();
        let p = base.with_override(&PolicyOverride {
            encoding: Some("raw".into()),
            quality: Some(80),
            speed: None,
        });
        assert_eq!(p.encodings[0], "raw");
        assert_eq!(p.encodings.len(), 2);
        assert_eq!(p.quality, 80);
        assert_eq!(p.speed, base.speed);
    }

    #[test]
    fn video_encoder_allow_list() {
        let mut p = EncodingPolicy::default();
        assert!(p.allows_video_encoder("h264"));
        p.video_encoders = vec!["vp8".into()];
        assert!(!p.allows_video_encoder("h264"));
        assert!(p.allows_video_encoder("vp8"));
    }
}
