//! Codec adapter interface and registry.
//!
//! Every encoding is a [`CodecFactory`] that declares its capabilities once,
//! in a [`CodecInfo`], and creates [`CodecInstance`]s on demand. Stateful
//! instances (video encoders keeping reference frames) are owned by their
//! window and recreated on resize or encoding switch.
//!
//! | Built-in | Lossless | Pre-compressed | Notes                           |
//! |----------|----------|----------------|---------------------------------|
//! | `raw`    | yes      | no             | Universal fallback, always present |
//! | `zrgb`   | yes      | yes            | zstd over packed pixels         |

pub mod raw;
pub mod zrgb;

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::RdxError;
use crate::policy::{EncodingPolicy, VideoScaling};
use crate::types::{ColorspaceSet, Snapshot};

pub use raw::RawCodec;
pub use zrgb::ZrgbCodec;

/// Name of the universal fallback encoding.
pub const FALLBACK_ENCODING: &str = "raw";

/// Decode a rect produced by one of the built-in encodings into packed
/// pixels. Other encodings are the viewer's own business.
pub fn decode_builtin(encoding: &str, data: &[u8]) -> Result<Vec<u8>, RdxError> {
    match encoding {
        FALLBACK_ENCODING => Ok(data.to_vec()),
        zrgb::NAME => zrgb::decode(data),
        other => Err(RdxError::codec_unavailable(other, "no built-in decoder")),
    }
}

// ── CodecInfo ────────────────────────────────────────────────────

/// Capability metadata, queried once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub name: String,
    pub colorspaces: ColorspaceSet,
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// Instances carry state between calls and belong to one window.
    pub stateful: bool,
    /// Relative CPU cost; lower is cheaper.
    pub cost: u32,
    pub lossless: bool,
    /// Video codecs are subject to scaling and block-size constraints.
    pub video: bool,
    /// Macroblock size video dimensions must be aligned to.
    pub block_size: u32,
    /// Output is already compressed; the transport must not compress it again.
    pub precompressed: bool,
}

impl CodecInfo {
    pub fn accepts_size(&self, width: u32, height: u32) -> bool {
        (self.min_width..=self.max_width).contains(&width)
            && (self.min_height..=self.max_height).contains(&height)
    }

    /// Output dimensions a video codec would encode a `width × height`
    /// region at, or `None` if the scaling mode cannot satisfy the codec's
    /// limits.
    pub fn video_output_size(
        &self,
        width: u32,
        height: u32,
        scaling: VideoScaling,
    ) -> Option<(u32, u32)> {
        let block = self.block_size.max(1);
        if width < block || height < block {
            return None;
        }
        let align_up = |v: u32| v.div_ceil(block) * block;
        let align_down = |v: u32| (v / block) * block;
        let (w, h) = match scaling {
            VideoScaling::Off => (align_up(width), align_up(height)),
            VideoScaling::Fixed { num, den } => {
                let sw = (width as u64 * num as u64 / den.max(1) as u64) as u32;
                let sh = (height as u64 * num as u64 / den.max(1) as u64) as u32;
                (align_up(sw.max(1)), align_up(sh.max(1)))
            }
            VideoScaling::Auto => {
                if width <= self.max_width && height <= self.max_height {
                    (align_up(width), align_up(height))
                } else {
                    let fx = self.max_width as f64 / width as f64;
                    let fy = self.max_height as f64 / height as f64;
                    let f = fx.min(fy);
                    (
                        align_down((width as f64 * f) as u32),
                        align_down((height as f64 * f) as u32),
                    )
                }
            }
        };
        self.accepts_size(w, h).then_some((w, h))
    }
}

// ── Traits ───────────────────────────────────────────────────────

/// An encoding backend.
pub trait CodecFactory: Send + Sync {
    fn info(&self) -> &CodecInfo;

    /// Check that the backend (library, hardware) is usable.
    ///
    /// Fails with [`RdxError::CodecUnavailable`].
    fn probe(&self) -> Result<(), RdxError> {
        Ok(())
    }

    /// Create an encoder context for a `width × height` input.
    fn create(&self, width: u32, height: u32) -> Result<Box<dyn CodecInstance>, RdxError>;
}

/// An encoder context.
pub trait CodecInstance: Send {
    /// Encode one snapshot. Fails with [`RdxError::EncodeFailure`].
    ///
    /// The snapshot is always in one of the codec's declared colourspaces;
    /// the worker converts captures before they get here.
    fn encode(&mut self, snapshot: &Snapshot, quality: u8, speed: u8) -> Result<Vec<u8>, RdxError>;

    /// Input dimensions this context was created for.
    fn dimensions(&self) -> (u32, u32);
}

// ── CodecRegistry ────────────────────────────────────────────────

/// The codecs usable by a session, in registration order.
///
/// The fallback encoding is always present and cannot be removed.
#[derive(Clone)]
pub struct CodecRegistry {
    factories: Vec<Arc<dyn CodecFactory>>,
    fallback: Arc<dyn CodecFactory>,
}

impl CodecRegistry {
    /// Registry with only the fallback encoding.
    pub fn minimal() -> Self {
        Self {
            factories: Vec::new(),
            fallback: Arc::new(RawCodec::new()),
        }
    }

    /// Registry with every built-in encoding.
    pub fn with_builtins() -> Self {
        let mut reg = Self::minimal();
        reg.register(Arc::new(ZrgbCodec::new()));
        reg
    }

    /// Add (or replace, by name) a codec. The fallback name is reserved.
    pub fn register(&mut self, factory: Arc<dyn CodecFactory>) {
        let name = factory.info().name.clone();
        if name == FALLBACK_ENCODING {
            warn!("refusing to replace the '{FALLBACK_ENCODING}' fallback encoding");
            return;
        }
        self.factories.retain(|f| f.info().name != name);
        self.factories.push(factory);
    }

    /// Probe every registered codec once and remove those that are
    /// unavailable. Returns the removed names.
    pub fn negotiate(&mut self) -> Vec<String> {
        let mut removed = Vec::new();
        self.factories.retain(|f| match f.probe() {
            Ok(()) => true,
            Err(e) => {
                warn!("disabling encoding '{}': {e}", f.info().name);
                removed.push(f.info().name.clone());
                false
            }
        });
        info!("available encodings: {}", self.names().join(", "));
        removed
    }

    /// Look up a codec by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn CodecFactory>> {
        if name == FALLBACK_ENCODING {
            return Some(Arc::clone(&self.fallback));
        }
        self.factories
            .iter()
            .find(|f| f.info().name == name)
            .cloned()
    }

    pub fn fallback(&self) -> Arc<dyn CodecFactory> {
        Arc::clone(&self.fallback)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All usable encoding names, fallback last.
    pub fn names(&self) -> Vec<String> {
        self.factories
            .iter()
            .map(|f| f.info().name.clone())
            .chain(std::iter::once(FALLBACK_ENCODING.to_string()))
            .collect()
    }

    /// The policy's encodings that this registry can actually provide, in
    /// policy order.
    pub fn effective_encodings(&self, policy: &EncodingPolicy) -> Vec<Arc<dyn CodecFactory>> {
        policy.encodings.iter().filter_map(|e| self.get(e)).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// ── Tests ────────────────────────────────────────────────────────
