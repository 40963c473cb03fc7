//! # rdx-core
//!
//! Adaptive screen-update encoding and transport pipeline.
//!
//! This crate contains:
//! - **Damage**: `DamageAggregator` coalesces damage rectangles into jobs
//! - **Selection**: `EncodingSelector` picks encoding, quality and speed per job
//! - **Codecs**: `CodecFactory` / `CodecInstance` adapters and the `CodecRegistry`
//! - **Bandwidth**: `BandwidthEstimator` derives bandwidth and RTT from acks
//! - **Transport**: `PacketTransport` frames, chunks, compresses and multiplexes
//! - **Sessions**: `ServerSession` (capture → wire) and `ViewerSession` (wire → acks)
//! - **Error**: `RdxError`, a typed `thiserror`-based error hierarchy

pub mod bandwidth;
pub mod capture;
pub mod codec;
pub mod codecs;
pub mod compression;
pub mod damage;
pub mod error;
pub mod feedback;
pub mod header;
pub mod message;
pub mod packet;
pub mod policy;
pub mod presets;
pub mod protocol;
pub mod selector;
pub mod session;
pub mod task;
pub mod transport;
pub mod types;
pub mod viewer;
pub mod window;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use bandwidth::{BandwidthEstimator, BandwidthState, EstimatorConfig};
pub use capture::{CaptureEvent, CaptureSource, MemoryCapture};
pub use codec::RdxCodec;
pub use codecs::{CodecFactory, CodecInfo, CodecInstance, CodecRegistry, FALLBACK_ENCODING};
pub use compression::Compression;
pub use damage::{AggregatorConfig, DamageAggregator, EncodingJob};
pub use error::RdxError;
pub use header::{HEADER_SIZE, PacketHeader};
pub use message::{Channel, MessageType};
pub use packet::{Message, Packet};
pub use policy::{EncodingPolicy, PolicyOverride, VideoScaling};
pub use selector::{ControllerConfig, EncodingSelector, Selection};
pub use session::{EffectivePolicy, PolicyChange, ServerSession, SessionConfig, SessionStats};
pub use transport::{PacketTransport, TransportConfig};
pub use types::{Colorspace, ColorspaceSet, Rect, Snapshot};
pub use viewer::{ViewerConfig, ViewerSession, ViewerStats};
