//! Domain-specific error types for the rdx pipeline.
//!
//! All fallible operations return `Result<T, RdxError>`.
//! Per-job and per-packet failures are handled where they occur; only the
//! variants for which [`RdxError::is_fatal`] is `true` end a session.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the rdx pipeline.
#[derive(Debug, Error)]
pub enum RdxError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// A field in the packet header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// A packet violated protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Packet Errors ────────────────────────────────────────────
    /// An inbound packet declared a payload larger than the receiver accepts.
    #[error("oversized packet: {size} bytes (max {max})")]
    OversizedPacket { size: usize, max: usize },

    /// An outbound message cannot be represented on the wire.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An incomplete chunked message was discarded.
    #[error("chunk reassembly timed out for message {message_id} ({received}/{expected} chunks)")]
    ChunkReassemblyTimeout {
        message_id: u32,
        received: u16,
        expected: u16,
    },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The peer went away; the session cannot continue.
    #[error("transport disconnected")]
    TransportDisconnected,

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Compressing or decompressing a payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    // ── Codec Errors ─────────────────────────────────────────────
    /// A codec backend is missing; the encoding is removed for the session.
    #[error("codec unavailable: {encoding}: {reason}")]
    CodecUnavailable { encoding: String, reason: String },

    /// A single encode call failed; the job falls back to the next encoding.
    #[error("encode failure: {encoding}: {reason}")]
    EncodeFailure { encoding: String, reason: String },

    /// Not even the universal fallback encoding is usable.
    #[error("no encodings available")]
    NoEncodingsAvailable,

    // ── Session Errors ───────────────────────────────────────────
    /// A window id was not known to the session.
    #[error("unknown window {0}")]
    UnknownWindow(u32),

    /// The capture collaborator could not provide pixels.
    #[error("capture failed for window {window_id}: {reason}")]
    CaptureFailed { window_id: u32, reason: String },

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl RdxError {
    /// Shorthand for an [`RdxError::EncodeFailure`].
    pub fn encode_failure(encoding: &str, reason: impl Into<String>) -> Self {
        RdxError::EncodeFailure {
            encoding: encoding.to_string(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`RdxError::CodecUnavailable`].
    pub fn codec_unavailable(encoding: &str, reason: impl Into<String>) -> Self {
        RdxError::CodecUnavailable {
            encoding: encoding.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors that make the whole session unusable and must surface to the
    /// session manager.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RdxError::TransportDisconnected
                | RdxError::NoEncodingsAvailable
                | RdxError::OversizedPacket { .. }
                | RdxError::Connection(_)
        )
    }
}

// ── Convenient From implementations ──────────────────────────────

impl From<String> for RdxError {
    fn from(s: String) -> Self {
        RdxError::Other(s)
    }
}

impl From<&str> for RdxError {
    fn from(s: &str) -> Self {
        RdxError::Other(s.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RdxError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RdxError::ChannelClosed
    }
}

impl From<Box<bincode::ErrorKind>> for RdxError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        RdxError::Encoding(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = RdxError::OversizedPacket {
            size: 1000,
            max: 500,
        };
        assert!(e.to_string().contains("1000"));
        assert!(e.to_string().contains("500"));

        let e = RdxError::encode_failure("zrgb", "bad stride");
        assert!(e.to_string().contains("zrgb"));
        assert!(e.to_string().contains("bad stride"));
    }

    #[test]
    fn fatal_classification() {
        assert!(RdxError::TransportDisconnected.is_fatal());
        assert!(RdxError::NoEncodingsAvailable.is_fatal());
        assert!(RdxError::OversizedPacket { size: 2, max: 1 }.is_fatal());
        assert!(!RdxError::encode_failure("raw", "x").is_fatal());
        assert!(
            !RdxError::ChunkReassemblyTimeout {
                message_id: 1,
                received: 1,
                expected: 2
            }
            .is_fatal()
        );
    }

    #[test]
    fn from_string() {
        let e: RdxError = "something broke".into();
        assert!(matches!(e, RdxError::Other(_)));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: RdxError = io_err.into();
        assert!(matches!(e, RdxError::Connection(_)));
    }
}
