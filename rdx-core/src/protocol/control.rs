//! Feedback and control payloads.

use serde::{Deserialize, Serialize};

use crate::message::MessageType;
use crate::policy::PolicyOverride;
use crate::protocol::Payload;

/// The viewer received message `message_id` (`bytes` on the wire).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub message_id: u32,
    pub bytes: u64,
    /// Viewer clock, microseconds since its session start. Informational.
    pub timestamp_us: u64,
}

impl Payload for Ack {
    const MESSAGE_TYPE: MessageType = MessageType::Ack;
}

/// Latency probe. `timestamp_us` is on the sender's clock.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    pub id: u64,
    pub timestamp_us: u64,
}

impl Payload for Ping {
    const MESSAGE_TYPE: MessageType = MessageType::Ping;
}

/// Reply to a [`Ping`], echoing its id and timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pong {
    pub id: u64,
    pub echo_timestamp_us: u64,
}

impl Payload for Pong {
    const MESSAGE_TYPE: MessageType = MessageType::Pong;
}

/// The viewer has applied every update of `window_id` up to `damage_seq`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DamageSequence {
    pub window_id: u32,
    pub damage_seq: u64,
    /// Time the viewer spent decoding the update, in microseconds.
    pub decode_time_us: u32,
}

impl Payload for DamageSequence {
    const MESSAGE_TYPE: MessageType = MessageType::DamageSequence;
}

/// Client-requested encoding, quality or speed; for one window or, with
/// `window_id: None`, the whole session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncodingOverride {
    pub window_id: Option<u32>,
    pub values: PolicyOverride,
}

impl Payload for EncodingOverride {
    const MESSAGE_TYPE: MessageType = MessageType::EncodingOverride;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_survives_the_wire() {
        let msg = EncodingOverride {
            window_id: Some(3),
            values: PolicyOverride {
                encoding: Some("zrgb".into()),
                quality: None,
                speed: Some(90),
            },
        };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(EncodingOverride::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn garbage_is_an_encoding_error() {
        assert!(matches!(
            DamageSequence::from_bytes(&[1, 2]),
            Err(crate::error::RdxError::Encoding(_))
        ));
    }
}
