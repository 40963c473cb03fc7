//! Payload definitions carried inside transport messages.
//!
//! Every payload is a `serde` struct encoded with `bincode`. The
//! [`MessageType`] in the packet header says which struct to decode.
//!
//! ```text
//! Server ──[WindowUpdate]────────────────────► Viewer
//! Viewer ──[Ack]─────────────────────────────► Server   (per update message)
//! Viewer ──[DamageSequence]──────────────────► Server   (per applied update)
//! Server ──[Ping]────────────────────────────► Viewer
//! Viewer ──[Pong]────────────────────────────► Server
//! Viewer ──[EncodingOverride]────────────────► Server
//! ```

pub mod control;
pub mod update;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::RdxError;
use crate::message::MessageType;
use crate::transport::PacketTransport;

pub use control::{Ack, DamageSequence, EncodingOverride, Ping, Pong};
pub use update::{EncodedRect, WindowUpdate};

/// A struct that travels as one message of a fixed type.
pub trait Payload: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: MessageType;

    /// Serialize to bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, RdxError> {
        bincode::serialize(self).map_err(|e| RdxError::Encoding(e.to_string()))
    }

    /// Deserialize from bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, RdxError> {
        bincode::deserialize(bytes).map_err(|e| RdxError::Encoding(e.to_string()))
    }
}

/// Any message a server session can receive from its viewer.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack(Ack),
    Ping(Ping),
    Pong(Pong),
    DamageSequence(DamageSequence),
    EncodingOverride(EncodingOverride),
    WindowUpdate(WindowUpdate),
    Bulk(Vec<u8>),
}

impl Inbound {
    pub fn decode(message_type: MessageType, payload: &[u8]) -> Result<Self, RdxError> {
        Ok(match message_type {
            MessageType::Ack => Inbound::Ack(Ack::from_bytes(payload)?),
            MessageType::Ping => Inbound::Ping(Ping::from_bytes(payload)?),
            MessageType::Pong => Inbound::Pong(Pong::from_bytes(payload)?),
            MessageType::DamageSequence => Inbound::DamageSequence(DamageSequence::from_bytes(payload)?),
            MessageType::EncodingOverride => {
                Inbound::EncodingOverride(EncodingOverride::from_bytes(payload)?)
            }
            MessageType::WindowUpdate => Inbound::WindowUpdate(WindowUpdate::from_bytes(payload)?),
            MessageType::Bulk => Inbound::Bulk(payload.to_vec()),
        })
    }
}

/// Serialize `payload` and queue it on its message type's channel.
pub fn queue<P: Payload>(
    transport: &mut PacketTransport,
    payload: &P,
    precompressed: bool,
) -> Result<u32, RdxError> {
    let bytes = payload.to_bytes()?;
    transport.send(
        P::MESSAGE_TYPE.channel(),
        P::MESSAGE_TYPE,
        Bytes::from(bytes),
        precompressed,
    )
}
