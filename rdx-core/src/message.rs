//! Channel and message-type tags carried in every packet header.
//!
//! Uses proper enums with `TryFrom`, so unknown values never panic.

use crate::error::RdxError;
use std::fmt;

// ── Channel ──────────────────────────────────────────────────────

/// Logical channel a message travels on.
///
/// Channels share one byte stream; the multiplexer drains them in
/// [`Channel::SCHEDULE`] order each turn so control and ack traffic is never
/// stuck behind a large window update.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Session control: ping/pong, damage-sequence, encoding overrides.
    Control = 0x0,
    /// Transport acknowledgements feeding the bandwidth estimator.
    Ack = 0x1,
    /// Encoded window updates.
    WindowUpdate = 0x2,
    /// Bulk side traffic (audio, clipboard, file transfer).
    Bulk = 0x3,
}

impl Channel {
    /// Number of channels.
    pub const COUNT: usize = 4;

    /// Drain order for one scheduling turn, highest priority first.
    pub const SCHEDULE: [Channel; Channel::COUNT] = [
        Channel::Control,
        Channel::Ack,
        Channel::WindowUpdate,
        Channel::Bulk,
    ];

    /// Index into per-channel tables.
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for Channel {
    type Error = RdxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Channel::Control),
            0x1 => Ok(Channel::Ack),
            0x2 => Ok(Channel::WindowUpdate),
            0x3 => Ok(Channel::Bulk),
            _ => Err(RdxError::UnknownVariant {
                type_name: "Channel",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Control => write!(f, "control"),
            Channel::Ack => write!(f, "ack"),
            Channel::WindowUpdate => write!(f, "window-update"),
            Channel::Bulk => write!(f, "bulk"),
        }
    }
}

// ── MessageType ──────────────────────────────────────────────────

/// Payload kind carried in the header `type` field.
///
/// Organized by category:
/// - `0x01..0x0F`: Session control
/// - `0x10..0x1F`: Acknowledgements
/// - `0x20..0x2F`: Window updates
/// - `0x30..0x3F`: Bulk data
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Latency probe from the server.
    Ping = 0x01,
    /// Echo of a [`MessageType::Ping`].
    Pong = 0x02,
    /// Per-window ack of the last applied damage sequence.
    DamageSequence = 0x03,
    /// Client asks for a specific encoding / quality / speed.
    EncodingOverride = 0x04,

    /// Transport-level ack of a received message.
    Ack = 0x10,

    /// One encoded screen update for a window.
    WindowUpdate = 0x20,

    /// Opaque bulk payload.
    Bulk = 0x30,
}

impl MessageType {
    /// Default channel for this message type.
    pub fn channel(self) -> Channel {
        match self {
            MessageType::Ping
            | MessageType::Pong
            | MessageType::DamageSequence
            | MessageType::EncodingOverride => Channel::Control,
            MessageType::Ack => Channel::Ack,
            MessageType::WindowUpdate => Channel::WindowUpdate,
            MessageType::Bulk => Channel::Bulk,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = RdxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Ping),
            0x02 => Ok(MessageType::Pong),
            0x03 => Ok(MessageType::DamageSequence),
            0x04 => Ok(MessageType::EncodingOverride),
            0x10 => Ok(MessageType::Ack),
            0x20 => Ok(MessageType::WindowUpdate),
            0x30 => Ok(MessageType::Bulk),
            _ => Err(RdxError::UnknownVariant {
                type_name: "MessageType",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_roundtrip() {
        for ch in Channel::SCHEDULE {
            assert_eq!(Channel::try_from(ch as u8).unwrap(), ch);
        }
        assert!(Channel::try_from(0x7F).is_err());
    }

    #[test]
    fn schedule_puts_control_before_updates() {
        let pos = |c| Channel::SCHEDULE.iter().position(|&x| x == c).unwrap();
        assert!(pos(Channel::Control) < pos(Channel::WindowUpdate));
        assert!(pos(Channel::Ack) < pos(Channel::WindowUpdate));
        assert!(pos(Channel::WindowUpdate) < pos(Channel::Bulk));
    }

    #[test]
    fn message_type_invalid() {
        assert!(MessageType::try_from(0xFF).is_err());
        assert_eq!(MessageType::try_from(0x20).unwrap(), MessageType::WindowUpdate);
    }

    #[test]
    fn message_types_map_to_channels() {
        assert_eq!(MessageType::Ping.channel(), Channel::Control);
        assert_eq!(MessageType::Ack.channel(), Channel::Ack);
        assert_eq!(MessageType::WindowUpdate.channel(), Channel::WindowUpdate);
    }
}
