//! Encoded window updates.

use serde::{Deserialize, Serialize};

use crate::message::MessageType;
use crate::protocol::Payload;
use crate::types::{Colorspace, Rect};

/// One encoded rectangle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncodedRect {
    pub rect: Rect,
    pub data: Vec<u8>,
}

/// Everything produced by one encode job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowUpdate {
    pub window_id: u32,
    pub job_id: u64,
    /// Highest damage sequence number this update covers.
    pub damage_seq: u64,
    /// Encoding actually used (may be a fallback).
    pub encoding: String,
    pub quality: u8,
    pub speed: u8,
    pub full_window: bool,
    /// Window size when the job was captured.
    pub window_width: u32,
    pub window_height: u32,
    /// Pixel layout of the decoded data.
    pub colorspace: Colorspace,
    pub rects: Vec<EncodedRect>,
}

impl WindowUpdate {
    /// Encoded bytes across all rects.
    pub fn data_len(&self) -> usize {
        self.rects.iter().map(|r| r.data.len()).sum()
    }
}

impl Payload for WindowUpdate {
    const MESSAGE_TYPE: MessageType = MessageType::WindowUpdate;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Inbound;

    #[test]
    fn decodes_through_inbound() {
        let update = WindowUpdate {
            window_id: 1,
            job_id: 7,
            damage_seq: 42,
            encoding: "raw".into(),
            quality: 100,
            speed: 50,
            full_window: false,
            window_width: 64,
            window_height: 64,
            colorspace: Colorspace::Bgrx,
            rects: vec![EncodedRect {
                rect: Rect::new(0, 0, 2, 1),
                data: vec![1; 8],
            }],
        };
        assert_eq!(update.data_len(), 8);
        let bytes = update.to_bytes().unwrap();
        match Inbound::decode(MessageType::WindowUpdate, &bytes).unwrap() {
            Inbound::WindowUpdate(u) => assert_eq!(u, update),
            other => panic!("unexpected {other:?}"),
        }
    }
}
