//! Keep-alive frames sent over a traversed pair's UDP path
//!
//! Frame format (bincode, 9 bytes):
//! - nonce: 8 bytes (little-endian)
//! - pong: 1 byte (0 = ping, 1 = pong)

use serde::{Deserialize, Serialize};

use super::types::Nonce;

/// Encoded frame size in bytes
pub const FRAME_SIZE: usize = 9;

/// A keep-alive ping or pong
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingFrame {
    pub nonce: Nonce,
    pub pong: bool,
}

impl PingFrame {
    pub fn ping(nonce: Nonce) -> Self {
        Self { nonce, pong: false }
    }

    pub fn pong(nonce: Nonce) -> Self {
        Self { nonce, pong: true }
    }

    /// Serialize the frame to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        // Fixed-size struct, serialization cannot fail
        bincode::serialize(self).unwrap_or_default()
    }

    /// Deserialize a frame, rejecting anything that is not exactly one frame
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() != FRAME_SIZE {
            return None;
        }
        bincode::deserialize(data).ok()
    }
}
