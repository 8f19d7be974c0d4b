//! Protocol definitions
//!
//! Identifiers, signaling messages and keep-alive frames.

mod frame;
mod signal;
mod types;

pub use frame::{PingFrame, FRAME_SIZE};
pub use signal::{HandoverKind, HandoverSignal, PunchKind, PunchSignal, Signal};
pub use types::{Endpoint, Nonce, PeerEndpoint, PeerId, Session, TraversedPortPair, SESSION_LEN};
