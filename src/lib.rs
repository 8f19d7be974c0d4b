//! natpair - UDP NAT traversal and traversed pair management
//!
//! Two peers exchange signals over an overlay channel, punch their NATs
//! and keep the resulting UDP endpoint pair alive until one side takes it
//! over through the handover protocol.

pub mod config;
pub mod network;
pub mod protocol;

pub use config::NatConfig;
pub use network::{NatError, NatService, Pair, PairPool};
pub use protocol::{Nonce, PeerId, Signal, TraversedPortPair};
