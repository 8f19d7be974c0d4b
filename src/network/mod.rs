//! Network module for NAT traversal
//!
//! Handles UDP transport, hole punching, the traversal and handover
//! protocols, pair keep-alive and the pair pool.

mod channel;
mod discovery;
mod error;
mod identity;
mod pair;
mod pool;
mod puncher;
mod service;
mod stun;
mod taker;
mod transport;
mod traversal;

pub use channel::{
    exchange_hello, receive_within, send_within, MemoryChannel, SignalChannel, WsChannel,
};
pub use discovery::{first_usable, Chained, LocalInterfaces, PublicIpSource, StaticIps, StunDiscovery};
pub use error::NatError;
pub use identity::{AliasResolver, IdentityResolver};
pub use pair::{ExpireHook, Pair, PairState};
pub use pool::{PairInfo, PairPool};
pub use puncher::{candidate_ports, ConePuncher, PunchResult};
pub use service::NatService;
pub use stun::{StunClient, StunResult, DEFAULT_STUN_SERVERS};
pub use taker::{HandoverRole, HandoverState, PairTaker};
pub use transport::UdpTransport;
pub use traversal::{Traversal, TraversalOutcome, TraversalRole, TraversalState};
