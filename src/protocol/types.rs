//! Identifiers and endpoint types shared by the traversal and pair layers

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session token length in bytes
pub const SESSION_LEN: usize = 16;

/// Random token binding one traversal attempt's signals and punch packets
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Session([u8; SESSION_LEN]);

impl Session {
    /// Generate a fresh random session
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; SESSION_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_LEN] {
        &self.0
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Unique id of a traversed pair, also used for ping correlation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(pub u64);

impl Nonce {
    /// Generate a random non-zero nonce
    pub fn random() -> Self {
        loop {
            let n: u64 = rand::random();
            if n != 0 {
                return Self(n);
            }
        }
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Overlay identity of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub Uuid);

impl PeerId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Observed UDP address of one side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// An endpoint owned by a specific overlay peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEndpoint {
    pub identity: PeerId,
    pub endpoint: Endpoint,
}

/// Two peers that established a NAT-traversed UDP path.
///
/// The pair is symmetric: either peer may be the local one depending on
/// which node holds the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversedPortPair {
    pub peer_a: PeerEndpoint,
    pub peer_b: PeerEndpoint,
    pub created_at: SystemTime,
    pub nonce: Nonce,
}

impl TraversedPortPair {
    /// Endpoint of `me` in this pair (falls back to `peer_b` for strangers)
    pub fn local_endpoint(&self, me: &PeerId) -> PeerEndpoint {
        if self.peer_a.identity == *me {
            self.peer_a
        } else {
            self.peer_b
        }
    }

    /// Endpoint of the other side, or `None` if `me` is not part of the pair
    pub fn remote_endpoint(&self, me: &PeerId) -> Option<PeerEndpoint> {
        if self.peer_a.identity == *me {
            Some(self.peer_b)
        } else if self.peer_b.identity == *me {
            Some(self.peer_a)
        } else {
            None
        }
    }

    pub fn local_addr(&self, me: &PeerId) -> SocketAddr {
        self.local_endpoint(me).endpoint.socket_addr()
    }

    /// Remote UDP address as seen from `me`
    pub fn remote_addr(&self, me: &PeerId) -> SocketAddr {
        if self.peer_a.identity == *me {
            self.peer_b.endpoint.socket_addr()
        } else {
            self.peer_a.endpoint.socket_addr()
        }
    }

    pub fn matches_peer(&self, peer: &PeerId) -> bool {
        self.peer_a.identity == *peer || self.peer_b.identity == *peer
    }
}
