//! Network error types

use thiserror::Error;

use crate::protocol::Nonce;

/// Errors that can occur during traversal, keep-alive and handover
#[derive(Error, Debug)]
pub enum NatError {
    #[error("Pair is busy")]
    PairBusy,

    #[error("Duplicate pair")]
    DuplicatePair,

    #[error("Pair cannot be locked")]
    PairCantLock,

    #[error("Pair does not exist")]
    PairNotExists,

    #[error("Unexpected signal: expected {expected}, got {got}")]
    UnexpectedSignal { expected: String, got: String },

    #[error("Session mismatch")]
    SessionMismatch,

    #[error("Pair id mismatch: expected {expected}, got {got}")]
    PairIdMismatch { expected: Nonce, got: Nonce },

    #[error("Peer failed to take over the pair")]
    TakeRejected,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Timed out: {0}")]
    Timeout(&'static str),

    #[error("Cancelled")]
    Cancelled,

    #[error("Signal channel closed")]
    ChannelClosed,

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Session is required")]
    SessionRequired,

    #[error("No candidate addresses to probe")]
    NoCandidates,

    #[error("No suitable public IP address found")]
    NoPublicIp,

    #[error("STUN failed: {0}")]
    StunFailed(String),

    #[error("Cannot traverse to self")]
    SelfTraversal,

    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    #[error("Invalid frame")]
    InvalidFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
}

impl NatError {
    /// Ownership conflicts the caller may retry later
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::PairBusy | Self::DuplicatePair | Self::PairCantLock
        )
    }

    /// Peer disagreement, as opposed to a timeout or transport failure
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedSignal { .. }
                | Self::SessionMismatch
                | Self::PairIdMismatch { .. }
                | Self::TakeRejected
                | Self::Remote(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub(crate) fn unexpected(expected: impl ToString, got: impl ToString) -> Self {
        Self::UnexpectedSignal {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}
