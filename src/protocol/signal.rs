//! Signaling messages exchanged over the overlay message channel
//!
//! Two vocabularies share one envelope: traversal (`PunchSignal`) and
//! pair handover (`HandoverSignal`).

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{Endpoint, Nonce, PeerId, Session};

/// Traversal signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchKind {
    Offer,
    Answer,
    Ready,
    Go,
    Result,
}

/// A traversal signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchSignal {
    pub kind: PunchKind,
    pub session: Session,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_nonce: Option<Nonce>,
}

impl PunchSignal {
    pub fn offer(session: Session, endpoint: Endpoint) -> Self {
        Self::with_endpoint(PunchKind::Offer, session, endpoint)
    }

    pub fn answer(session: Session, endpoint: Endpoint) -> Self {
        Self::with_endpoint(PunchKind::Answer, session, endpoint)
    }

    pub fn ready(session: Session) -> Self {
        Self::bare(PunchKind::Ready, session)
    }

    pub fn go(session: Session) -> Self {
        Self::bare(PunchKind::Go, session)
    }

    /// Result carries the endpoint the sender observed for the receiver
    pub fn result(session: Session, observed: Endpoint, nonce: Nonce) -> Self {
        Self {
            kind: PunchKind::Result,
            session,
            endpoint: Some(observed),
            pair_nonce: Some(nonce),
        }
    }

    fn with_endpoint(kind: PunchKind, session: Session, endpoint: Endpoint) -> Self {
        Self {
            kind,
            session,
            endpoint: Some(endpoint),
            pair_nonce: None,
        }
    }

    fn bare(kind: PunchKind, session: Session) -> Self {
        Self {
            kind,
            session,
            endpoint: None,
            pair_nonce: None,
        }
    }
}

/// Handover signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoverKind {
    Lock,
    LockOk,
    LockBusy,
    Take,
    TakeOk,
    TakeErr,
}

/// A pair handover signal, correlated by pair id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoverSignal {
    pub kind: HandoverKind,
    pub pair_id: Nonce,
}

impl HandoverSignal {
    pub fn new(kind: HandoverKind, pair_id: Nonce) -> Self {
        Self { kind, pair_id }
    }
}

/// Envelope for everything sent over a signal channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Signal {
    /// Announces the sender's overlay identity
    Hello { identity: PeerId },
    Punch(PunchSignal),
    Handover(HandoverSignal),
    /// The sender aborted its protocol run
    Error { message: String },
}

impl Signal {
    /// Short name used in protocol error messages
    pub fn name(&self) -> String {
        match self {
            Signal::Hello { .. } => "hello".to_string(),
            Signal::Punch(p) => p.kind.to_string(),
            Signal::Handover(h) => h.kind.to_string(),
            Signal::Error { .. } => "error".to_string(),
        }
    }
}

impl From<PunchSignal> for Signal {
    fn from(sig: PunchSignal) -> Self {
        Signal::Punch(sig)
    }
}

impl From<HandoverSignal> for Signal {
    fn from(sig: HandoverSignal) -> Self {
        Signal::Handover(sig)
    }
}

impl fmt::Display for PunchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PunchKind::Offer => "offer",
            PunchKind::Answer => "answer",
            PunchKind::Ready => "ready",
            PunchKind::Go => "go",
            PunchKind::Result => "result",
        };
        f.write_str(s)
    }
}

impl fmt::Display for HandoverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandoverKind::Lock => "lock",
            HandoverKind::LockOk => "lock_ok",
            HandoverKind::LockBusy => "lock_busy",
            HandoverKind::Take => "take",
            HandoverKind::TakeOk => "take_ok",
            HandoverKind::TakeErr => "take_err",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_json_shape() {
        let sig: Signal = HandoverSignal::new(HandoverKind::LockOk, Nonce(42)).into();
        let json = serde_json::to_value(&sig).unwrap();

        assert_eq!(json["type"], "handover");
        assert_eq!(json["data"]["kind"], "lock_ok");
        assert_eq!(json["data"]["pair_id"], 42);
    }

    #[test]
    fn test_punch_signal_serialize() {
        let session = Session::random();
        let endpoint = Endpoint::new("203.0.113.7".parse().unwrap(), 5000);
        let sig: Signal = PunchSignal::offer(session, endpoint).into();

        let json = serde_json::to_string(&sig).unwrap();
        let parsed: Signal = serde_json::from_str(&json).unwrap();

        match parsed {
            Signal::Punch(p) => {
                assert_eq!(p.kind, PunchKind::Offer);
                assert_eq!(p.session, session);
                assert_eq!(p.endpoint, Some(endpoint));
                assert!(p.pair_nonce.is_none());
            }
            other => panic!("Wrong signal: {:?}", other),
        }
    }

    #[test]
    fn test_bare_signals_omit_payload() {
        let json = serde_json::to_value(Signal::from(PunchSignal::go(Session::random()))).unwrap();
        assert!(json["data"].get("endpoint").is_none());
        assert!(json["data"].get("pair_nonce").is_none());
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::from(PunchSignal::ready(Session::random())).name(), "ready");
        assert_eq!(
            Signal::from(HandoverSignal::new(HandoverKind::TakeErr, Nonce(1))).name(),
            "take_err"
        );
        assert_eq!(
            Signal::Error {
                message: "x".into()
            }
            .name(),
            "error"
        );
    }
}
