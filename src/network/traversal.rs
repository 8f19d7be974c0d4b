//! Traversal state machine
//!
//! Drives the offer/answer/ready/go/result exchange between an initiator
//! and a responder over a signal channel and punches the NAT in between.
//!
//! ```text
//! Initiator                         Responder
//!   Offer{session, ip, port}  --->
//!                             <---  Answer{session, ip, port}
//!   Ready                     --->
//!                             <---  Go
//!   ======== hole punch both ways ========
//!   Result{observed, nonce}   --->
//!                             <---  Result{observed, nonce}
//! ```

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{NatConfig, PuncherConfig};
use crate::protocol::{
    Endpoint, Nonce, PeerEndpoint, PeerId, PunchKind, PunchSignal, Session, Signal,
    TraversedPortPair,
};

use super::channel::{receive_within, send_within, SignalChannel};
use super::error::NatError;
use super::puncher::ConePuncher;
use super::transport::UdpTransport;

/// Bound on the best-effort error report sent to the peer
const ERROR_REPORT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraversalState {
    OfferExchange = 0,
    ReadyPhase = 1,
    Punch = 2,
    ResultExchange = 3,
    Done = 4,
    Failed = 5,
}

impl TraversalState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::OfferExchange,
            1 => Self::ReadyPhase,
            2 => Self::Punch,
            3 => Self::ResultExchange,
            4 => Self::Done,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for TraversalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OfferExchange => "offer_exchange",
            Self::ReadyPhase => "ready_phase",
            Self::Punch => "punch",
            Self::ResultExchange => "result_exchange",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Result of a successful traversal: the pair and its punched socket
#[derive(Debug)]
pub struct TraversalOutcome {
    pub pair: TraversedPortPair,
    pub transport: UdpTransport,
}

/// One traversal attempt toward one peer
pub struct Traversal {
    role: TraversalRole,
    local_id: PeerId,
    peer_id: PeerId,
    /// Address advertised to the peer in Offer/Answer
    local_ip: IpAddr,
    puncher: PuncherConfig,
    signal_timeout: Duration,
    state: AtomicU8,
}

impl Traversal {
    pub fn new(
        role: TraversalRole,
        local_id: PeerId,
        peer_id: PeerId,
        local_ip: IpAddr,
        config: &NatConfig,
    ) -> Self {
        Self {
            role,
            local_id,
            peer_id,
            local_ip,
            puncher: config.puncher.clone(),
            signal_timeout: config.traversal.signal_timeout(),
            state: AtomicU8::new(TraversalState::OfferExchange as u8),
        }
    }

    pub fn role(&self) -> TraversalRole {
        self.role
    }

    pub fn state(&self) -> TraversalState {
        TraversalState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: TraversalState) {
        debug!("Traversal {:?} -> {}", self.role, state);
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Run the exchange to completion
    pub async fn run<C>(
        &self,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversalOutcome, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        // A pair always joins two distinct identities
        if self.local_id == self.peer_id {
            self.set_state(TraversalState::Failed);
            warn!("Refusing traversal toward own identity {}", self.local_id);
            return Err(NatError::SelfTraversal);
        }

        let res = match self.role {
            TraversalRole::Initiator => self.run_initiator(channel, cancel).await,
            TraversalRole::Responder => self.run_responder(channel, cancel).await,
        };

        match res {
            Ok(outcome) => {
                self.set_state(TraversalState::Done);
                info!(
                    "Traversal with {} done: pair {} {} <-> {}",
                    self.peer_id,
                    outcome.pair.nonce,
                    outcome.pair.local_addr(&self.local_id),
                    outcome.pair.remote_addr(&self.local_id)
                );
                Ok(outcome)
            }
            Err(e) => {
                let failed_in = self.state();
                self.set_state(TraversalState::Failed);
                warn!("Traversal with {} failed in {}: {}", self.peer_id, failed_in, e);
                self.report_error(channel, &e).await;
                Err(e)
            }
        }
    }

    async fn run_initiator<C>(
        &self,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversalOutcome, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        self.set_state(TraversalState::OfferExchange);
        let session = Session::random();
        let puncher = ConePuncher::with_session(self.puncher.clone(), session);
        let port = puncher.open().await?;

        self.send(
            channel,
            PunchSignal::offer(session, Endpoint::new(self.local_ip, port)),
            cancel,
        )
        .await?;
        let answer = self.expect(channel, PunchKind::Answer, Some(session), cancel).await?;
        let peer_endpoint = required_endpoint(&answer)?;

        self.set_state(TraversalState::ReadyPhase);
        self.send(channel, PunchSignal::ready(session), cancel).await?;
        self.expect(channel, PunchKind::Go, Some(session), cancel).await?;

        self.set_state(TraversalState::Punch);
        let punched = puncher
            .hole_punch(cancel, peer_endpoint.ip, peer_endpoint.port)
            .await?;
        let observed_peer = Endpoint::new(punched.remote_ip, punched.remote_port);

        self.set_state(TraversalState::ResultExchange);
        let nonce = Nonce::random();
        self.send(channel, PunchSignal::result(session, observed_peer, nonce), cancel)
            .await?;
        let reply = self.expect(channel, PunchKind::Result, Some(session), cancel).await?;

        let echoed = reply.pair_nonce.unwrap_or(Nonce(0));
        if echoed != nonce {
            return Err(NatError::PairIdMismatch {
                expected: nonce,
                got: echoed,
            });
        }
        let observed_self = required_endpoint(&reply)?;

        self.finish(&puncher, observed_self, observed_peer, nonce)
    }

    async fn run_responder<C>(
        &self,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversalOutcome, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        self.set_state(TraversalState::OfferExchange);
        let offer = self.expect(channel, PunchKind::Offer, None, cancel).await?;
        let session = offer.session;
        let peer_endpoint = required_endpoint(&offer)?;

        let puncher = ConePuncher::with_session(self.puncher.clone(), session);
        let port = puncher.open().await?;
        self.send(
            channel,
            PunchSignal::answer(session, Endpoint::new(self.local_ip, port)),
            cancel,
        )
        .await?;

        self.set_state(TraversalState::ReadyPhase);
        self.expect(channel, PunchKind::Ready, Some(session), cancel).await?;
        self.send(channel, PunchSignal::go(session), cancel).await?;

        self.set_state(TraversalState::Punch);
        let punched = puncher
            .hole_punch(cancel, peer_endpoint.ip, peer_endpoint.port)
            .await?;
        let observed_peer = Endpoint::new(punched.remote_ip, punched.remote_port);

        self.set_state(TraversalState::ResultExchange);
        let result = self.expect(channel, PunchKind::Result, Some(session), cancel).await?;
        let nonce = result
            .pair_nonce
            .ok_or_else(|| NatError::Signaling("result without pair nonce".to_string()))?;
        let observed_self = required_endpoint(&result)?;

        self.send(channel, PunchSignal::result(session, observed_peer, nonce), cancel)
            .await?;

        self.finish(&puncher, observed_self, observed_peer, nonce)
    }

    fn finish(
        &self,
        puncher: &ConePuncher,
        observed_self: Endpoint,
        observed_peer: Endpoint,
        nonce: Nonce,
    ) -> Result<TraversalOutcome, NatError> {
        let transport = puncher.take_transport().ok_or(NatError::TransportClosed)?;

        let pair = TraversedPortPair {
            peer_a: PeerEndpoint {
                identity: self.local_id,
                endpoint: observed_self,
            },
            peer_b: PeerEndpoint {
                identity: self.peer_id,
                endpoint: observed_peer,
            },
            created_at: SystemTime::now(),
            nonce,
        };

        Ok(TraversalOutcome { pair, transport })
    }

    async fn send<C>(
        &self,
        channel: &mut C,
        signal: PunchSignal,
        cancel: &CancellationToken,
    ) -> Result<(), NatError>
    where
        C: SignalChannel + ?Sized,
    {
        send_within(
            channel,
            signal.into(),
            self.signal_timeout,
            cancel,
            "traversal signal send",
        )
        .await
    }

    /// Read one signal and check its session and kind
    async fn expect<C>(
        &self,
        channel: &mut C,
        kind: PunchKind,
        session: Option<Session>,
        cancel: &CancellationToken,
    ) -> Result<PunchSignal, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let signal =
            receive_within(channel, self.signal_timeout, cancel, "traversal signal").await?;

        match signal {
            Signal::Punch(punch) => {
                if let Some(session) = session {
                    if punch.session != session {
                        return Err(NatError::SessionMismatch);
                    }
                }
                if punch.kind != kind {
                    return Err(NatError::unexpected(kind, punch.kind));
                }
                Ok(punch)
            }
            Signal::Error { message } => Err(NatError::Remote(message)),
            other => Err(NatError::unexpected(kind, other.name())),
        }
    }

    /// Tell the peer we gave up so it does not wait for its own timeout
    async fn report_error<C>(&self, channel: &mut C, err: &NatError)
    where
        C: SignalChannel + ?Sized,
    {
        if matches!(
            err,
            NatError::Remote(_) | NatError::ChannelClosed | NatError::Cancelled
        ) {
            return;
        }

        let signal = Signal::Error {
            message: err.to_string(),
        };
        match tokio::time::timeout(ERROR_REPORT_TIMEOUT, channel.send(signal)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to report traversal error: {}", e),
            Err(_) => debug!("Timed out reporting traversal error"),
        }
    }
}

fn required_endpoint(signal: &PunchSignal) -> Result<Endpoint, NatError> {
    signal
        .endpoint
        .ok_or_else(|| NatError::Signaling(format!("{} without endpoint", signal.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryChannel;
    use std::net::Ipv4Addr;

    fn loopback_config() -> NatConfig {
        let mut config = NatConfig::default();
        config.puncher.bind_ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.puncher.port_spread = 2;
        config.puncher.punch_timeout_ms = 3_000;
        config.traversal.signal_timeout_ms = 2_000;
        config
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_state_from_u8() {
        assert_eq!(TraversalState::from_u8(2), TraversalState::Punch);
        assert_eq!(TraversalState::from_u8(200), TraversalState::Failed);
    }

    #[tokio::test]
    async fn test_responder_rejects_foreign_session() {
        let (mut ours, mut theirs) = MemoryChannel::pair();
        let config = loopback_config();
        let responder = Traversal::new(
            TraversalRole::Responder,
            PeerId::random(),
            PeerId::random(),
            localhost(),
            &config,
        );

        let session = Session::random();
        theirs
            .send(PunchSignal::offer(session, Endpoint::new(localhost(), 40000)).into())
            .await
            .unwrap();
        theirs
            .send(PunchSignal::ready(Session::random()).into())
            .await
            .unwrap();

        let res = responder.run(&mut ours, &CancellationToken::new()).await;
        assert!(matches!(res, Err(NatError::SessionMismatch)));
        assert_eq!(responder.state(), TraversalState::Failed);

        // Answer, then the error report
        assert!(matches!(theirs.receive().await.unwrap(), Signal::Punch(_)));
        assert!(matches!(
            theirs.receive().await.unwrap(),
            Signal::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_initiator_rejects_wrong_kind() {
        let (mut ours, mut theirs) = MemoryChannel::pair();
        let config = loopback_config();
        let initiator = Traversal::new(
            TraversalRole::Initiator,
            PeerId::random(),
            PeerId::random(),
            localhost(),
            &config,
        );

        let peer = tokio::spawn(async move {
            let offer = match theirs.receive().await.unwrap() {
                Signal::Punch(p) => p,
                other => panic!("unexpected {:?}", other),
            };
            theirs.send(PunchSignal::go(offer.session).into()).await.unwrap();
            theirs
        });

        let res = initiator.run(&mut ours, &CancellationToken::new()).await;
        assert!(matches!(
            res,
            Err(NatError::UnexpectedSignal { ref expected, ref got })
                if expected == "answer" && got == "go"
        ));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_error_aborts() {
        let (mut ours, mut theirs) = MemoryChannel::pair();
        let config = loopback_config();
        let initiator = Traversal::new(
            TraversalRole::Initiator,
            PeerId::random(),
            PeerId::random(),
            localhost(),
            &config,
        );

        theirs
            .send(Signal::Error {
                message: "no socket".into(),
            })
            .await
            .unwrap();

        let res = initiator.run(&mut ours, &CancellationToken::new()).await;
        assert!(matches!(res, Err(NatError::Remote(ref m)) if m == "no socket"));
    }

    fn punch(signal: Signal) -> PunchSignal {
        match signal {
            Signal::Punch(p) => p,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_self_traversal_rejected() {
        let config = loopback_config();
        let me = PeerId::random();

        for role in [TraversalRole::Initiator, TraversalRole::Responder] {
            let (mut ours, mut theirs) = MemoryChannel::pair();
            let traversal = Traversal::new(role, me, me, localhost(), &config);

            let res = traversal.run(&mut ours, &CancellationToken::new()).await;
            assert!(matches!(res, Err(NatError::SelfTraversal)));
            assert_eq!(traversal.state(), TraversalState::Failed);

            // Nothing reached the channel
            drop(ours);
            assert!(matches!(theirs.receive().await, Err(NatError::ChannelClosed)));
        }
    }

    #[tokio::test]
    async fn test_initiator_rejects_foreign_answer() {
        let (mut ours, mut theirs) = MemoryChannel::pair();
        let config = loopback_config();
        let initiator = Traversal::new(
            TraversalRole::Initiator,
            PeerId::random(),
            PeerId::random(),
            localhost(),
            &config,
        );

        let peer = tokio::spawn(async move {
            punch(theirs.receive().await.unwrap());
            theirs
                .send(PunchSignal::answer(Session::random(), Endpoint::new(localhost(), 40000)).into())
                .await
                .unwrap();
            theirs
        });

        let res = initiator.run(&mut ours, &CancellationToken::new()).await;
        assert!(matches!(res, Err(NatError::SessionMismatch)));
        assert_eq!(initiator.state(), TraversalState::Failed);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_initiator_rejects_foreign_go() {
        let (mut ours, mut theirs) = MemoryChannel::pair();
        let config = loopback_config();
        let initiator = Traversal::new(
            TraversalRole::Initiator,
            PeerId::random(),
            PeerId::random(),
            localhost(),
            &config,
        );

        let peer = tokio::spawn(async move {
            let offer = punch(theirs.receive().await.unwrap());
            theirs
                .send(PunchSignal::answer(offer.session, Endpoint::new(localhost(), 40000)).into())
                .await
                .unwrap();
            let ready = punch(theirs.receive().await.unwrap());
            assert_eq!(ready.kind, PunchKind::Ready);
            theirs
                .send(PunchSignal::go(Session::random()).into())
                .await
                .unwrap();
            theirs
        });

        let res = initiator.run(&mut ours, &CancellationToken::new()).await;
        assert!(matches!(res, Err(NatError::SessionMismatch)));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_initiator_rejects_foreign_result() {
        let (mut ours, mut theirs) = MemoryChannel::pair();
        let config = loopback_config();
        let initiator = Traversal::new(
            TraversalRole::Initiator,
            PeerId::random(),
            PeerId::random(),
            localhost(),
            &config,
        );
        let puncher_config = config.puncher.clone();

        // Responder side that punches for real, then answers with a foreign session
        let peer = tokio::spawn(async move {
            let offer = punch(theirs.receive().await.unwrap());
            let offered = offer.endpoint.unwrap();
            let puncher = ConePuncher::with_session(puncher_config, offer.session);
            let port = puncher.open().await.unwrap();
            theirs
                .send(PunchSignal::answer(offer.session, Endpoint::new(localhost(), port)).into())
                .await
                .unwrap();
            punch(theirs.receive().await.unwrap());
            theirs.send(PunchSignal::go(offer.session).into()).await.unwrap();

            let punched = puncher
                .hole_punch(&CancellationToken::new(), offered.ip, offered.port)
                .await
                .unwrap();
            let result = punch(theirs.receive().await.unwrap());
            assert_eq!(result.kind, PunchKind::Result);
            theirs
                .send(
                    PunchSignal::result(
                        Session::random(),
                        Endpoint::new(punched.remote_ip, punched.remote_port),
                        result.pair_nonce.unwrap(),
                    )
                    .into(),
                )
                .await
                .unwrap();
            theirs
        });

        let res = initiator.run(&mut ours, &CancellationToken::new()).await;
        assert!(matches!(res, Err(NatError::SessionMismatch)));
        assert_eq!(initiator.state(), TraversalState::Failed);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_responder_rejects_foreign_result() {
        let (mut ours, mut theirs) = MemoryChannel::pair();
        let config = loopback_config();
        let responder = Traversal::new(
            TraversalRole::Responder,
            PeerId::random(),
            PeerId::random(),
            localhost(),
            &config,
        );
        let puncher_config = config.puncher.clone();

        // Initiator side that punches for real, then sends a foreign-session result
        let peer = tokio::spawn(async move {
            let session = Session::random();
            let puncher = ConePuncher::with_session(puncher_config, session);
            let port = puncher.open().await.unwrap();
            theirs
                .send(PunchSignal::offer(session, Endpoint::new(localhost(), port)).into())
                .await
                .unwrap();
            let answer = punch(theirs.receive().await.unwrap());
            let answered = answer.endpoint.unwrap();
            theirs.send(PunchSignal::ready(session).into()).await.unwrap();
            punch(theirs.receive().await.unwrap());

            let punched = puncher
                .hole_punch(&CancellationToken::new(), answered.ip, answered.port)
                .await
                .unwrap();
            theirs
                .send(
                    PunchSignal::result(
                        Session::random(),
                        Endpoint::new(punched.remote_ip, punched.remote_port),
                        Nonce::random(),
                    )
                    .into(),
                )
                .await
                .unwrap();
            theirs
        });

        let res = responder.run(&mut ours, &CancellationToken::new()).await;
        assert!(matches!(res, Err(NatError::SessionMismatch)));
        assert_eq!(responder.state(), TraversalState::Failed);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_loopback_traversal() {
        let (mut chan_a, mut chan_b) = MemoryChannel::pair();
        let config = loopback_config();
        let id_a = PeerId::random();
        let id_b = PeerId::random();

        let initiator = Traversal::new(TraversalRole::Initiator, id_a, id_b, localhost(), &config);
        let responder = Traversal::new(TraversalRole::Responder, id_b, id_a, localhost(), &config);
        let cancel = CancellationToken::new();

        let (res_a, res_b) = tokio::join!(
            initiator.run(&mut chan_a, &cancel),
            responder.run(&mut chan_b, &cancel),
        );
        let out_a = res_a.unwrap();
        let out_b = res_b.unwrap();

        assert_eq!(out_a.pair.nonce, out_b.pair.nonce);
        assert_eq!(out_a.pair.remote_addr(&id_a), out_b.transport.local_addr());
        assert_eq!(out_b.pair.remote_addr(&id_b), out_a.transport.local_addr());
        assert_eq!(initiator.state(), TraversalState::Done);
        assert_eq!(responder.state(), TraversalState::Done);
    }
}
