//! NAT traversal service
//!
//! Wires configuration, public-IP discovery, identity resolution and the
//! pair pool together. Each service owns its own pool.

use std::net::IpAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NatConfig;
use crate::protocol::{HandoverKind, HandoverSignal, Nonce, PeerId, Signal, TraversedPortPair};

use super::channel::SignalChannel;
use super::discovery::{first_usable, PublicIpSource};
use super::error::NatError;
use super::identity::IdentityResolver;
use super::pair::Pair;
use super::pool::{PairInfo, PairPool};
use super::taker::{HandoverRole, PairTaker};
use super::traversal::{Traversal, TraversalRole};

pub struct NatService {
    local_id: PeerId,
    config: NatConfig,
    pool: Arc<PairPool>,
    ip_source: Arc<dyn PublicIpSource>,
    resolver: Arc<dyn IdentityResolver>,
    shutdown: CancellationToken,
}

impl NatService {
    /// Create a service. Pool cleanup starts if a Tokio runtime is running.
    pub fn new(
        local_id: PeerId,
        config: NatConfig,
        ip_source: Arc<dyn PublicIpSource>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let pool = Arc::new(PairPool::new());
        if tokio::runtime::Handle::try_current().is_ok() {
            pool.start_cleanup(config.pool.cleanup_interval());
        } else {
            warn!("No Tokio runtime, pool cleanup not started");
        }

        Self {
            local_id,
            config,
            pool,
            ip_source,
            resolver,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn config(&self) -> &NatConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<PairPool> {
        &self.pool
    }

    /// Address advertised to peers during traversal
    pub async fn public_ip(&self) -> Result<IpAddr, NatError> {
        let candidates = self.ip_source.candidates().await?;
        first_usable(&candidates, self.config.traversal.allow_loopback).ok_or(NatError::NoPublicIp)
    }

    /// Traverse toward `peer`, pool the resulting pair and start keep-alive
    pub async fn traverse<C>(
        &self,
        channel: &mut C,
        role: TraversalRole,
        peer: PeerId,
        cancel: &CancellationToken,
    ) -> Result<Pair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let local_ip = self.public_ip().await?;
        debug!("Advertising {} to {}", local_ip, peer);

        let traversal = Traversal::new(role, self.local_id, peer, local_ip, &self.config);
        let outcome = traversal.run(channel, cancel).await?;

        let pair = Pair::with_transport(
            outcome.pair,
            self.local_id,
            role == TraversalRole::Initiator,
            outcome.transport,
            self.config.pair.clone(),
        );
        pair.set_on_expire(|traversed| {
            debug!("Pair {} retired", traversed.nonce);
        });

        if let Err(e) = self.pool.add(pair.clone()) {
            pair.expire("duplicate pair");
            return Err(e);
        }
        pair.start_keep_alive(self.shutdown.child_token());

        info!(
            "Pair {} with {} ready ({} pooled)",
            pair.nonce(),
            peer,
            self.pool.len()
        );
        Ok(pair)
    }

    /// Resolve `target` and traverse toward it as the initiator
    pub async fn start_traversal<C>(
        &self,
        target: &str,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<Pair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let peer = self.resolver.resolve(target)?;
        self.traverse(channel, TraversalRole::Initiator, peer, cancel)
            .await
    }

    /// Take a pooled pair by id through the handover protocol
    pub async fn take_pair<C>(
        &self,
        nonce: Nonce,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversedPortPair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let pair = self.pool.take(nonce)?;
        self.run_taker(pair, channel, cancel).await
    }

    /// Take any idle pooled pair shared with `peer`
    pub async fn take_any<C>(
        &self,
        peer: &PeerId,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversedPortPair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let pair = self.pool.take_any(peer)?;
        self.run_taker(pair, channel, cancel).await
    }

    async fn run_taker<C>(
        &self,
        pair: Pair,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversedPortPair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let taker = PairTaker::new(HandoverRole::Taker, pair, &self.config.handover);
        taker.run(channel, cancel).await
    }

    /// Answer one handover request arriving on `channel`
    pub async fn serve_handover<C>(
        &self,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversedPortPair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let signal = tokio::select! {
            _ = cancel.cancelled() => return Err(NatError::Cancelled),
            res = channel.receive() => res?,
        };

        let lock = match signal {
            Signal::Handover(sig) if sig.kind == HandoverKind::Lock => sig,
            Signal::Error { message } => return Err(NatError::Remote(message)),
            other => return Err(NatError::unexpected("lock", other.name())),
        };

        let pair = match self.pool.take(lock.pair_id) {
            Ok(pair) => pair,
            Err(e) => {
                debug!("Refusing handover of pair {}: {}", lock.pair_id, e);
                let busy = HandoverSignal::new(HandoverKind::LockBusy, lock.pair_id);
                if let Err(send_err) = channel.send(busy.into()).await {
                    debug!("Failed to send lock_busy: {}", send_err);
                }
                return Err(e);
            }
        };

        let giver = PairTaker::new(HandoverRole::Giver, pair, &self.config.handover);
        giver.run_with_lock(channel, lock, cancel).await
    }

    /// Admin listing of pooled pairs
    pub fn pairs(&self) -> Vec<PairInfo> {
        self.pool.snapshot()
    }

    /// Stop background work and expire every pooled pair
    pub fn shutdown(&self) {
        info!("Shutting down NAT service ({} pairs)", self.pool.len());
        self.shutdown.cancel();
        self.pool.stop();
        self.pool.clear();
    }
}

impl Drop for NatService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
