//! Shared helpers for integration tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use natpair::config::NatConfig;
use natpair::network::{
    AliasResolver, MemoryChannel, NatService, Pair, StaticIps, TraversalRole,
};
use natpair::protocol::PeerId;
use tokio_util::sync::CancellationToken;

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Short timeouts, loopback-only punching
pub fn loopback_config() -> NatConfig {
    let mut config = NatConfig::default();
    config.puncher.bind_ip = localhost();
    config.puncher.port_spread = 2;
    config.puncher.punch_timeout_ms = 3_000;
    config.traversal.signal_timeout_ms = 3_000;
    config.traversal.allow_loopback = true;
    config.pair.ping_interval_ms = 100;
    config.pair.no_ping_timeout_ms = 1_000;
    config.pair.ping_lifespan_ms = 600;
    config.pair.lock_timeout_ms = 2_000;
    config.handover.take_timeout_ms = 2_000;
    config
}

pub fn loopback_service(config: NatConfig) -> Arc<NatService> {
    Arc::new(NatService::new(
        PeerId::random(),
        config,
        Arc::new(StaticIps::new(vec![localhost()])),
        Arc::new(AliasResolver::new()),
    ))
}

/// Two services that completed a traversal with each other
pub struct Traversed {
    pub initiator: Arc<NatService>,
    pub responder: Arc<NatService>,
    pub pair_i: Pair,
    pub pair_r: Pair,
    pub chan_i: MemoryChannel,
    pub chan_r: MemoryChannel,
}

pub async fn traverse_services(config: NatConfig) -> Traversed {
    let initiator = loopback_service(config.clone());
    let responder = loopback_service(config);
    let (mut chan_i, mut chan_r) = MemoryChannel::pair();
    let cancel = CancellationToken::new();

    let (pair_i, pair_r) = tokio::join!(
        initiator.traverse(
            &mut chan_i,
            TraversalRole::Initiator,
            responder.local_id(),
            &cancel
        ),
        responder.traverse(
            &mut chan_r,
            TraversalRole::Responder,
            initiator.local_id(),
            &cancel
        ),
    );

    Traversed {
        initiator,
        responder,
        pair_i: pair_i.expect("initiator traversal failed"),
        pair_r: pair_r.expect("responder traversal failed"),
        chan_i,
        chan_r,
    }
}
