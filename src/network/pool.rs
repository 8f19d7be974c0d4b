//! Registry of live pairs
//!
//! Pairs are keyed by nonce. Taking a pair removes it from the pool so it is
//! owned by exactly one handover run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::protocol::{Nonce, PeerId};

use super::error::NatError;
use super::pair::{Pair, PairState};

/// Admin view of one pooled pair
#[derive(Debug, Clone, PartialEq)]
pub struct PairInfo {
    pub nonce: Nonce,
    pub peer: Option<PeerId>,
    pub remote_addr: std::net::SocketAddr,
    pub state: PairState,
    pub pinger: bool,
    /// Time since the last ping or pong
    pub idle_for: Duration,
}

impl From<&Pair> for PairInfo {
    fn from(pair: &Pair) -> Self {
        Self {
            nonce: pair.nonce(),
            peer: pair.remote_peer(),
            remote_addr: pair.remote_addr(),
            state: pair.state(),
            pinger: pair.is_pinger(),
            idle_for: pair.last_ping().elapsed(),
        }
    }
}

/// Concurrency-safe pair registry
#[derive(Default)]
pub struct PairPool {
    pairs: RwLock<HashMap<Nonce, Pair>>,
    cleanup: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PairPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pair; fails if its nonce is already present
    pub fn add(&self, pair: Pair) -> Result<(), NatError> {
        let mut pairs = self.pairs.write();
        let nonce = pair.nonce();
        if pairs.contains_key(&nonce) {
            return Err(NatError::DuplicatePair);
        }
        pairs.insert(nonce, pair);
        debug!("Pair {} added to pool ({} total)", nonce, pairs.len());
        Ok(())
    }

    /// Remove and return an idle pair
    pub fn take(&self, nonce: Nonce) -> Result<Pair, NatError> {
        let mut pairs = self.pairs.write();
        let pair = pairs.get(&nonce).ok_or(NatError::PairNotExists)?;
        if !pair.is_idle() {
            return Err(NatError::PairBusy);
        }
        pairs.remove(&nonce).ok_or(NatError::PairNotExists)
    }

    /// Remove and return any idle pair shared with `peer`
    pub fn take_any(&self, peer: &PeerId) -> Result<Pair, NatError> {
        let mut pairs = self.pairs.write();

        let mut busy = false;
        let mut found = None;
        for (nonce, pair) in pairs.iter() {
            if !pair.matches_peer(peer) {
                continue;
            }
            if pair.is_idle() {
                found = Some(*nonce);
                break;
            }
            busy = true;
        }

        match found {
            Some(nonce) => pairs.remove(&nonce).ok_or(NatError::PairNotExists),
            None if busy => Err(NatError::PairBusy),
            None => Err(NatError::PairNotExists),
        }
    }

    pub fn get(&self, nonce: Nonce) -> Option<Pair> {
        self.pairs.read().get(&nonce).cloned()
    }

    pub fn get_all(&self) -> Vec<Pair> {
        self.pairs.read().values().cloned().collect()
    }

    /// Admin listing, oldest pair first
    pub fn snapshot(&self) -> Vec<PairInfo> {
        let mut infos: Vec<(std::time::SystemTime, PairInfo)> = self
            .pairs
            .read()
            .values()
            .map(|p| (p.traversed().created_at, PairInfo::from(p)))
            .collect();
        infos.sort_by_key(|(created, _)| *created);
        infos.into_iter().map(|(_, info)| info).collect()
    }

    /// Drop a pair from the pool and expire it
    pub fn remove(&self, nonce: Nonce) -> Option<Pair> {
        let pair = self.pairs.write().remove(&nonce)?;
        pair.expire("removed from pool");
        Some(pair)
    }

    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }

    /// Expire pairs stuck in locking, then drop every terminal pair.
    ///
    /// Returns the number of pairs removed.
    pub fn cleanup(&self) -> usize {
        let overdue: Vec<Pair> = self
            .pairs
            .read()
            .values()
            .filter(|p| p.lock_overdue())
            .cloned()
            .collect();
        for pair in overdue {
            pair.expire("lock timeout during cleanup");
        }

        let mut pairs = self.pairs.write();
        let before = pairs.len();
        pairs.retain(|_, pair| !pair.state().is_terminal());
        let removed = before - pairs.len();
        if removed > 0 {
            debug!("Pool cleanup removed {} pairs, {} left", removed, pairs.len());
        }
        removed
    }

    /// Run `cleanup` every `period` until `stop` is called
    pub fn start_cleanup(self: &Arc<Self>, period: Duration) {
        let mut slot = self.cleanup.lock();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let stop = token.clone();
        let pool = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.cleanup();
                    }
                }
            }
        });

        info!("Pool cleanup every {:?}", period);
        *slot = Some((token, handle));
    }

    /// Stop the cleanup task
    pub fn stop(&self) {
        if let Some((token, _handle)) = self.cleanup.lock().take() {
            token.cancel();
            debug!("Pool cleanup stopped");
        }
    }

    /// Expire and drop every pair
    pub fn clear(&self) {
        let drained: Vec<Pair> = self.pairs.write().drain().map(|(_, p)| p).collect();
        for pair in drained {
            pair.expire("pool shutdown");
        }
    }
}

impl Drop for PairPool {
    fn drop(&mut self) {
        self.stop();
    }
}
