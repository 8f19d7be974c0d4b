//! Traversed pair runtime: keep-alive and locking
//!
//! A pair owns the punched UDP socket and keeps the NAT mapping warm with
//! ping/pong frames. Locking freezes the pair so its ownership can be handed
//! to another component; a locked or expired pair never returns to Idle.
//!
//! ```text
//! [*] --> Idle
//! Idle --> InLocking: begin_lock()
//! Idle --> Expired: no ping / send failures / expire()
//! InLocking --> Locked: in-flight pings drained
//! InLocking --> Expired: lock timeout / expire()
//! ```

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PairConfig;
use crate::protocol::{Nonce, PeerId, PingFrame, TraversedPortPair};

use super::error::NatError;
use super::transport::UdpTransport;

/// Queue depth between the socket reader and the control loop
const EVENT_QUEUE_SIZE: usize = 64;

/// Pair state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PairState {
    /// Keep-alive running, pair available
    #[default]
    Idle = 0,
    /// Lock requested, waiting for in-flight pings to drain
    InLocking = 1,
    /// Frozen, socket released for the new owner
    Locked = 2,
    /// Dead
    Expired = 3,
}

impl PairState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::InLocking,
            2 => Self::Locked,
            _ => Self::Expired,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Locked | Self::Expired)
    }
}

impl fmt::Display for PairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::InLocking => "in_locking",
            Self::Locked => "locked",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Callback fired once when the pair is retired
pub type ExpireHook = Box<dyn FnOnce(&TraversedPortPair) + Send + 'static>;

struct PairInner {
    traversed: TraversedPortPair,
    local_id: PeerId,
    is_pinger: bool,
    remote_addr: SocketAddr,
    transport: UdpTransport,
    config: PairConfig,
    state: AtomicU8,
    last_ping: Mutex<Instant>,
    /// In-flight pings: nonce -> sent at
    pings: Mutex<HashMap<Nonce, Instant>>,
    lock_started: Mutex<Option<Instant>>,
    ping_fails: AtomicU32,
    keep_alive_started: AtomicBool,
    /// Wakes the control loop
    wake: Notify,
    /// Wakes `wait_locked` callers
    state_changed: Notify,
    /// Cancelled once the pair reaches a terminal state
    done: CancellationToken,
    on_expire: Mutex<Option<ExpireHook>>,
}

/// One traversed UDP endpoint pair.
///
/// Cheap to clone; all clones share the same state and socket.
#[derive(Clone)]
pub struct Pair {
    inner: Arc<PairInner>,
}

impl fmt::Debug for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pair")
            .field("nonce", &self.nonce())
            .field("state", &self.state())
            .field("remote", &self.inner.remote_addr)
            .field("pinger", &self.inner.is_pinger)
            .finish()
    }
}

impl Pair {
    /// Wrap an already bound transport, typically the punched socket
    pub fn with_transport(
        traversed: TraversedPortPair,
        local_id: PeerId,
        is_pinger: bool,
        transport: UdpTransport,
        config: PairConfig,
    ) -> Self {
        let remote_addr = traversed.remote_addr(&local_id);

        Self {
            inner: Arc::new(PairInner {
                traversed,
                local_id,
                is_pinger,
                remote_addr,
                transport,
                config,
                state: AtomicU8::new(PairState::Idle as u8),
                last_ping: Mutex::new(Instant::now()),
                pings: Mutex::new(HashMap::new()),
                lock_started: Mutex::new(None),
                ping_fails: AtomicU32::new(0),
                keep_alive_started: AtomicBool::new(false),
                wake: Notify::new(),
                state_changed: Notify::new(),
                done: CancellationToken::new(),
                on_expire: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> PairState {
        PairState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn is_idle(&self) -> bool {
        self.state() == PairState::Idle
    }

    pub fn is_locked(&self) -> bool {
        self.state() == PairState::Locked
    }

    pub fn is_expired(&self) -> bool {
        self.state() == PairState::Expired
    }

    /// When a ping or pong was last received (creation time if never)
    pub fn last_ping(&self) -> Instant {
        *self.inner.last_ping.lock()
    }

    pub fn nonce(&self) -> Nonce {
        self.inner.traversed.nonce
    }

    pub fn traversed(&self) -> &TraversedPortPair {
        &self.inner.traversed
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Identity of the other side
    pub fn remote_peer(&self) -> Option<PeerId> {
        self.inner
            .traversed
            .remote_endpoint(&self.inner.local_id)
            .map(|e| e.identity)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Address of the socket this pair owns
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.transport.local_addr()
    }

    pub fn is_pinger(&self) -> bool {
        self.inner.is_pinger
    }

    pub fn lock_timeout(&self) -> Duration {
        self.inner.config.lock_timeout()
    }

    /// True while InLocking for longer than the lock timeout
    pub fn lock_overdue(&self) -> bool {
        self.state() == PairState::InLocking
            && self
                .inner
                .lock_started
                .lock()
                .map_or(false, |t| t.elapsed() > self.lock_timeout())
    }

    pub fn matches_peer(&self, peer: &PeerId) -> bool {
        self.inner.traversed.matches_peer(peer)
    }

    pub fn in_flight_pings(&self) -> usize {
        self.inner.pings.lock().len()
    }

    /// Install a callback fired once when the pair is retired
    pub fn set_on_expire<F>(&self, hook: F)
    where
        F: FnOnce(&TraversedPortPair) + Send + 'static,
    {
        *self.inner.on_expire.lock() = Some(Box::new(hook));
    }

    /// Start the socket reader and control loop. Idempotent.
    pub fn start_keep_alive(&self, cancel: CancellationToken) {
        if self.inner.keep_alive_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.state().is_terminal() {
            return;
        }

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        tokio::spawn(receive_loop(self.inner.clone(), tx));
        tokio::spawn(control_loop(self.clone(), rx, cancel));

        debug!(
            "Keep-alive started for pair {} ({} -> {}, pinger={})",
            self.nonce(),
            self.local_addr(),
            self.inner.remote_addr,
            self.inner.is_pinger
        );
    }

    /// Try to move Idle -> InLocking. Only one caller ever wins.
    pub fn begin_lock(&self) -> bool {
        let won = self
            .inner
            .state
            .compare_exchange(
                PairState::Idle as u8,
                PairState::InLocking as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if won {
            *self.inner.lock_started.lock() = Some(Instant::now());
            debug!("Pair {} locking", self.nonce());
            self.inner.wake.notify_one();
            self.inner.state_changed.notify_waiters();
        }
        won
    }

    /// Wait until the pair is Locked.
    ///
    /// Fails with `PairCantLock` if the pair ends Expired (or was never put
    /// into locking), and with `Timeout` once the lock deadline passes, in
    /// which case the pair is expired.
    pub async fn wait_locked(&self, cancel: &CancellationToken) -> Result<(), NatError> {
        loop {
            let notified = self.inner.state_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state() {
                PairState::Locked => return Ok(()),
                PairState::Expired | PairState::Idle => return Err(NatError::PairCantLock),
                PairState::InLocking => {
                    self.prune_pings();
                    if self.inner.pings.lock().is_empty() {
                        self.finish_lock();
                        continue;
                    }
                }
            }

            let started = (*self.inner.lock_started.lock()).unwrap_or_else(Instant::now);
            let deadline = tokio::time::Instant::from_std(started + self.lock_timeout());

            tokio::select! {
                _ = cancel.cancelled() => return Err(NatError::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    self.expire("lock timeout");
                    if self.is_locked() {
                        return Ok(());
                    }
                    return Err(NatError::Timeout("pair lock"));
                }
                // Re-check periodically so stale pings age out without a keep-alive
                _ = tokio::time::sleep(self.inner.config.ping_interval()) => {}
            }
        }
    }

    /// Retire the pair. Idempotent; always releases the socket.
    pub fn expire(&self, reason: &str) {
        let mut current = self.inner.state.load(Ordering::SeqCst);
        let mut transitioned = false;
        while !PairState::from_u8(current).is_terminal() {
            match self.inner.state.compare_exchange(
                current,
                PairState::Expired as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    transitioned = true;
                    break;
                }
                Err(actual) => current = actual,
            }
        }

        if transitioned {
            info!("Pair {} expired: {}", self.nonce(), reason);
        }

        self.release();

        let hook = self.inner.on_expire.lock().take();
        if let Some(hook) = hook {
            hook(&self.inner.traversed);
        }
    }

    /// InLocking -> Locked once the ping table is empty
    fn finish_lock(&self) {
        let locked = self
            .inner
            .state
            .compare_exchange(
                PairState::InLocking as u8,
                PairState::Locked as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if locked {
            info!("Pair {} locked", self.nonce());
            self.release();
        }
    }

    fn release(&self) {
        self.inner.pings.lock().clear();
        self.inner.transport.close();
        self.inner.done.cancel();
        self.inner.wake.notify_one();
        self.inner.state_changed.notify_waiters();
    }

    fn prune_pings(&self) {
        let lifespan = self.inner.config.ping_lifespan();
        self.inner
            .pings
            .lock()
            .retain(|_, sent_at| sent_at.elapsed() <= lifespan);
    }

    fn touch(&self) {
        *self.inner.last_ping.lock() = Instant::now();
    }

    async fn handle_frame(&self, frame: PingFrame) {
        if self.state().is_terminal() {
            return;
        }
        self.touch();

        if frame.pong {
            if self.inner.pings.lock().remove(&frame.nonce).is_some() {
                trace!("Pair {} pong {}", self.nonce(), frame.nonce);
            }
            return;
        }

        let pong = PingFrame::pong(frame.nonce).to_bytes();
        if let Err(e) = self.inner.transport.send_to(&pong, self.inner.remote_addr).await {
            debug!("Pair {} pong send failed: {}", self.nonce(), e);
        }
    }

    async fn send_ping(&self) {
        let nonce = Nonce::random();
        self.inner.pings.lock().insert(nonce, Instant::now());

        let frame = PingFrame::ping(nonce).to_bytes();
        match self.inner.transport.send_to(&frame, self.inner.remote_addr).await {
            Ok(_) => {
                self.inner.ping_fails.store(0, Ordering::Relaxed);
                trace!("Pair {} ping {}", self.nonce(), nonce);
            }
            Err(e) => {
                self.inner.pings.lock().remove(&nonce);
                let fails = self.inner.ping_fails.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    "Pair {} ping send failed ({}/{}): {}",
                    self.nonce(),
                    fails,
                    self.inner.config.max_ping_fails,
                    e
                );
                if fails >= self.inner.config.max_ping_fails {
                    self.expire("too many ping failures");
                }
            }
        }
    }

    /// Evaluate timeouts and lock progress; `tick` marks a ping slot
    async fn evaluate(&self, tick: bool) {
        match self.state() {
            PairState::Idle => {
                if self.last_ping().elapsed() > self.inner.config.no_ping_timeout() {
                    self.expire("no ping received");
                    return;
                }
                if self.inner.is_pinger && tick {
                    self.prune_pings();
                    self.send_ping().await;
                }
            }
            PairState::InLocking => {
                self.prune_pings();
                if self.inner.pings.lock().is_empty() {
                    self.finish_lock();
                } else if self.lock_overdue() {
                    self.expire("lock timeout");
                }
            }
            PairState::Locked | PairState::Expired => {}
        }
    }
}

async fn receive_loop(inner: Arc<PairInner>, tx: mpsc::Sender<PingFrame>) {
    let mut buf = [0u8; 64];
    loop {
        let res = tokio::select! {
            _ = inner.done.cancelled() => break,
            res = inner.transport.recv_from(&mut buf) => res,
        };

        match res {
            Ok((len, from)) => {
                if from != inner.remote_addr {
                    trace!("Dropping datagram from unexpected {}", from);
                    continue;
                }
                let Some(frame) = PingFrame::from_bytes(&buf[..len]) else {
                    trace!("Dropping {} byte non-frame from {}", len, from);
                    continue;
                };
                if tx.try_send(frame).is_err() {
                    trace!("Keep-alive event queue full, dropping frame");
                }
                inner.wake.notify_one();
            }
            Err(NatError::TransportClosed) => break,
            Err(e) => trace!("Keep-alive receive error: {}", e),
        }
    }
}

async fn control_loop(pair: Pair, mut rx: mpsc::Receiver<PingFrame>, cancel: CancellationToken) {
    let mut ticker = interval(pair.inner.config.ping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First ping one interval after start
    ticker.reset();

    loop {
        let tick = tokio::select! {
            _ = pair.inner.done.cancelled() => break,
            _ = cancel.cancelled() => {
                pair.expire("keep-alive cancelled");
                break;
            }
            _ = ticker.tick() => true,
            _ = pair.inner.wake.notified() => false,
        };

        while let Ok(frame) = rx.try_recv() {
            pair.handle_frame(frame).await;
        }

        pair.evaluate(tick).await;
    }

    trace!("Keep-alive stopped for pair {}", pair.nonce());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Endpoint, PeerEndpoint};
    use std::time::SystemTime;

    fn fast_config() -> PairConfig {
        PairConfig {
            ping_interval_ms: 50,
            no_ping_timeout_ms: 300,
            ping_lifespan_ms: 600,
            lock_timeout_ms: 500,
            max_ping_fails: 10,
        }
    }

    async fn lone_pair(is_pinger: bool, config: PairConfig) -> Pair {
        pair_toward(9, is_pinger, config).await
    }

    /// Pair on loopback whose remote is 127.0.0.1:`remote_port`
    async fn pair_toward(remote_port: u16, is_pinger: bool, config: PairConfig) -> Pair {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let me = PeerId::random();
        let traversed = TraversedPortPair {
            peer_a: PeerEndpoint {
                identity: me,
                endpoint: transport.local_addr().into(),
            },
            peer_b: PeerEndpoint {
                identity: PeerId::random(),
                endpoint: Endpoint::new("127.0.0.1".parse().unwrap(), remote_port),
            },
            created_at: SystemTime::now(),
            nonce: Nonce::random(),
        };
        Pair::with_transport(traversed, me, is_pinger, transport, config)
    }

    #[test]
    fn test_state_from_u8() {
        for state in [
            PairState::Idle,
            PairState::InLocking,
            PairState::Locked,
            PairState::Expired,
        ] {
            assert_eq!(PairState::from_u8(state as u8), state);
        }
        assert!(PairState::Locked.is_terminal());
        assert!(!PairState::InLocking.is_terminal());
    }

    #[tokio::test]
    async fn test_begin_lock_once() {
        let pair = lone_pair(false, fast_config()).await;
        assert!(pair.begin_lock());
        assert!(!pair.begin_lock());
        assert_eq!(pair.state(), PairState::InLocking);
    }

    #[tokio::test]
    async fn test_wait_locked_without_keep_alive() {
        let pair = lone_pair(false, fast_config()).await;
        assert!(pair.begin_lock());

        let cancel = CancellationToken::new();
        pair.wait_locked(&cancel).await.unwrap();
        assert!(pair.is_locked());
    }

    #[tokio::test]
    async fn test_wait_locked_requires_lock() {
        let pair = lone_pair(false, fast_config()).await;
        let cancel = CancellationToken::new();
        assert!(matches!(
            pair.wait_locked(&cancel).await,
            Err(NatError::PairCantLock)
        ));
    }

    #[tokio::test]
    async fn test_expire_is_idempotent() {
        let pair = lone_pair(true, fast_config()).await;
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        pair.set_on_expire(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pair.expire("first");
        pair.expire("second");

        assert!(pair.is_expired());
        assert!(!pair.begin_lock());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expire_keeps_locked_state() {
        let pair = lone_pair(false, fast_config()).await;
        assert!(pair.begin_lock());
        pair.wait_locked(&CancellationToken::new()).await.unwrap();

        pair.expire("retired");
        assert!(pair.is_locked());
    }

    #[tokio::test]
    async fn test_lock_with_stale_ping_times_out() {
        let mut config = fast_config();
        config.ping_lifespan_ms = 5_000;
        let pair = lone_pair(true, config).await;
        pair.inner.pings.lock().insert(Nonce(1), Instant::now());
        assert!(pair.begin_lock());

        let res = pair.wait_locked(&CancellationToken::new()).await;
        assert!(matches!(res, Err(NatError::Timeout(_))));
        assert!(pair.is_expired());
    }

    #[tokio::test]
    async fn test_wait_locked_cancelled() {
        let pair = lone_pair(true, fast_config()).await;
        pair.inner.pings.lock().insert(Nonce(1), Instant::now());
        assert!(pair.begin_lock());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            pair.wait_locked(&cancel).await,
            Err(NatError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_silent_peer_expires() {
        let pair = lone_pair(true, fast_config()).await;
        pair.start_keep_alive(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(pair.is_expired());
    }

    #[tokio::test]
    async fn test_keep_alive_cancel_expires() {
        let mut config = fast_config();
        config.no_ping_timeout_ms = 3_000;
        let pair = lone_pair(true, config).await;
        let cancel = CancellationToken::new();
        pair.start_keep_alive(cancel.clone());

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pair.is_expired());
    }

    #[tokio::test]
    async fn test_ping_failures_expire_pair() {
        let config = PairConfig {
            max_ping_fails: 2,
            ..fast_config()
        };
        // Sends to port 0 are rejected by the kernel
        let pair = pair_toward(0, true, config).await;

        pair.send_ping().await;
        assert_eq!(pair.inner.ping_fails.load(Ordering::Relaxed), 1);
        assert_eq!(pair.in_flight_pings(), 0, "failed ping is not tracked");
        assert!(pair.is_idle());

        pair.send_ping().await;
        assert!(pair.is_expired());
    }

    #[tokio::test]
    async fn test_successful_ping_resets_failures() {
        let config = PairConfig {
            max_ping_fails: 2,
            ..fast_config()
        };
        let pair = lone_pair(true, config).await;
        pair.inner.ping_fails.store(1, Ordering::Relaxed);

        pair.send_ping().await;
        assert_eq!(pair.inner.ping_fails.load(Ordering::Relaxed), 0);
        assert_eq!(pair.in_flight_pings(), 1);
        assert!(pair.is_idle());
    }

    #[tokio::test]
    async fn test_keep_alive_ping_failures_expire_before_timeout() {
        let config = PairConfig {
            no_ping_timeout_ms: 5_000,
            max_ping_fails: 3,
            ..fast_config()
        };
        let pair = pair_toward(0, true, config).await;
        pair.start_keep_alive(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(pair.is_expired());
    }

    #[tokio::test]
    async fn test_first_ping_waits_one_interval() {
        let pair = lone_pair(true, fast_config()).await;
        pair.start_keep_alive(CancellationToken::new());

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(pair.in_flight_pings(), 0);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(pair.in_flight_pings(), 1);
        pair.expire("test done");
    }
}
