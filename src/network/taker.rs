//! Pair handover protocol
//!
//! Lets one side take exclusive ownership of a pooled pair. Both sides lock
//! their view of the pair (silencing keep-alive), then the taker asks the
//! giver to retire its view.
//!
//! ```text
//! Taker                      Giver
//!   begin_lock()
//!   Lock{id}          --->
//!                              begin_lock(), wait_locked()
//!                     <---   LockOk{id} | LockBusy{id}
//!   wait_locked()
//!   Take{id}          --->
//!                              expire()
//!                     <---   TakeOk{id} | TakeErr{id}
//!   expire()
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HandoverConfig;
use crate::protocol::{HandoverKind, HandoverSignal, Signal, TraversedPortPair};

use super::channel::{receive_within, send_within, SignalChannel};
use super::error::NatError;
use super::pair::Pair;

/// Bound on best-effort replies sent while aborting
const ABORT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverRole {
    /// Initiates the handover and ends up owning the pair
    Taker,
    /// Answers the handover and gives its view of the pair up
    Giver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandoverState {
    LockExchange = 0,
    TakeExchange = 1,
    Done = 2,
    Failed = 3,
}

impl HandoverState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::LockExchange,
            1 => Self::TakeExchange,
            2 => Self::Done,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for HandoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LockExchange => "lock_exchange",
            Self::TakeExchange => "take_exchange",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One handover run over one pair
pub struct PairTaker {
    role: HandoverRole,
    pair: Pair,
    take_timeout: Duration,
    state: AtomicU8,
}

impl PairTaker {
    pub fn new(role: HandoverRole, pair: Pair, config: &HandoverConfig) -> Self {
        Self {
            role,
            pair,
            take_timeout: config.take_timeout(),
            state: AtomicU8::new(HandoverState::LockExchange as u8),
        }
    }

    pub fn role(&self) -> HandoverRole {
        self.role
    }

    pub fn state(&self) -> HandoverState {
        HandoverState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn pair(&self) -> &Pair {
        &self.pair
    }

    fn set_state(&self, state: HandoverState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Run the handover; returns the retired pair on success
    pub async fn run<C>(
        &self,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversedPortPair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        match self.role {
            HandoverRole::Taker => self.run_taker(channel, cancel).await,
            HandoverRole::Giver => self.run_giver(channel, None, cancel).await,
        }
    }

    /// Run the giver side with a Lock signal the caller already read
    pub async fn run_with_lock<C>(
        &self,
        channel: &mut C,
        lock: HandoverSignal,
        cancel: &CancellationToken,
    ) -> Result<TraversedPortPair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        self.run_giver(channel, Some(lock), cancel).await
    }

    async fn run_taker<C>(
        &self,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<TraversedPortPair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        self.set_state(HandoverState::LockExchange);
        if !self.pair.begin_lock() {
            self.set_state(HandoverState::Failed);
            return Err(NatError::PairBusy);
        }

        let res = self.taker_exchange(channel, cancel).await;
        self.finish(res)
    }

    async fn taker_exchange<C>(
        &self,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<(), NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let lock_timeout = self.pair.lock_timeout();

        self.send(channel, HandoverKind::Lock, lock_timeout, cancel)
            .await?;
        match self.read(channel, lock_timeout, cancel, "lock reply").await? {
            HandoverKind::LockOk => {}
            HandoverKind::LockBusy => return Err(NatError::PairBusy),
            other => return Err(NatError::unexpected("lock_ok", other)),
        }
        self.pair.wait_locked(cancel).await?;

        self.set_state(HandoverState::TakeExchange);
        self.send(channel, HandoverKind::Take, self.take_timeout, cancel)
            .await?;
        match self.read(channel, self.take_timeout, cancel, "take reply").await? {
            HandoverKind::TakeOk => {
                self.pair.expire("taken over");
                Ok(())
            }
            HandoverKind::TakeErr => Err(NatError::TakeRejected),
            other => Err(NatError::unexpected("take_ok", other)),
        }
    }

    async fn run_giver<C>(
        &self,
        channel: &mut C,
        lock: Option<HandoverSignal>,
        cancel: &CancellationToken,
    ) -> Result<TraversedPortPair, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        self.set_state(HandoverState::LockExchange);
        let lock_timeout = self.pair.lock_timeout();

        let kind = match lock {
            Some(sig) => self.check(sig),
            None => self.read(channel, lock_timeout, cancel, "lock").await,
        };
        let kind = kind.and_then(|kind| match kind {
            HandoverKind::Lock => Ok(kind),
            other => Err(NatError::unexpected("lock", other)),
        });
        if let Err(e) = kind {
            self.set_state(HandoverState::Failed);
            return Err(e);
        }

        if !self.pair.begin_lock() {
            debug!("Pair {} busy, refusing lock", self.pair.nonce());
            self.set_state(HandoverState::Failed);
            self.reply_best_effort(channel, HandoverKind::LockBusy).await;
            return Err(NatError::PairBusy);
        }

        let res = self.giver_exchange(channel, cancel).await;
        self.finish(res)
    }

    async fn giver_exchange<C>(
        &self,
        channel: &mut C,
        cancel: &CancellationToken,
    ) -> Result<(), NatError>
    where
        C: SignalChannel + ?Sized,
    {
        if let Err(e) = self.pair.wait_locked(cancel).await {
            if !matches!(e, NatError::Cancelled) {
                let message = format!("lock failed: {}", e);
                let _ = tokio::time::timeout(
                    ABORT_REPLY_TIMEOUT,
                    channel.send(Signal::Error { message }),
                )
                .await;
            }
            return Err(e);
        }
        self.send(channel, HandoverKind::LockOk, self.pair.lock_timeout(), cancel)
            .await?;

        self.set_state(HandoverState::TakeExchange);
        // The taker may still be draining its own pings before it sends Take
        let take_wait = self.pair.lock_timeout() + self.take_timeout;
        let kind = match self.read(channel, take_wait, cancel, "take").await {
            Ok(HandoverKind::Take) => HandoverKind::Take,
            Ok(other) => {
                self.reply_best_effort(channel, HandoverKind::TakeErr).await;
                return Err(NatError::unexpected("take", other));
            }
            Err(e) => {
                if e.is_timeout() || e.is_protocol() {
                    self.reply_best_effort(channel, HandoverKind::TakeErr).await;
                }
                return Err(e);
            }
        };
        debug!("Pair {} received {}", self.pair.nonce(), kind);

        self.pair.expire("handed over");
        self.send(channel, HandoverKind::TakeOk, self.take_timeout, cancel)
            .await
    }

    fn finish(&self, res: Result<(), NatError>) -> Result<TraversedPortPair, NatError> {
        match res {
            Ok(()) => {
                self.set_state(HandoverState::Done);
                info!(
                    "Handover of pair {} done ({:?})",
                    self.pair.nonce(),
                    self.role
                );
                Ok(self.pair.traversed().clone())
            }
            Err(e) => {
                self.set_state(HandoverState::Failed);
                warn!(
                    "Handover of pair {} failed ({:?}): {}",
                    self.pair.nonce(),
                    self.role,
                    e
                );
                self.pair.expire("handover failed");
                Err(e)
            }
        }
    }

    fn check(&self, sig: HandoverSignal) -> Result<HandoverKind, NatError> {
        let expected = self.pair.nonce();
        if sig.pair_id != expected {
            return Err(NatError::PairIdMismatch {
                expected,
                got: sig.pair_id,
            });
        }
        Ok(sig.kind)
    }

    async fn read<C>(
        &self,
        channel: &mut C,
        timeout: Duration,
        cancel: &CancellationToken,
        what: &'static str,
    ) -> Result<HandoverKind, NatError>
    where
        C: SignalChannel + ?Sized,
    {
        match receive_within(channel, timeout, cancel, what).await? {
            Signal::Handover(sig) => self.check(sig),
            Signal::Error { message } => Err(NatError::Remote(message)),
            other => Err(NatError::unexpected("handover", other.name())),
        }
    }

    async fn send<C>(
        &self,
        channel: &mut C,
        kind: HandoverKind,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), NatError>
    where
        C: SignalChannel + ?Sized,
    {
        let signal = HandoverSignal::new(kind, self.pair.nonce());
        send_within(channel, signal.into(), timeout, cancel, "handover send").await
    }

    async fn reply_best_effort<C>(&self, channel: &mut C, kind: HandoverKind)
    where
        C: SignalChannel + ?Sized,
    {
        let signal = HandoverSignal::new(kind, self.pair.nonce());
        match tokio::time::timeout(ABORT_REPLY_TIMEOUT, channel.send(signal.into())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to send {}: {}", kind, e),
            Err(_) => debug!("Timed out sending {}", kind),
        }
    }
}
