//! Cone NAT hole puncher
//!
//! Bursts the session token from a single local socket to a window of
//! candidate ports around the peer-reported port, while listening for the
//! peer's token. The first datagram carrying exactly the session token from
//! one of the candidate addresses reveals the peer's mapped port.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::PuncherConfig;
use crate::protocol::{Session, SESSION_LEN};

use super::error::NatError;
use super::transport::UdpTransport;

/// Outcome of a successful punch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PunchResult {
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

impl PunchResult {
    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_ip, self.remote_port)
    }
}

/// Candidate ports around `center`: the centre first, then alternating
/// below and above it, clamped to [1, 65535].
pub fn candidate_ports(center: u16, spread: u16) -> Vec<u16> {
    let center = i32::from(center);
    let spread = i32::from(spread);
    let mut ports = Vec::with_capacity(1 + 2 * spread as usize);

    let mut add = |p: i32| {
        if (1..=65535).contains(&p) {
            ports.push(p as u16);
        }
    };

    add(center);
    for d in 1..=spread {
        add(center - d);
        add(center + d);
    }
    ports
}

/// Hole puncher owning one UDP socket per attempt
pub struct ConePuncher {
    session: Option<Session>,
    config: PuncherConfig,
    transport: Mutex<Option<UdpTransport>>,
}

impl ConePuncher {
    /// Create a puncher without a session; `open` fails until one is set
    pub fn new(config: PuncherConfig) -> Self {
        Self {
            session: None,
            config,
            transport: Mutex::new(None),
        }
    }

    /// Create a puncher with a freshly generated session
    pub fn generate(config: PuncherConfig) -> Self {
        Self::with_session(config, Session::random())
    }

    /// Create a puncher seeded with the initiator's session
    pub fn with_session(config: PuncherConfig, session: Session) -> Self {
        Self {
            session: Some(session),
            config,
            transport: Mutex::new(None),
        }
    }

    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn session(&self) -> Option<Session> {
        self.session
    }

    /// Local port of the open socket
    pub fn local_port(&self) -> Option<u16> {
        self.transport
            .lock()
            .as_ref()
            .map(|t| t.local_addr().port())
    }

    /// Bind the punch socket; returns the local port. Idempotent while open.
    pub async fn open(&self) -> Result<u16, NatError> {
        if self.session.is_none() {
            return Err(NatError::SessionRequired);
        }

        if let Some(port) = self.open_port() {
            return Ok(port);
        }

        let transport = UdpTransport::bind(SocketAddr::new(self.config.bind_ip, 0)).await?;

        let mut slot = self.transport.lock();
        match slot.as_ref() {
            // Another caller opened meanwhile; keep theirs
            Some(existing) if !existing.is_closed() => {
                transport.close();
                Ok(existing.local_addr().port())
            }
            _ => {
                let port = transport.local_addr().port();
                *slot = Some(transport);
                Ok(port)
            }
        }
    }

    fn open_port(&self) -> Option<u16> {
        self.transport
            .lock()
            .as_ref()
            .filter(|t| !t.is_closed())
            .map(|t| t.local_addr().port())
    }

    /// Punch toward the peer-reported endpoint
    pub async fn hole_punch(
        &self,
        cancel: &CancellationToken,
        peer_ip: IpAddr,
        peer_port: u16,
    ) -> Result<PunchResult, NatError> {
        if peer_ip.is_unspecified() {
            return Err(NatError::NoCandidates);
        }
        let session = self.session.ok_or(NatError::SessionRequired)?;

        self.open().await?;
        let transport = self
            .transport
            .lock()
            .clone()
            .ok_or(NatError::TransportClosed)?;
        let local_port = transport.local_addr().port();

        let candidates: Vec<SocketAddr> = candidate_ports(peer_port, self.config.port_spread)
            .into_iter()
            .map(|port| SocketAddr::new(peer_ip, port))
            .collect();
        if candidates.is_empty() {
            return Err(NatError::NoCandidates);
        }

        info!(
            "Punching {}:{} (+/-{} ports) from local port {}",
            peer_ip, peer_port, self.config.port_spread, local_port
        );

        let attempt = cancel.child_token();
        let (found_tx, found_rx) = oneshot::channel();

        let receiver = tokio::spawn(receive_probe(
            transport.clone(),
            session,
            candidates.iter().copied().collect(),
            attempt.clone(),
            found_tx,
        ));
        let sender = tokio::spawn(send_bursts(
            transport.clone(),
            session,
            candidates,
            self.config.clone(),
            attempt.clone(),
        ));

        let outcome = tokio::select! {
            found = found_rx => match found {
                Ok(addr) => Ok(addr),
                // Receiver stopped without a match: the transport was closed
                Err(_) => Err(NatError::TransportClosed),
            },
            _ = tokio::time::sleep(self.config.punch_timeout()) => Err(NatError::Timeout("hole punch")),
            _ = cancel.cancelled() => Err(NatError::Cancelled),
            _ = transport.closed() => Err(NatError::TransportClosed),
        };

        attempt.cancel();
        let _ = sender.await;
        let _ = receiver.await;

        match outcome {
            Ok(addr) => {
                info!("Punch succeeded: peer reachable at {}", addr);
                Ok(PunchResult {
                    local_port,
                    remote_ip: addr.ip(),
                    remote_port: addr.port(),
                })
            }
            Err(e) => {
                warn!("Punch toward {}:{} failed: {}", peer_ip, peer_port, e);
                if e.is_timeout() {
                    self.close();
                }
                Err(e)
            }
        }
    }

    /// Hand the punched socket over; the puncher no longer owns it
    pub fn take_transport(&self) -> Option<UdpTransport> {
        self.transport.lock().take().filter(|t| !t.is_closed())
    }

    /// Release the socket; in-flight punches return `TransportClosed`
    pub fn close(&self) {
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
    }
}

impl Drop for ConePuncher {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_probe(
    transport: UdpTransport,
    session: Session,
    candidates: HashSet<SocketAddr>,
    cancel: CancellationToken,
    found: oneshot::Sender<SocketAddr>,
) {
    let mut buf = [0u8; 1500];
    loop {
        let res = tokio::select! {
            _ = cancel.cancelled() => return,
            res = transport.recv_from(&mut buf) => res,
        };

        match res {
            Ok((len, from)) => {
                if len == SESSION_LEN
                    && &buf[..len] == session.as_bytes()
                    && candidates.contains(&from)
                {
                    debug!("Probe received from {}", from);
                    let _ = found.send(from);
                    return;
                }
                trace!("Ignoring {} bytes from {}", len, from);
            }
            Err(NatError::TransportClosed) => return,
            // ICMP unreachable surfaces here on some platforms; keep listening
            Err(e) => trace!("Probe receive error: {}", e),
        }
    }
}

async fn send_bursts(
    transport: UdpTransport,
    session: Session,
    candidates: Vec<SocketAddr>,
    config: PuncherConfig,
    cancel: CancellationToken,
) {
    let jitter_ms = config.burst_jitter_ms;
    let mut bursts = 0u64;

    loop {
        for _ in 0..config.packets_per_burst {
            for addr in &candidates {
                if let Err(NatError::TransportClosed) =
                    transport.send_to(session.as_bytes(), *addr).await
                {
                    return;
                }
            }
        }
        bursts += 1;

        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Sent {} bursts to {} candidates", bursts, candidates.len());
                return;
            }
            _ = tokio::time::sleep(config.burst_interval() + jitter) => {}
        }
    }
}
