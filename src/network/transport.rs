//! UDP transport layer
//!
//! A cloneable socket handle with an explicit close. Closing any clone
//! unblocks every pending receive on every clone; the socket itself is
//! released once the last clone is dropped.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::error::NatError;

/// UDP transport shared between a protocol run and its worker tasks
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    closed: CancellationToken,
}

impl UdpTransport {
    /// Bind to a local address with SO_REUSEADDR enabled
    pub async fn bind(addr: SocketAddr) -> Result<Self, NatError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        // Allow quick rebind of a port just released by a puncher or pair
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            closed: CancellationToken::new(),
        })
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a datagram to a remote address
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize, NatError> {
        if self.is_closed() {
            return Err(NatError::TransportClosed);
        }
        let n = self.socket.send_to(data, addr).await?;
        trace!("Sent {} bytes to {}", n, addr);
        Ok(n)
    }

    /// Receive a datagram; fails with `TransportClosed` once closed
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), NatError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(NatError::TransportClosed),
            res = self.socket.recv_from(buf) => {
                let (len, addr) = res?;
                trace!("Received {} bytes from {}", len, addr);
                Ok((len, addr))
            }
        }
    }

    /// Close the transport for every clone
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            debug!("Closing UDP transport {}", self.local_addr);
            self.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the transport is closed
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}
