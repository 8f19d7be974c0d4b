//! Public IP discovery
//!
//! The address advertised in Offer/Answer comes from a [`PublicIpSource`].
//! Sources return candidates in preference order; [`first_usable`] picks
//! the one to advertise.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::error::NatError;
use super::stun::{StunClient, DEFAULT_STUN_SERVERS};

/// Source of candidate public IP addresses
#[async_trait]
pub trait PublicIpSource: Send + Sync {
    async fn candidates(&self) -> Result<Vec<IpAddr>, NatError>;
}

/// First candidate that can be advertised to a peer
pub fn first_usable(candidates: &[IpAddr], allow_loopback: bool) -> Option<IpAddr> {
    candidates.iter().copied().find(|ip| {
        !ip.is_unspecified() && !ip.is_multicast() && (allow_loopback || !ip.is_loopback())
    })
}

/// Fixed list of addresses, e.g. from the command line
#[derive(Debug, Clone, Default)]
pub struct StaticIps {
    ips: Vec<IpAddr>,
}

impl StaticIps {
    pub fn new(ips: Vec<IpAddr>) -> Self {
        Self { ips }
    }
}

#[async_trait]
impl PublicIpSource for StaticIps {
    async fn candidates(&self) -> Result<Vec<IpAddr>, NatError> {
        Ok(self.ips.clone())
    }
}

/// Addresses of the local network interfaces, default route first
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalInterfaces;

#[async_trait]
impl PublicIpSource for LocalInterfaces {
    async fn candidates(&self) -> Result<Vec<IpAddr>, NatError> {
        let mut ips = Vec::new();

        match local_ip_address::local_ip() {
            Ok(ip) => ips.push(ip),
            Err(e) => debug!("No default-route address: {}", e),
        }

        match local_ip_address::list_afinet_netifas() {
            Ok(interfaces) => {
                for (name, ip) in interfaces {
                    if !ips.contains(&ip) {
                        debug!("Interface {} has {}", name, ip);
                        ips.push(ip);
                    }
                }
            }
            Err(e) => warn!("Interface enumeration failed: {}", e),
        }

        if ips.is_empty() {
            return Err(NatError::NoPublicIp);
        }
        Ok(ips)
    }
}

/// Address reflected by a STUN server
#[derive(Debug, Clone)]
pub struct StunDiscovery {
    servers: Vec<String>,
    timeout: Duration,
}

impl StunDiscovery {
    pub fn new(servers: Vec<String>, timeout: Duration) -> Self {
        Self { servers, timeout }
    }
}

impl Default for StunDiscovery {
    fn default() -> Self {
        Self::new(
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(3),
        )
    }
}

#[async_trait]
impl PublicIpSource for StunDiscovery {
    async fn candidates(&self) -> Result<Vec<IpAddr>, NatError> {
        let client = StunClient::bind_ephemeral(self.timeout).await?;
        let result = client.discover(&self.servers).await?;
        Ok(vec![result.mapped_address.ip()])
    }
}

/// Try sources in order; the first that yields a usable address wins
pub struct Chained {
    sources: Vec<Box<dyn PublicIpSource>>,
}

impl Chained {
    pub fn new(sources: Vec<Box<dyn PublicIpSource>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl PublicIpSource for Chained {
    async fn candidates(&self) -> Result<Vec<IpAddr>, NatError> {
        let mut all = Vec::new();
        for source in &self.sources {
            match source.candidates().await {
                Ok(ips) => {
                    for ip in ips {
                        if !all.contains(&ip) {
                            all.push(ip);
                        }
                    }
                }
                Err(e) => debug!("Public IP source failed: {}", e),
            }
        }
        if all.is_empty() {
            return Err(NatError::NoPublicIp);
        }
        Ok(all)
    }
}
