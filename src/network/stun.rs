//! STUN binding client (RFC 5389)
//!
//! Used as a public-IP source: the server reflects the address it saw the
//! request come from.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::NatError;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;

const MAPPED_ADDRESS: u16 = 0x0001;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.l.google.com:19302",
    "stun1.l.google.com:19302",
    "stun.cloudflare.com:3478",
];

/// Mapping reported by a STUN server
#[derive(Debug, Clone)]
pub struct StunResult {
    pub mapped_address: SocketAddr,
    pub server: String,
}

pub struct StunClient {
    socket: UdpSocket,
    timeout: Duration,
}

impl StunClient {
    pub fn new(socket: UdpSocket) -> Self {
        Self::with_timeout(socket, Duration::from_secs(3))
    }

    pub fn with_timeout(socket: UdpSocket, timeout: Duration) -> Self {
        Self { socket, timeout }
    }

    /// Bind an ephemeral IPv4 socket for discovery
    pub async fn bind_ephemeral(timeout: Duration) -> Result<Self, NatError> {
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        Ok(Self::with_timeout(socket, timeout))
    }

    /// Try each server in turn until one answers
    pub async fn discover<S: AsRef<str>>(&self, servers: &[S]) -> Result<StunResult, NatError> {
        for server in servers {
            match self.binding_request(server.as_ref()).await {
                Ok(result) => return Ok(result),
                Err(e) => warn!("STUN request to {} failed: {}", server.as_ref(), e),
            }
        }
        Err(NatError::StunFailed("all STUN servers failed".to_string()))
    }

    pub async fn binding_request(&self, server: &str) -> Result<StunResult, NatError> {
        let server_addr = tokio::net::lookup_host(server)
            .await
            .map_err(|e| NatError::StunFailed(format!("DNS lookup failed: {}", e)))?
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| NatError::StunFailed(format!("no IPv4 address for {}", server)))?;

        let transaction_id: [u8; 12] = rand::random();
        self.socket
            .send_to(&build_binding_request(&transaction_id), server_addr)
            .await?;
        debug!("STUN binding request sent to {}", server_addr);

        let mut buf = [0u8; 576];
        let mapped = timeout(self.timeout, async {
            loop {
                let (len, from) = self.socket.recv_from(&mut buf).await?;
                if from != server_addr {
                    continue;
                }
                match parse_binding_response(&buf[..len], &transaction_id) {
                    Ok(addr) => return Ok::<_, NatError>(addr),
                    // Stale answers to an earlier request share the socket
                    Err(e) => debug!("Ignoring STUN packet from {}: {}", from, e),
                }
            }
        })
        .await
        .map_err(|_| NatError::Timeout("STUN response"))??;

        info!("STUN server {} reports {}", server, mapped);
        Ok(StunResult {
            mapped_address: mapped,
            server: server.to_string(),
        })
    }
}

fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg
}

fn stun_err(msg: impl Into<String>) -> NatError {
    NatError::StunFailed(msg.into())
}

fn parse_binding_response(data: &[u8], transaction_id: &[u8; 12]) -> Result<SocketAddr, NatError> {
    if data.len() < HEADER_LEN {
        return Err(stun_err("response too short"));
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(stun_err(format!("unexpected message type 0x{:04x}", msg_type)));
    }
    if u32::from_be_bytes([data[4], data[5], data[6], data[7]]) != MAGIC_COOKIE {
        return Err(stun_err("invalid magic cookie"));
    }
    if &data[8..HEADER_LEN] != transaction_id {
        return Err(stun_err("transaction id mismatch"));
    }

    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let end = HEADER_LEN + msg_len;
    if data.len() < end {
        return Err(stun_err("message truncated"));
    }

    // XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present
    let mut fallback = None;
    let mut offset = HEADER_LEN;
    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_end = offset + 4 + attr_len;
        if value_end > end {
            break;
        }
        let value = &data[offset + 4..value_end];

        match attr_type {
            XOR_MAPPED_ADDRESS => return parse_address(value, Some(transaction_id)),
            MAPPED_ADDRESS if fallback.is_none() => fallback = Some(parse_address(value, None)),
            _ => {}
        }

        offset += 4 + ((attr_len + 3) & !3);
    }

    fallback.unwrap_or_else(|| Err(stun_err("no mapped address in response")))
}

/// Decode a (XOR-)MAPPED-ADDRESS value; `xor` carries the transaction id
fn parse_address(data: &[u8], xor: Option<&[u8; 12]>) -> Result<SocketAddr, NatError> {
    if data.len() < 4 {
        return Err(stun_err("address attribute too short"));
    }

    let family = data[1];
    let mut port = u16::from_be_bytes([data[2], data[3]]);
    if xor.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        0x01 => {
            let raw: [u8; 4] = data
                .get(4..8)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| stun_err("IPv4 address too short"))?;
            let mut addr = u32::from_be_bytes(raw);
            if xor.is_some() {
                addr ^= MAGIC_COOKIE;
            }
            IpAddr::V4(Ipv4Addr::from(addr))
        }
        0x02 => {
            let mut raw: [u8; 16] = data
                .get(4..20)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| stun_err("IPv6 address too short"))?;
            if let Some(txn) = xor {
                let mut key = [0u8; 16];
                key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
                key[4..].copy_from_slice(txn);
                for (b, k) in raw.iter_mut().zip(key) {
                    *b ^= k;
                }
            }
            IpAddr::V6(Ipv6Addr::from(raw))
        }
        other => return Err(stun_err(format!("unknown address family {}", other))),
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(txn: &[u8; 12], attrs: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (ty, value) in attrs {
            body.extend_from_slice(&ty.to_be_bytes());
            body.extend_from_slice(&(value.len() as u16).to_be_bytes());
            body.extend_from_slice(value);
            while body.len() % 4 != 0 {
                body.push(0);
            }
        }
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        msg.extend_from_slice(&(body.len() as u16).to_be_bytes());
        msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(txn);
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn test_build_binding_request() {
        let txn = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let request = build_binding_request(&txn);

        assert_eq!(request.len(), HEADER_LEN);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&request[8..20], &txn);
    }

    #[test]
    fn test_xor_mapped_ipv4() {
        // 192.168.1.100:5000 xor'd with the magic cookie
        let value = vec![0x00, 0x01, 0x32, 0x9A, 0xE1, 0xBA, 0xA5, 0x26];
        let txn = [7u8; 12];
        let msg = response(&txn, &[(XOR_MAPPED_ADDRESS, value)]);

        let addr = parse_binding_response(&msg, &txn).unwrap();
        assert_eq!(addr, "192.168.1.100:5000".parse().unwrap());
    }

    #[test]
    fn test_xor_mapped_ipv6() {
        let txn = [0x5a; 12];
        let expected: SocketAddr = "[2001:db8::1]:40000".parse().unwrap();

        let mut key = [0u8; 16];
        key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        key[4..].copy_from_slice(&txn);
        let octets = match expected.ip() {
            IpAddr::V6(ip) => ip.octets(),
            IpAddr::V4(_) => unreachable!(),
        };

        let mut value = vec![0x00, 0x02];
        value.extend_from_slice(&(40000u16 ^ 0x2112).to_be_bytes());
        value.extend(octets.iter().zip(key).map(|(b, k)| b ^ k));

        let msg = response(&txn, &[(XOR_MAPPED_ADDRESS, value)]);
        assert_eq!(parse_binding_response(&msg, &txn).unwrap(), expected);
    }

    #[test]
    fn test_plain_mapped_address_fallback() {
        let txn = [1u8; 12];
        let value = vec![0x00, 0x01, 0x13, 0x88, 203, 0, 113, 9];
        let msg = response(&txn, &[(0x8022, b"test".to_vec()), (MAPPED_ADDRESS, value)]);

        let addr = parse_binding_response(&msg, &txn).unwrap();
        assert_eq!(addr, "203.0.113.9:5000".parse().unwrap());
    }

    #[test]
    fn test_transaction_mismatch() {
        let msg = response(&[1u8; 12], &[]);
        assert!(matches!(
            parse_binding_response(&msg, &[2u8; 12]),
            Err(NatError::StunFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_binding_request_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, HEADER_LEN);
            let txn: [u8; 12] = buf[8..20].try_into().unwrap();
            let value = vec![0x00, 0x01, 0x13, 0x88, 198, 51, 100, 4];
            server
                .send_to(&response(&txn, &[(MAPPED_ADDRESS, value)]), from)
                .await
                .unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = StunClient::with_timeout(socket, Duration::from_secs(1));
        let result = client
            .binding_request(&server_addr.to_string())
            .await
            .unwrap();
        assert_eq!(result.mapped_address, "198.51.100.4:5000".parse().unwrap());
    }
}
