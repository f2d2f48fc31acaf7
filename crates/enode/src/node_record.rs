//! The `enode://` URL scheme.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    num::ParseIntError,
    str::FromStr,
};

use secp256k1::SecretKey;

use crate::{id_from_secret, PeerId};

/// A complete node address: who the node is and where it listens.
///
/// The textual form is
/// `enode://<128 hex chars>@<ip>:<tcp-port>[?discport=<udp-port>]`, with the
/// `discport` query elided when the UDP port equals the TCP port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeRecord {
    /// The IP address the node listens on.
    pub address: IpAddr,
    /// TCP port used for the RLPx session.
    pub tcp_port: u16,
    /// UDP port used for discovery.
    pub udp_port: u16,
    /// The node's public identity.
    pub id: PeerId,
}

impl NodeRecord {
    /// Creates a record with equal TCP and UDP ports.
    pub fn new(addr: SocketAddr, id: PeerId) -> Self {
        Self { address: addr.ip(), tcp_port: addr.port(), udp_port: addr.port(), id }
    }

    /// Derives the node id from the given secret key.
    pub fn from_secret_key(addr: SocketAddr, secret: &SecretKey) -> Self {
        Self::new(addr, id_from_secret(secret))
    }

    /// The TCP endpoint of this record.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }

    /// The UDP endpoint of this record.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "enode://{}@", alloy_primitives::hex::encode(self.id.as_slice()))?;
        match self.address {
            IpAddr::V4(ip) => write!(f, "{ip}")?,
            IpAddr::V6(ip) => write!(f, "[{ip}]")?,
        }
        write!(f, ":{}", self.tcp_port)?;
        if self.udp_port != self.tcp_port {
            write!(f, "?discport={}", self.udp_port)?;
        }
        Ok(())
    }
}

/// Possible failures when parsing an enode URL.
#[derive(Debug, thiserror::Error)]
pub enum NodeRecordParseError {
    /// The URL does not start with `enode://`.
    #[error("invalid url scheme, expected 'enode'")]
    UnknownScheme,
    /// The node id is not 128 hex characters.
    #[error("invalid node id: {0}")]
    InvalidId(String),
    /// The host is missing or not a literal IP address.
    #[error("invalid ip address: {0}")]
    InvalidIp(String),
    /// A port could not be parsed.
    #[error("invalid port: {0}")]
    InvalidPort(#[from] ParseIntError),
    /// The `@` or `:` separators are missing.
    #[error("malformed enode url: {0}")]
    Malformed(String),
}

impl FromStr for NodeRecord {
    type Err = NodeRecordParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix("enode://").ok_or(NodeRecordParseError::UnknownScheme)?;
        let (id_part, addr_part) =
            rest.split_once('@').ok_or_else(|| NodeRecordParseError::Malformed(s.to_string()))?;

        let mut id_bytes = [0u8; 64];
        if id_part.len() != 128 {
            return Err(NodeRecordParseError::InvalidId(id_part.to_string()))
        }
        alloy_primitives::hex::decode_to_slice(id_part, &mut id_bytes)
            .map_err(|_| NodeRecordParseError::InvalidId(id_part.to_string()))?;

        let (host_port, query) = match addr_part.split_once('?') {
            Some((hp, q)) => (hp, Some(q)),
            None => (addr_part, None),
        };
        let (host, port) = host_port
            .rsplit_once(':')
            .ok_or_else(|| NodeRecordParseError::Malformed(s.to_string()))?;
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        let address: IpAddr =
            host.parse().map_err(|_| NodeRecordParseError::InvalidIp(host.to_string()))?;
        let tcp_port: u16 = port.parse()?;

        let mut udp_port = tcp_port;
        if let Some(query) = query {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("discport=") {
                    udp_port = value.parse()?;
                }
            }
        }

        Ok(Self { address, tcp_port, udp_port, id: PeerId::from_slice(&id_bytes) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "1dd9d65c4552b5eb43d5ad55a2ee3f56c6cbc1c64a5c8d659f51fcd51bace24351232b8d7821617d2b29b54b81cdefb9b3e9c37d7fd5f63270bcc9e1a6f6a439";

    #[test]
    fn parse_rejects_bad_urls() {
        let cases = [
            // wrong scheme
            "foo://1234",
            // bad ip
            &format!("enode://{ID}@abc:30303"),
            // ip too long
            &format!("enode://{ID}@127.0.0.1.1:30303"),
            // ip too short
            &format!("enode://{ID}@127.0.0:30303"),
            // 0x prefixed id
            &format!("enode://0x{ID}@127.0.0.1:30303"),
            // id is not hex
            "enode://abcd@127.0.0.1:30303",
            // id too short
            &format!("enode://{}@127.0.0.1:30303", &ID[..10]),
            // port is not a number
            &format!("enode://{ID}@127.0.0.1:aa"),
        ];
        for case in cases {
            assert!(case.parse::<NodeRecord>().is_err(), "expected failure: {case}");
        }
    }

    #[test]
    fn parse_roundtrip() {
        let url = format!("enode://{ID}@127.0.0.1:30303");
        let record: NodeRecord = url.parse().unwrap();
        assert_eq!(record.tcp_port, 30303);
        assert_eq!(record.udp_port, 30303);
        assert_eq!(record.to_string(), url);
    }

    #[test]
    fn parse_discport() {
        let url = format!("enode://{ID}@10.3.58.6:30303?discport=30301");
        let record: NodeRecord = url.parse().unwrap();
        assert_eq!(record.tcp_port, 30303);
        assert_eq!(record.udp_port, 30301);
        assert_eq!(record.to_string(), url);

        // discport equal to the tcp port is elided on display
        let record =
            NodeRecord { udp_port: 30303, ..format!("enode://{ID}@10.3.58.6:30303?discport=30301").parse::<NodeRecord>().unwrap() };
        assert_eq!(record.to_string(), format!("enode://{ID}@10.3.58.6:30303"));
    }
}
