//! The hello message (base-protocol message 0x00).

use alloy_rlp::{Decodable, Encodable, Header, RlpEncodable};
use devp2p_enode::PeerId;

use crate::capability::Capability;

/// The first message both sides send after the ECIES handshake.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable)]
pub struct Hello {
    /// Base protocol version; 5 since snappy compression.
    pub protocol_version: u8,
    /// Client software identity, e.g. `devp2p-rs/0.1.0`.
    pub client_id: String,
    /// Advertised sub-protocols.
    pub capabilities: Vec<Capability>,
    /// The port this client listens on; 0 when not listening.
    pub port: u16,
    /// The node's public identity.
    pub id: PeerId,
}

impl Decodable for Hello {
    /// Decodes the five known fields and tolerates trailing fields added by
    /// future protocol versions.
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString)
        }
        let mut payload = &buf[..header.payload_length];
        *buf = &buf[header.payload_length..];

        let hello = Self {
            protocol_version: u8::decode(&mut payload)?,
            client_id: String::decode(&mut payload)?,
            capabilities: Vec::<Capability>::decode(&mut payload)?,
            port: u16::decode(&mut payload)?,
            id: PeerId::decode(&mut payload)?,
        };
        Ok(hello)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BASE_PROTOCOL_VERSION;
    use devp2p_enode::id_from_secret;
    use secp256k1::SecretKey;

    fn hello() -> Hello {
        Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id: "devp2p-rs/0.1.0".to_string(),
            capabilities: vec![Capability::new("eth", 66), Capability::new("snap", 1)],
            port: 30303,
            id: id_from_secret(&SecretKey::new(&mut rand::thread_rng())),
        }
    }

    #[test]
    fn roundtrip() {
        let original = hello();
        let mut encoded = Vec::new();
        original.encode(&mut encoded);
        assert_eq!(Hello::decode(&mut encoded.as_slice()).unwrap(), original);
    }

    #[test]
    fn tolerates_trailing_fields() {
        let original = hello();
        let mut payload = Vec::new();
        original.protocol_version.encode(&mut payload);
        original.client_id.encode(&mut payload);
        original.capabilities.encode(&mut payload);
        original.port.encode(&mut payload);
        original.id.encode(&mut payload);
        // a future field this implementation does not know about
        0xdeadbeefu64.encode(&mut payload);

        let mut encoded = Vec::new();
        Header { list: true, payload_length: payload.len() }.encode(&mut encoded);
        encoded.extend_from_slice(&payload);

        assert_eq!(Hello::decode(&mut encoded.as_slice()).unwrap(), original);
    }
}
