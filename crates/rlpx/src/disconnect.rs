//! RLPx disconnect reasons (base-protocol message 0x01).

use alloy_rlp::{Decodable, Encodable, Header, EMPTY_LIST_CODE};
use bytes::Buf;

/// Reason code carried by a disconnect message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// Disconnect requested by the local node or remote peer.
    DisconnectRequested = 0x00,
    /// TCP related error.
    TcpSubsystemError = 0x01,
    /// Breach of protocol at the transport or p2p level.
    ProtocolBreach = 0x02,
    /// Node has no matching protocols.
    UselessPeer = 0x03,
    /// Either the remote or local node has too many peers.
    TooManyPeers = 0x04,
    /// Already connected to the peer.
    AlreadyConnected = 0x05,
    /// `p2p` protocol version is incompatible.
    IncompatibleP2PProtocolVersion = 0x06,
    /// Received a null node identity.
    NullNodeIdentity = 0x07,
    /// The client is shutting down.
    ClientQuitting = 0x08,
    /// The handshake identity differs from the dialed one.
    UnexpectedHandshakeIdentity = 0x09,
    /// The node is connected to itself.
    ConnectedToSelf = 0x0a,
    /// Peer or local node did not respond to a ping in time.
    PingTimeout = 0x0b,
    /// Peer or local node violated a subprotocol-specific rule.
    SubprotocolSpecific = 0x10,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::DisconnectRequested => "disconnect requested",
            Self::TcpSubsystemError => "TCP sub-system error",
            Self::ProtocolBreach => "breach of protocol",
            Self::UselessPeer => "useless peer",
            Self::TooManyPeers => "too many peers",
            Self::AlreadyConnected => "already connected",
            Self::IncompatibleP2PProtocolVersion => "incompatible p2p protocol version",
            Self::NullNodeIdentity => "null node identity",
            Self::ClientQuitting => "client quitting",
            Self::UnexpectedHandshakeIdentity => "unexpected identity in handshake",
            Self::ConnectedToSelf => "connected to self",
            Self::PingTimeout => "ping timeout",
            Self::SubprotocolSpecific => "subprotocol error",
        };
        f.write_str(message)
    }
}

/// An unrecognized disconnect reason code.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("unknown disconnect reason: {0}")]
pub struct UnknownDisconnectReason(pub u8);

impl TryFrom<u8> for DisconnectReason {
    type Error = UnknownDisconnectReason;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::DisconnectRequested),
            0x01 => Ok(Self::TcpSubsystemError),
            0x02 => Ok(Self::ProtocolBreach),
            0x03 => Ok(Self::UselessPeer),
            0x04 => Ok(Self::TooManyPeers),
            0x05 => Ok(Self::AlreadyConnected),
            0x06 => Ok(Self::IncompatibleP2PProtocolVersion),
            0x07 => Ok(Self::NullNodeIdentity),
            0x08 => Ok(Self::ClientQuitting),
            0x09 => Ok(Self::UnexpectedHandshakeIdentity),
            0x0a => Ok(Self::ConnectedToSelf),
            0x0b => Ok(Self::PingTimeout),
            0x10 => Ok(Self::SubprotocolSpecific),
            _ => Err(UnknownDisconnectReason(value)),
        }
    }
}

impl Encodable for DisconnectReason {
    /// Encodes the canonical form: a single-element list.
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        Header { list: true, payload_length: 1 }.encode(out);
        (*self as u8).encode(out);
    }

    fn length(&self) -> usize {
        2
    }
}

impl Decodable for DisconnectReason {
    /// Accepts both forms seen in the wild: a plain uint and a
    /// single-element list.
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        if buf.is_empty() {
            return Err(alloy_rlp::Error::InputTooShort)
        }
        if buf[0] >= EMPTY_LIST_CODE {
            let header = Header::decode(buf)?;
            if !header.list {
                return Err(alloy_rlp::Error::UnexpectedString)
            }
        }
        let reason = u8::decode(buf)?;
        Self::try_from(reason)
            .map_err(|_| alloy_rlp::Error::Custom("unknown disconnect reason"))
    }
}

/// Lenient decode of a disconnect payload: empty payloads default to
/// [`DisconnectReason::DisconnectRequested`], and the `0x00` byte is read as
/// reason 0.
pub(crate) fn decode_disconnect_payload(mut payload: &[u8]) -> Option<DisconnectReason> {
    if payload.is_empty() {
        return Some(DisconnectReason::DisconnectRequested)
    }
    if payload[0] == 0 {
        payload.advance(1);
        return Some(DisconnectReason::DisconnectRequested)
    }
    DisconnectReason::decode(&mut payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [DisconnectReason; 13] = [
        DisconnectReason::DisconnectRequested,
        DisconnectReason::TcpSubsystemError,
        DisconnectReason::ProtocolBreach,
        DisconnectReason::UselessPeer,
        DisconnectReason::TooManyPeers,
        DisconnectReason::AlreadyConnected,
        DisconnectReason::IncompatibleP2PProtocolVersion,
        DisconnectReason::NullNodeIdentity,
        DisconnectReason::ClientQuitting,
        DisconnectReason::UnexpectedHandshakeIdentity,
        DisconnectReason::ConnectedToSelf,
        DisconnectReason::PingTimeout,
        DisconnectReason::SubprotocolSpecific,
    ];

    #[test]
    fn roundtrip() {
        for reason in ALL {
            let mut encoded = Vec::new();
            reason.encode(&mut encoded);
            assert_eq!(encoded.len(), reason.length());
            assert_eq!(DisconnectReason::decode(&mut encoded.as_slice()).unwrap(), reason);
        }
    }

    #[test]
    fn decodes_plain_uint_form() {
        // geth's old form: just the rlp uint, no list
        let encoded = [0x04u8];
        assert_eq!(
            DisconnectReason::decode(&mut encoded.as_slice()).unwrap(),
            DisconnectReason::TooManyPeers
        );
    }

    #[test]
    fn rejects_unknown_reason() {
        let encoded = [0x0cu8];
        assert!(DisconnectReason::decode(&mut encoded.as_slice()).is_err());
    }

    #[test]
    fn canonical_encoding_is_a_list() {
        let mut encoded = Vec::new();
        DisconnectReason::TooManyPeers.encode(&mut encoded);
        assert_eq!(encoded, vec![0xc1, 0x04]);

        let mut encoded = Vec::new();
        DisconnectReason::DisconnectRequested.encode(&mut encoded);
        assert_eq!(encoded, vec![0xc1, 0x80]);
    }
}
