//! Message ids and the request/response pairing introduced by `eth/66`.

use alloy_rlp::{Decodable, Encodable, Header};
use bytes::BufMut;

/// Message codes of the `eth` capability, relative to its window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EthMessageId {
    /// The status handshake, exchanged once per stream.
    Status = 0x00,
    /// Broadcast of new block hashes.
    NewBlockHashes = 0x01,
    /// Broadcast of complete transactions.
    Transactions = 0x02,
    /// Header request.
    GetBlockHeaders = 0x03,
    /// Header response.
    BlockHeaders = 0x04,
    /// Body request.
    GetBlockBodies = 0x05,
    /// Body response.
    BlockBodies = 0x06,
    /// Broadcast of a complete new block.
    NewBlock = 0x07,
    /// Broadcast of pooled transaction hashes.
    NewPooledTransactionHashes = 0x08,
    /// Pooled transaction request.
    GetPooledTransactions = 0x09,
    /// Pooled transaction response.
    PooledTransactions = 0x0a,
    /// Node data request (legacy, still reserved in eth/66).
    GetNodeData = 0x0d,
    /// Node data response.
    NodeData = 0x0e,
    /// Receipt request.
    GetReceipts = 0x0f,
    /// Receipt response.
    Receipts = 0x10,
}

impl EthMessageId {
    /// Whether this code names a request carrying a request id.
    pub const fn is_request(&self) -> bool {
        matches!(
            self,
            Self::GetBlockHeaders |
                Self::GetBlockBodies |
                Self::GetPooledTransactions |
                Self::GetNodeData |
                Self::GetReceipts
        )
    }

    /// Whether this code names a response carrying a request id.
    pub const fn is_response(&self) -> bool {
        matches!(
            self,
            Self::BlockHeaders |
                Self::BlockBodies |
                Self::PooledTransactions |
                Self::NodeData |
                Self::Receipts
        )
    }

    /// The response code answering this request code.
    pub const fn response(&self) -> Option<Self> {
        match self {
            Self::GetBlockHeaders => Some(Self::BlockHeaders),
            Self::GetBlockBodies => Some(Self::BlockBodies),
            Self::GetPooledTransactions => Some(Self::PooledTransactions),
            Self::GetNodeData => Some(Self::NodeData),
            Self::GetReceipts => Some(Self::Receipts),
            _ => None,
        }
    }
}

/// An unknown `eth` message code.
#[derive(Clone, Copy, Debug, thiserror::Error)]
#[error("unknown eth message id: {0}")]
pub struct UnknownMessageId(pub u64);

impl TryFrom<u64> for EthMessageId {
    type Error = UnknownMessageId;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        match code {
            0x00 => Ok(Self::Status),
            0x01 => Ok(Self::NewBlockHashes),
            0x02 => Ok(Self::Transactions),
            0x03 => Ok(Self::GetBlockHeaders),
            0x04 => Ok(Self::BlockHeaders),
            0x05 => Ok(Self::GetBlockBodies),
            0x06 => Ok(Self::BlockBodies),
            0x07 => Ok(Self::NewBlock),
            0x08 => Ok(Self::NewPooledTransactionHashes),
            0x09 => Ok(Self::GetPooledTransactions),
            0x0a => Ok(Self::PooledTransactions),
            0x0d => Ok(Self::GetNodeData),
            0x0e => Ok(Self::NodeData),
            0x0f => Ok(Self::GetReceipts),
            0x10 => Ok(Self::Receipts),
            other => Err(UnknownMessageId(other)),
        }
    }
}

/// A request or response wrapped with its 64-bit correlation id:
/// `[request_id, body]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestPair<T> {
    /// Correlation id, random per outstanding request.
    pub request_id: u64,
    /// The wrapped body.
    pub message: T,
}

impl<T: Encodable> Encodable for RequestPair<T> {
    fn encode(&self, out: &mut dyn BufMut) {
        let header = Header {
            list: true,
            payload_length: self.request_id.length() + self.message.length(),
        };
        header.encode(out);
        self.request_id.encode(out);
        self.message.encode(out);
    }

    fn length(&self) -> usize {
        let payload_length = self.request_id.length() + self.message.length();
        payload_length + Header { list: true, payload_length }.length()
    }
}

impl<T: Decodable> Decodable for RequestPair<T> {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString)
        }
        let mut payload = &buf[..header.payload_length];
        *buf = &buf[header.payload_length..];

        let request_id = u64::decode(&mut payload)?;
        let message = T::decode(&mut payload)?;
        Ok(Self { request_id, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GetBlockHeaders, HashList, HashOrNumber, HeadersDirection};
    use alloy_primitives::{hex, B256};

    #[test]
    fn request_pair_roundtrip() {
        let pair = RequestPair {
            request_id: 0xdeadbeef,
            message: HashList(vec![B256::repeat_byte(7)]),
        };
        let mut encoded = Vec::new();
        pair.encode(&mut encoded);
        assert_eq!(encoded.len(), pair.length());
        assert_eq!(RequestPair::<HashList>::decode(&mut encoded.as_slice()).unwrap(), pair);
    }

    #[test]
    fn request_pair_known_encoding() {
        // [0, [5, 5, 0, false]]
        let pair = RequestPair {
            request_id: 0,
            message: GetBlockHeaders {
                start_block: HashOrNumber::Number(5),
                limit: 5,
                skip: 0,
                direction: HeadersDirection::Rising,
            },
        };
        let mut encoded = Vec::new();
        pair.encode(&mut encoded);
        assert_eq!(encoded, hex!("c680c405058080"));
    }

    #[test]
    fn message_id_classification() {
        assert!(EthMessageId::GetBlockHeaders.is_request());
        assert!(EthMessageId::BlockHeaders.is_response());
        assert!(!EthMessageId::Transactions.is_request());
        assert_eq!(
            EthMessageId::GetPooledTransactions.response(),
            Some(EthMessageId::PooledTransactions)
        );
        assert!(EthMessageId::try_from(0x0b).is_err());
        assert_eq!(EthMessageId::try_from(0x10).unwrap(), EthMessageId::Receipts);
    }
}
