//! Request, response and broadcast payload types.

use alloy_primitives::{Bytes, B256};
use alloy_rlp::{
    Decodable, Encodable, Header, RlpDecodable, RlpDecodableWrapper, RlpEncodable,
    RlpEncodableWrapper, EMPTY_LIST_CODE,
};
use bytes::BufMut;

/// Either a block hash or a block number, as used by `GetBlockHeaders`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashOrNumber {
    /// A block hash.
    Hash(B256),
    /// A block number.
    Number(u64),
}

impl From<B256> for HashOrNumber {
    fn from(hash: B256) -> Self {
        Self::Hash(hash)
    }
}

impl From<u64> for HashOrNumber {
    fn from(number: u64) -> Self {
        Self::Number(number)
    }
}

impl Encodable for HashOrNumber {
    fn encode(&self, out: &mut dyn BufMut) {
        match self {
            Self::Hash(hash) => hash.encode(out),
            Self::Number(number) => number.encode(out),
        }
    }

    fn length(&self) -> usize {
        match self {
            Self::Hash(hash) => hash.length(),
            Self::Number(number) => number.length(),
        }
    }
}

impl Decodable for HashOrNumber {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let first = *buf.first().ok_or(alloy_rlp::Error::InputTooShort)?;
        // a hash is always a 32-byte string
        if first == alloy_rlp::EMPTY_STRING_CODE + 32 {
            return Ok(Self::Hash(B256::decode(buf)?))
        }
        Ok(Self::Number(u64::decode(buf)?))
    }
}

/// Whether headers are returned towards higher or lower block numbers.
///
/// Encoded as the `reverse` boolean of the wire format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HeadersDirection {
    /// Ascending block numbers.
    #[default]
    Rising,
    /// Descending block numbers.
    Falling,
}

impl HeadersDirection {
    /// Whether this is the descending direction.
    pub const fn is_falling(&self) -> bool {
        matches!(self, Self::Falling)
    }
}

impl Encodable for HeadersDirection {
    fn encode(&self, out: &mut dyn BufMut) {
        self.is_falling().encode(out)
    }

    fn length(&self) -> usize {
        self.is_falling().length()
    }
}

impl Decodable for HeadersDirection {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let reverse = bool::decode(buf)?;
        Ok(if reverse { Self::Falling } else { Self::Rising })
    }
}

/// A `GetBlockHeaders` request body.
#[derive(Clone, Copy, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct GetBlockHeaders {
    /// The block the peer should start at.
    pub start_block: HashOrNumber,
    /// Maximum number of headers to return.
    pub limit: u64,
    /// Blocks to skip between returned headers.
    pub skip: u64,
    /// Direction of traversal.
    pub direction: HeadersDirection,
}

/// A plain list of 32-byte hashes, as carried by `GetBlockBodies`,
/// `GetPooledTransactions` and `NewPooledTransactionHashes`.
///
/// An empty list encodes as the RLP empty list.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct HashList(pub Vec<B256>);

impl From<Vec<B256>> for HashList {
    fn from(hashes: Vec<B256>) -> Self {
        Self(hashes)
    }
}

/// A block hash and its number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BlockHashNumber {
    /// The block hash.
    pub hash: B256,
    /// The block number.
    pub number: u64,
}

/// The `NewBlockHashes` broadcast: blocks the peer considers new.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodableWrapper, RlpDecodableWrapper)]
pub struct NewBlockHashes(pub Vec<BlockHashNumber>);

impl NewBlockHashes {
    /// The highest announced block, if any.
    pub fn latest(&self) -> Option<&BlockHashNumber> {
        self.0.iter().max_by_key(|block| block.number)
    }
}

/// An opaque, already RLP-encoded message body.
///
/// Response payloads (header lists, block bodies, transactions) cross the
/// correlation layer in this form; the backend owns their concrete shape.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawBody(pub Bytes);

impl RawBody {
    /// An empty RLP list.
    pub fn empty_list() -> Self {
        Self(Bytes::from_static(&[EMPTY_LIST_CODE]))
    }
}

impl From<Bytes> for RawBody {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

impl Encodable for RawBody {
    fn encode(&self, out: &mut dyn BufMut) {
        out.put_slice(&self.0);
    }

    fn length(&self) -> usize {
        self.0.len()
    }
}

impl Decodable for RawBody {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Self(take_raw_item(buf)?))
    }
}

/// Splits the next complete RLP item (header included) off the buffer.
pub(crate) fn take_raw_item(buf: &mut &[u8]) -> alloy_rlp::Result<Bytes> {
    let rem = *buf;
    let mut probe = rem;
    let header = Header::decode(&mut probe)?;
    let total = (rem.len() - probe.len()) + header.payload_length;
    if rem.len() < total {
        return Err(alloy_rlp::Error::InputTooShort)
    }
    let item = Bytes::copy_from_slice(&rem[..total]);
    *buf = &rem[total..];
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::hex;

    #[test]
    fn empty_hash_list_is_an_empty_rlp_list() {
        let mut encoded = Vec::new();
        HashList::default().encode(&mut encoded);
        assert_eq!(encoded, vec![EMPTY_LIST_CODE]);
        assert_eq!(HashList::decode(&mut encoded.as_slice()).unwrap(), HashList::default());
    }

    #[test]
    fn hash_list_roundtrip() {
        let list = HashList(vec![B256::repeat_byte(0x11), B256::repeat_byte(0x22)]);
        let mut encoded = Vec::new();
        list.encode(&mut encoded);
        assert_eq!(encoded.len(), list.length());
        assert_eq!(HashList::decode(&mut encoded.as_slice()).unwrap(), list);
    }

    #[test]
    fn get_block_headers_roundtrip() {
        let requests = [
            GetBlockHeaders {
                start_block: HashOrNumber::Number(1024),
                limit: 128,
                skip: 1,
                direction: HeadersDirection::Falling,
            },
            GetBlockHeaders {
                start_block: HashOrNumber::Hash(B256::repeat_byte(0xaa)),
                limit: 1,
                skip: 0,
                direction: HeadersDirection::Rising,
            },
        ];
        for request in requests {
            let mut encoded = Vec::new();
            request.encode(&mut encoded);
            assert_eq!(encoded.len(), request.length());
            assert_eq!(GetBlockHeaders::decode(&mut encoded.as_slice()).unwrap(), request);
        }
    }

    #[test]
    fn get_block_headers_known_encoding() {
        // [5, 5, 0, false]
        let request = GetBlockHeaders {
            start_block: HashOrNumber::Number(5),
            limit: 5,
            skip: 0,
            direction: HeadersDirection::Rising,
        };
        let mut encoded = Vec::new();
        request.encode(&mut encoded);
        assert_eq!(encoded, hex!("c405058080"));
    }

    #[test]
    fn new_block_hashes_latest() {
        let mut hashes = NewBlockHashes(vec![BlockHashNumber { hash: B256::ZERO, number: 0 }]);
        assert_eq!(hashes.latest().unwrap().number, 0);
        hashes.0.push(BlockHashNumber { hash: B256::repeat_byte(1), number: 100 });
        hashes.0.push(BlockHashNumber { hash: B256::repeat_byte(2), number: 2 });
        assert_eq!(hashes.latest().unwrap().number, 100);
    }

    #[test]
    fn new_block_hashes_roundtrip() {
        let hashes = NewBlockHashes(vec![
            BlockHashNumber { hash: B256::repeat_byte(1), number: 7 },
            BlockHashNumber { hash: B256::repeat_byte(2), number: 8 },
        ]);
        let mut encoded = Vec::new();
        hashes.encode(&mut encoded);
        assert_eq!(NewBlockHashes::decode(&mut encoded.as_slice()).unwrap(), hashes);
    }

    #[test]
    fn raw_body_captures_one_item() {
        // a list item followed by trailing bytes that belong to the caller
        let mut buf = Vec::new();
        HashList(vec![B256::repeat_byte(3)]).encode(&mut buf);
        buf.extend_from_slice(&hex!("8180"));

        let mut slice = buf.as_slice();
        let body = RawBody::decode(&mut slice).unwrap();
        assert_eq!(body.0.len(), buf.len() - 2);
        assert_eq!(slice, hex!("8180"));
    }
}
