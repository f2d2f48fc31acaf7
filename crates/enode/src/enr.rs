//! Ethereum Node Records ([EIP-778](https://eips.ethereum.org/EIPS/eip-778)).
//!
//! A record is a sequence number plus an ordered set of typed key/value
//! pairs, signed by the node it describes. The canonical RLP of
//! `[signature, seq, k1, v1, k2, v2, ...]` with keys unique and in ascending
//! order is the wire form; the textual form is `enr:` followed by the
//! unpadded url-safe base64 of that RLP.

use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use alloy_primitives::{keccak256, Bytes};
use alloy_rlp::{Decodable, Encodable, Header};
use data_encoding::BASE64URL_NOPAD;
use secp256k1::{ecdsa::Signature, Message, PublicKey, SecretKey, SECP256K1};

use crate::{pk2id, PeerId};

/// Length of the compact secp256k1 signature carried by a record.
const SIGNATURE_LENGTH: usize = 64;

/// Well-known entry key for the identity scheme.
pub const ID_KEY: &str = "id";
/// Well-known entry key for the IPv4 address.
pub const IP_KEY: &str = "ip";
/// Well-known entry key for the IPv6 address.
pub const IP6_KEY: &str = "ip6";
/// Well-known entry key for the compressed secp256k1 public key.
pub const SECP256K1_KEY: &str = "secp256k1";
/// Well-known entry key for the TCP port.
pub const TCP_KEY: &str = "tcp";
/// Well-known entry key for the UDP port.
pub const UDP_KEY: &str = "udp";

/// Errors produced while decoding or validating a record.
#[derive(Debug, thiserror::Error)]
pub enum EnrError {
    /// The textual form is missing the `enr:` prefix.
    #[error("missing 'enr:' prefix")]
    MissingPrefix,
    /// The base64 payload is malformed.
    #[error("invalid base64: {0}")]
    Base64(#[from] data_encoding::DecodeError),
    /// The RLP structure is malformed.
    #[error("invalid rlp: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    /// An entry key is not valid UTF-8.
    #[error("entry key is not utf-8")]
    InvalidKey,
    /// Keys must be unique.
    #[error("duplicate key {0:?}")]
    DuplicateKey(String),
    /// Keys must be sorted ascending.
    #[error("keys out of order: {0:?} after {1:?}")]
    UnsortedKeys(String, String),
    /// The signature does not verify against the embedded public key.
    #[error("invalid record signature")]
    InvalidSignature,
    /// The record does not carry the entry needed for the operation.
    #[error("missing entry {0:?}")]
    MissingEntry(&'static str),
    /// Cryptographic failure from the curve library.
    #[error(transparent)]
    Secp256k1(#[from] secp256k1::Error),
}

/// A signed node record.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Enr {
    seq: u64,
    signature: Bytes,
    /// Pairs of `(key, raw rlp value)`, kept sorted by key.
    pairs: Vec<(String, Bytes)>,
}

impl Enr {
    /// Creates an empty, unsigned record with sequence number 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The record's sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Bumps the sequence number and drops the now-stale signature.
    pub fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
        self.signature = Bytes::new();
    }

    /// The raw 64-byte signature, empty when unsigned.
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Inserts an entry, replacing any previous value for the key.
    ///
    /// The signature is invalidated; call [`Enr::sign`] again afterwards.
    pub fn insert<V: Encodable>(&mut self, key: &str, value: &V) {
        let mut raw = Vec::new();
        value.encode(&mut raw);
        self.insert_raw(key, raw.into());
    }

    /// Inserts an already RLP-encoded value.
    pub fn insert_raw(&mut self, key: &str, value: Bytes) {
        self.signature = Bytes::new();
        match self.pairs.binary_search_by(|(k, _)| k.as_str().cmp(key)) {
            Ok(i) => self.pairs[i].1 = value,
            Err(i) => self.pairs.insert(i, (key.to_string(), value)),
        }
    }

    /// Returns the raw RLP value stored under `key`.
    pub fn get_raw(&self, key: &str) -> Option<&[u8]> {
        self.pairs
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.pairs[i].1.as_ref())
    }

    /// Decodes the value stored under `key`.
    pub fn get<V: Decodable>(&self, key: &str) -> Option<alloy_rlp::Result<V>> {
        self.get_raw(key).map(|mut raw| V::decode(&mut raw))
    }

    /// The identity scheme name, `"v4"` for every record this crate signs.
    pub fn id(&self) -> Option<String> {
        self.get::<Bytes>(ID_KEY)?.ok().map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// The IPv4 address, when present.
    pub fn ip4(&self) -> Option<Ipv4Addr> {
        let raw = self.get::<Bytes>(IP_KEY)?.ok()?;
        let octets: [u8; 4] = raw.as_ref().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// The IPv6 address, when present.
    pub fn ip6(&self) -> Option<Ipv6Addr> {
        let raw = self.get::<Bytes>(IP6_KEY)?.ok()?;
        let octets: [u8; 16] = raw.as_ref().try_into().ok()?;
        Some(Ipv6Addr::from(octets))
    }

    /// The TCP port, when present.
    pub fn tcp(&self) -> Option<u16> {
        self.get::<u16>(TCP_KEY)?.ok()
    }

    /// The UDP port, when present.
    pub fn udp(&self) -> Option<u16> {
        self.get::<u16>(UDP_KEY)?.ok()
    }

    /// The compressed public key of the signing node.
    pub fn public_key(&self) -> Result<PublicKey, EnrError> {
        let raw = self
            .get::<Bytes>(SECP256K1_KEY)
            .ok_or(EnrError::MissingEntry(SECP256K1_KEY))?
            .map_err(EnrError::Rlp)?;
        Ok(PublicKey::from_slice(&raw)?)
    }

    /// The 64-byte node id of the signing node.
    pub fn peer_id(&self) -> Result<PeerId, EnrError> {
        Ok(pk2id(&self.public_key()?))
    }

    /// Sets the IPv4 address entry.
    pub fn set_ip4(&mut self, ip: Ipv4Addr) {
        self.insert(IP_KEY, &Bytes::copy_from_slice(&ip.octets()));
    }

    /// Sets the TCP port entry.
    pub fn set_tcp(&mut self, port: u16) {
        self.insert(TCP_KEY, &port);
    }

    /// Sets the UDP port entry.
    pub fn set_udp(&mut self, port: u16) {
        self.insert(UDP_KEY, &port);
    }

    /// Signs the record with the v4 identity scheme.
    ///
    /// Installs the `id` and `secp256k1` entries, then signs the keccak-256
    /// of the content list `[seq, k1, v1, ...]`.
    pub fn sign(&mut self, secret: &SecretKey) -> Result<(), EnrError> {
        let public = PublicKey::from_secret_key(SECP256K1, secret);
        self.insert(ID_KEY, &Bytes::from_static(b"v4"));
        self.insert(SECP256K1_KEY, &Bytes::copy_from_slice(&public.serialize()));

        let digest = keccak256(self.content_rlp());
        let msg = Message::from_digest_slice(digest.as_slice())?;
        let sig = SECP256K1.sign_ecdsa(&msg, secret);
        self.signature = Bytes::copy_from_slice(&sig.serialize_compact());
        Ok(())
    }

    /// Verifies the signature against the embedded `secp256k1` entry.
    pub fn verify_signature(&self) -> Result<(), EnrError> {
        let public = self.public_key()?;
        let digest = keccak256(self.content_rlp());
        let msg = Message::from_digest_slice(digest.as_slice())?;
        let sig = Signature::from_compact(&self.signature)
            .map_err(|_| EnrError::InvalidSignature)?;
        SECP256K1.verify_ecdsa(&msg, &sig, &public).map_err(|_| EnrError::InvalidSignature)
    }

    /// RLP of the signed content: `[seq, k1, v1, k2, v2, ...]`.
    fn content_rlp(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        self.seq.encode(&mut payload);
        for (k, v) in &self.pairs {
            k.as_bytes().encode(&mut payload);
            payload.extend_from_slice(v);
        }
        let mut out = Vec::with_capacity(payload.len() + 4);
        Header { list: true, payload_length: payload.len() }.encode(&mut out);
        out.extend_from_slice(&payload);
        out
    }

    /// Decodes a record from its textual `enr:` form.
    pub fn from_text(s: &str) -> Result<Self, EnrError> {
        let b64 = s.strip_prefix("enr:").ok_or(EnrError::MissingPrefix)?;
        let raw = BASE64URL_NOPAD.decode(b64.as_bytes())?;
        let mut buf = raw.as_slice();
        let record = Self::decode(&mut buf)?;
        Ok(record)
    }

    /// Encodes the record into its textual `enr:` form.
    pub fn to_text(&self) -> String {
        let mut raw = Vec::new();
        self.encode(&mut raw);
        format!("enr:{}", BASE64URL_NOPAD.encode(&raw))
    }
}

impl Encodable for Enr {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        let mut payload = Vec::new();
        self.signature.encode(&mut payload);
        self.seq.encode(&mut payload);
        for (k, v) in &self.pairs {
            k.as_bytes().encode(&mut payload);
            payload.extend_from_slice(v);
        }
        Header { list: true, payload_length: payload.len() }.encode(out);
        out.put_slice(&payload);
    }

    fn length(&self) -> usize {
        let mut payload = self.signature.length() + self.seq.length();
        for (k, v) in &self.pairs {
            payload += k.as_bytes().length() + v.len();
        }
        payload + Header { list: true, payload_length: payload }.length()
    }
}

impl Decodable for Enr {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString)
        }
        let mut payload = &buf[..header.payload_length];
        *buf = &buf[header.payload_length..];

        let signature = Bytes::decode(&mut payload)?;
        if signature.len() != SIGNATURE_LENGTH {
            return Err(alloy_rlp::Error::Custom("unexpected signature length"))
        }
        let seq = u64::decode(&mut payload)?;

        let mut pairs = Vec::new();
        let mut prev: Option<String> = None;
        while !payload.is_empty() {
            let key_bytes = Bytes::decode(&mut payload)?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| alloy_rlp::Error::Custom("entry key is not utf-8"))?;
            if let Some(prev) = &prev {
                if *prev == key {
                    return Err(alloy_rlp::Error::Custom("duplicate entry key"))
                }
                if *prev > key {
                    return Err(alloy_rlp::Error::Custom("entry keys not sorted"))
                }
            }
            let value = take_raw_item(&mut payload)?;
            prev = Some(key.clone());
            pairs.push((key, value));
        }

        Ok(Self { seq, signature, pairs })
    }
}

impl fmt::Display for Enr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

impl FromStr for Enr {
    type Err = EnrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_text(s)
    }
}

/// Splits the next complete RLP item (header included) off the buffer.
fn take_raw_item(buf: &mut &[u8]) -> alloy_rlp::Result<Bytes> {
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
