//! The `enrtree` record grammar of
//! [EIP-1459](https://eips.ethereum.org/EIPS/eip-1459).

use data_encoding::{BASE32_NOPAD, BASE64URL_NOPAD};
use devp2p_enode::Enr;
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, SECP256K1,
};
use sha3::{Digest, Keccak256};

/// Prefix of root records.
pub const ROOT_PREFIX: &str = "enrtree-root:v1";
/// Prefix of branch records.
pub const BRANCH_PREFIX: &str = "enrtree-branch:";
/// Prefix of link records.
pub const LINK_PREFIX: &str = "enrtree://";
/// Prefix of node records.
pub const ENR_PREFIX: &str = "enr:";

/// Failures while parsing or validating tree entries.
#[derive(Debug, thiserror::Error)]
pub enum ParseEntryError {
    /// The record carries none of the known prefixes.
    #[error("unknown entry: {0}")]
    UnknownEntry(String),
    /// A field did not match the record grammar.
    #[error("malformed {kind} entry: {reason}")]
    Malformed {
        /// Which entry kind failed.
        kind: &'static str,
        /// What was wrong.
        reason: String,
    },
    /// A subtree hash is not unpadded base32 of 12 to 32 bytes.
    #[error("invalid subtree hash: {0}")]
    InvalidHash(String),
    /// Base64/base32 decoding failed.
    #[error(transparent)]
    Encoding(#[from] data_encoding::DecodeError),
    /// The embedded public key is not a curve point.
    #[error(transparent)]
    Secp256k1(#[from] secp256k1::Error),
    /// The node record is malformed.
    #[error(transparent)]
    Enr(#[from] devp2p_enode::enr::EnrError),
}

/// One TXT record of a discovery tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Entry {
    /// The signed tree root.
    Root(RootEntry),
    /// An interior node listing subtree hashes.
    Branch(BranchEntry),
    /// A link to another tree.
    Link(LinkEntry),
    /// A leaf carrying a node record.
    Node(NodeEntry),
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root(root) => root.fmt(f),
            Self::Branch(branch) => branch.fmt(f),
            Self::Link(link) => link.fmt(f),
            Self::Node(node) => node.fmt(f),
        }
    }
}

/// Parses any tree entry by its prefix.
pub fn parse_entry(record: &str) -> Result<Entry, ParseEntryError> {
    if record.starts_with(ENR_PREFIX) {
        return Ok(Entry::Node(record.parse()?))
    }
    if record.starts_with(BRANCH_PREFIX) {
        return Ok(Entry::Branch(record.parse()?))
    }
    if record.starts_with(LINK_PREFIX) {
        return Ok(Entry::Link(record.parse()?))
    }
    if record.starts_with(ROOT_PREFIX) {
        return Ok(Entry::Root(record.parse()?))
    }
    Err(ParseEntryError::UnknownEntry(record.to_string()))
}

/// Validates the unpadded-base32 form of a subtree hash and returns the
/// decoded bytes.
pub fn decode_subtree_hash(hash: &str) -> Result<Vec<u8>, ParseEntryError> {
    let raw = BASE32_NOPAD
        .decode(hash.as_bytes())
        .map_err(|_| ParseEntryError::InvalidHash(hash.to_string()))?;
    if raw.len() < 12 || raw.len() > 32 {
        return Err(ParseEntryError::InvalidHash(hash.to_string()))
    }
    Ok(raw)
}

/// The truncated keccak-256 hash naming a record inside the tree.
pub fn subtree_hash(record: &str) -> String {
    let digest = Keccak256::digest(record.as_bytes());
    BASE32_NOPAD.encode(&digest[..16])
}

/// `enrtree-root:v1 e=<enr-root> l=<link-root> seq=<n> sig=<base64>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootEntry {
    /// Root hash of the node subtree.
    pub enr_root: String,
    /// Root hash of the link subtree.
    pub link_root: String,
    /// Update counter of the tree.
    pub seq: u64,
    /// 65-byte recoverable signature over the unsigned text.
    pub signature: Vec<u8>,
}

impl RootEntry {
    /// The signed portion of the record text.
    fn unsigned(&self) -> String {
        format!("{ROOT_PREFIX} e={} l={} seq={}", self.enr_root, self.link_root, self.seq)
    }

    /// Checks the signature against the tree owner's key.
    pub fn verify(&self, pubkey: &PublicKey) -> bool {
        self.recover().map(|recovered| recovered == *pubkey).unwrap_or(false)
    }

    /// Recovers the signer from the signature.
    pub fn recover(&self) -> Result<PublicKey, ParseEntryError> {
        if self.signature.len() != 65 {
            return Err(ParseEntryError::Malformed {
                kind: "root",
                reason: "signature must be 65 bytes".to_string(),
            })
        }
        let recid = RecoveryId::from_i32(self.signature[64] as i32)?;
        let sig = RecoverableSignature::from_compact(&self.signature[..64], recid)?;
        let digest = Keccak256::digest(self.unsigned().as_bytes());
        let msg = Message::from_digest_slice(&digest)?;
        Ok(SECP256K1.recover_ecdsa(&msg, &sig)?)
    }
}

impl std::fmt::Display for RootEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} sig={}", self.unsigned(), BASE64URL_NOPAD.encode(&self.signature))
    }
}

impl std::str::FromStr for RootEntry {
    type Err = ParseEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| ParseEntryError::Malformed {
            kind: "root",
            reason: reason.to_string(),
        };
        let rest = s.strip_prefix(ROOT_PREFIX).ok_or_else(|| malformed("missing prefix"))?;

        let mut enr_root = None;
        let mut link_root = None;
        let mut seq = None;
        let mut signature = None;
        for field in rest.split_whitespace() {
            if let Some(value) = field.strip_prefix("e=") {
                enr_root = Some(value.to_string());
            } else if let Some(value) = field.strip_prefix("l=") {
                link_root = Some(value.to_string());
            } else if let Some(value) = field.strip_prefix("seq=") {
                seq = Some(value.parse::<u64>().map_err(|_| malformed("bad seq"))?);
            } else if let Some(value) = field.strip_prefix("sig=") {
                signature = Some(BASE64URL_NOPAD.decode(value.as_bytes())?);
            } else {
                return Err(malformed(field))
            }
        }

        let entry = Self {
            enr_root: enr_root.ok_or_else(|| malformed("missing e="))?,
            link_root: link_root.ok_or_else(|| malformed("missing l="))?,
            seq: seq.ok_or_else(|| malformed("missing seq="))?,
            signature: signature.ok_or_else(|| malformed("missing sig="))?,
        };
        decode_subtree_hash(&entry.enr_root)?;
        decode_subtree_hash(&entry.link_root)?;
        Ok(entry)
    }
}

/// `enrtree-branch:<h1>,<h2>,...`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchEntry {
    /// Subtree hashes of the children.
    pub children: Vec<String>,
}

impl std::fmt::Display for BranchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", BRANCH_PREFIX, self.children.join(","))
    }
}

impl std::str::FromStr for BranchEntry {
    type Err = ParseEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s.strip_prefix(BRANCH_PREFIX).ok_or(ParseEntryError::Malformed {
            kind: "branch",
            reason: "missing prefix".to_string(),
        })?;
        let mut children = Vec::new();
        for hash in rest.split(',') {
            decode_subtree_hash(hash)?;
            children.push(hash.to_string());
        }
        Ok(Self { children })
    }
}

/// `enrtree://<base32-compressed-pubkey>@<domain>`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkEntry {
    /// Domain serving the linked tree.
    pub domain: String,
    /// Key the linked tree's root must be signed with.
    pub pubkey: PublicKey,
}

impl std::fmt::Display for LinkEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}@{}",
            LINK_PREFIX,
            BASE32_NOPAD.encode(&self.pubkey.serialize()),
            self.domain,
        )
    }
}

impl std::str::FromStr for LinkEntry {
    type Err = ParseEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = |reason: &str| ParseEntryError::Malformed {
            kind: "link",
            reason: reason.to_string(),
        };
        let rest = s.strip_prefix(LINK_PREFIX).ok_or_else(|| malformed("missing prefix"))?;
        let (key, domain) = rest.split_once('@').ok_or_else(|| malformed("missing '@'"))?;
        let raw = BASE32_NOPAD.decode(key.as_bytes())?;
        Ok(Self { domain: domain.to_string(), pubkey: PublicKey::from_slice(&raw)? })
    }
}

/// A leaf: a signed node record.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeEntry {
    /// The node record.
    pub record: Enr,
}

impl std::fmt::Display for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.record.to_text())
    }
}

impl std::str::FromStr for NodeEntry {
    type Err = ParseEntryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { record: Enr::from_text(s)? })
    }
}
