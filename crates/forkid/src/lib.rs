#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! [EIP-2124](https://eips.ethereum.org/EIPS/eip-2124) fork identifiers.
//!
//! A fork id is a CRC-32 digest over the genesis hash and every fork block
//! applied so far, paired with the next scheduled fork block. Peers exchange
//! it in the `eth` status handshake to reject chain-incompatible peers before
//! any chain data flows.

use std::fmt;

use alloy_primitives::B256;
use alloy_rlp::{RlpDecodable, RlpEncodable};
use crc::{Crc, CRC_32_ISO_HDLC};

/// CRC-32 as used by EIP-2124 (the IEEE polynomial).
const CRC_32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The CRC-32 digest of the genesis hash plus all applied fork blocks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ForkHash(pub [u8; 4]);

impl fmt::Debug for ForkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ForkHash({})", alloy_primitives::hex::encode(self.0))
    }
}

impl fmt::Display for ForkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&alloy_primitives::hex::encode(self.0))
    }
}

impl alloy_rlp::Encodable for ForkHash {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.encode(out)
    }

    fn length(&self) -> usize {
        self.0.length()
    }
}

impl alloy_rlp::Decodable for ForkHash {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        Ok(Self(<[u8; 4]>::decode(buf)?))
    }
}

/// The fork id exchanged in the status handshake.
///
/// Equality is structural: two ids match iff both the digest and the next
/// fork block match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, RlpEncodable, RlpDecodable)]
pub struct ForkId {
    /// Digest of the applied fork history.
    pub hash: ForkHash,
    /// The next scheduled fork block, or 0 when none is known.
    pub next: u64,
}

/// Incompatibility classes reported by [`ForkFilter::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The remote is on an old fork and has not announced the fork we
    /// already applied.
    #[error("remote is stale")]
    RemoteStale,
    /// The chains are incompatible, or the local node is the stale one.
    #[error("local is incompatible or stale")]
    LocalIncompatibleOrStale,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ForkEntry {
    /// First block of the range this digest is valid for.
    block: u64,
    hash: ForkHash,
}

/// Validates remote fork ids against the locally known fork schedule.
#[derive(Clone, Debug)]
pub struct ForkFilter {
    /// Digest ladder, one entry per applied fork range, starting at genesis.
    ladder: Vec<ForkEntry>,
    head: u64,
}

impl ForkFilter {
    /// Builds the filter from the genesis hash and the scheduled fork blocks.
    ///
    /// The fork list is sorted and deduplicated, and block 0 entries are
    /// dropped since genesis is always applied.
    pub fn new(head: u64, genesis: B256, forks: impl IntoIterator<Item = u64>) -> Self {
        let mut forks: Vec<u64> = forks.into_iter().filter(|f| *f != 0).collect();
        forks.sort_unstable();
        forks.dedup();

        let mut buf = genesis.to_vec();
        let mut ladder = Vec::with_capacity(forks.len() + 1);
        ladder.push(ForkEntry { block: 0, hash: ForkHash(CRC_32.checksum(&buf).to_be_bytes()) });
        for fork in forks {
            buf.extend_from_slice(&fork.to_be_bytes());
            ladder.push(ForkEntry { block: fork, hash: ForkHash(CRC_32.checksum(&buf).to_be_bytes()) });
        }

        Self { ladder, head }
    }

    /// Updates the local head block.
    pub fn set_head(&mut self, head: u64) {
        self.head = head;
    }

    /// The local head block.
    pub fn head(&self) -> u64 {
        self.head
    }

    /// The fork id at the current head.
    pub fn current(&self) -> ForkId {
        self.fork_id(self.head)
    }

    /// The fork id as it would be announced at the given head block.
    pub fn fork_id(&self, head: u64) -> ForkId {
        let idx = self.index_at(head);
        let next = self.ladder.get(idx + 1).map(|e| e.block).unwrap_or(0);
        ForkId { hash: self.ladder[idx].hash, next }
    }

    /// Checks a remote fork id against the local schedule at the current
    /// head, per the EIP-2124 rules.
    pub fn validate(&self, remote: ForkId) -> Result<(), ValidationError> {
        let idx = self.index_at(self.head);
        let local = self.ladder[idx];

        // Same fork: the remote may know about a future fork we are already
        // past, which means we are the stale side.
        if local.hash == remote.hash {
            if remote.next > 0 && self.head >= remote.next {
                return Err(ValidationError::LocalIncompatibleOrStale)
            }
            return Ok(())
        }

        // The remote is on a fork we already applied. It must announce the
        // fork that superseded it, otherwise it is stuck.
        for i in 0..idx {
            if self.ladder[i].hash == remote.hash {
                return if remote.next == self.ladder[i + 1].block {
                    Ok(())
                } else {
                    Err(ValidationError::RemoteStale)
                }
            }
        }

        // The remote is ahead of us; we cannot fault it.
        if self.ladder[idx + 1..].iter().any(|e| e.hash == remote.hash) {
            return Ok(())
        }

        Err(ValidationError::LocalIncompatibleOrStale)
    }

    /// Index of the ladder entry covering `head`.
    fn index_at(&self, head: u64) -> usize {
        self.ladder.partition_point(|e| e.block <= head).saturating_sub(1)
    }
}
