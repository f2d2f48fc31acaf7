//! Capability negotiation and message-code window assignment.

use std::collections::{btree_map::Entry, BTreeMap};

use alloy_rlp::{RlpDecodable, RlpEncodable};
use devp2p::ProtocolSpec;

use crate::{error::RlpxError, BASE_PROTOCOL_LENGTH};

/// A capability as advertised in the hello message.
#[derive(Clone, Debug, PartialEq, Eq, Hash, RlpEncodable, RlpDecodable)]
pub struct Capability {
    /// Sub-protocol name.
    pub name: String,
    /// Sub-protocol version.
    pub version: u32,
}

impl Capability {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self { name: name.into(), version }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// A capability supported by both sides, with its assigned code window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedCapability {
    /// Sub-protocol name.
    pub name: String,
    /// Negotiated version (the highest supported by both sides).
    pub version: u32,
    /// First absolute message code of the window.
    pub offset: u64,
    /// Width of the window.
    pub length: u64,
}

impl SharedCapability {
    /// Whether the absolute message code falls into this window.
    pub fn contains(&self, code: u64) -> bool {
        code >= self.offset && code < self.offset + self.length
    }

    /// The spec form of this capability.
    pub fn spec(&self) -> ProtocolSpec {
        ProtocolSpec { name: self.name.clone(), version: self.version, length: self.length }
    }
}

/// The negotiated capability set with disjoint, contiguous code windows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedCapabilities(Vec<SharedCapability>);

impl SharedCapabilities {
    /// Intersects the local protocol registrations with the peer's
    /// advertisement.
    ///
    /// For every name present on both sides the highest common version
    /// survives. Survivors are ordered lexicographically by name and get
    /// contiguous windows starting right after the base protocol.
    pub fn try_new(
        local: &[ProtocolSpec],
        peer: &[Capability],
    ) -> Result<Self, RlpxError> {
        let mut best: BTreeMap<&str, &ProtocolSpec> = BTreeMap::new();
        for proto in local {
            let offered = peer.iter().any(|c| c.name == proto.name && c.version == proto.version);
            if !offered {
                continue
            }
            match best.entry(proto.name.as_str()) {
                Entry::Vacant(entry) => {
                    entry.insert(proto);
                }
                Entry::Occupied(mut entry) => {
                    if proto.version > entry.get().version {
                        entry.insert(proto);
                    }
                }
            }
        }

        if best.is_empty() {
            return Err(RlpxError::UselessPeer)
        }

        let mut offset = BASE_PROTOCOL_LENGTH;
        let mut shared = Vec::with_capacity(best.len());
        for proto in best.into_values() {
            shared.push(SharedCapability {
                name: proto.name.clone(),
                version: proto.version,
                offset,
                length: proto.length,
            });
            offset += proto.length;
        }
        Ok(Self(shared))
    }

    /// The negotiated capabilities, in window order.
    pub fn iter(&self) -> impl Iterator<Item = &SharedCapability> {
        self.0.iter()
    }

    /// Number of negotiated capabilities.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty (never true for a negotiated session).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Finds the capability whose window contains the absolute code.
    pub fn find_by_code(&self, code: u64) -> Option<&SharedCapability> {
        self.0.iter().find(|cap| cap.contains(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, version: u32, length: u64) -> ProtocolSpec {
        ProtocolSpec::new(name, version, length)
    }

    #[test]
    fn single_common_capability() {
        let local = [spec("eth", 66, 17), spec("snap", 1, 8)];
        let peer = [Capability::new("eth", 66), Capability::new("les", 2)];

        let shared = SharedCapabilities::try_new(&local, &peer).unwrap();
        assert_eq!(shared.len(), 1);
        let eth = shared.iter().next().unwrap();
        assert_eq!(eth.name, "eth");
        assert_eq!(eth.version, 66);
        assert_eq!(eth.offset, 16);
        assert_eq!(eth.length, 17);
        assert!(eth.contains(16));
        assert!(eth.contains(32));
        assert!(!eth.contains(33));
        assert!(shared.find_by_code(33).is_none());
    }

    #[test]
    fn windows_are_contiguous_and_name_ordered() {
        let local = [spec("snap", 1, 8), spec("eth", 66, 17)];
        let peer = [Capability::new("eth", 66), Capability::new("snap", 1)];

        let shared = SharedCapabilities::try_new(&local, &peer).unwrap();
        let caps: Vec<_> = shared.iter().collect();
        assert_eq!(caps.len(), 2);
        // "eth" sorts before "snap" regardless of registration order
        assert_eq!((caps[0].name.as_str(), caps[0].offset, caps[0].length), ("eth", 16, 17));
        assert_eq!((caps[1].name.as_str(), caps[1].offset, caps[1].length), ("snap", 33, 8));
    }

    #[test]
    fn highest_common_version_wins() {
        let local = [spec("eth", 66, 17), spec("eth", 67, 17)];
        let peer = [Capability::new("eth", 66), Capability::new("eth", 67)];

        let shared = SharedCapabilities::try_new(&local, &peer).unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared.iter().next().unwrap().version, 67);
    }

    #[test]
    fn no_intersection_is_useless() {
        let local = [spec("eth", 66, 17)];
        let peer = [Capability::new("eth", 65), Capability::new("les", 2)];
        assert!(matches!(
            SharedCapabilities::try_new(&local, &peer),
            Err(RlpxError::UselessPeer)
        ));
    }
}
