//! The `eth` protocol version.

use alloy_rlp::{Decodable, Encodable};
use bytes::BufMut;

/// Error thrown when failing to parse a valid [`EthVersion`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown eth protocol version: {0}")]
pub struct ParseVersionError(String);

/// The `eth` protocol version.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum EthVersion {
    /// The `eth` protocol version 66, the first with request ids.
    Eth66 = 66,
}

impl EthVersion {
    /// Returns the total number of message codes the version reserves.
    pub const fn total_messages(&self) -> u64 {
        match self {
            Self::Eth66 => 17,
        }
    }
}

impl TryFrom<u8> for EthVersion {
    type Error = ParseVersionError;

    fn try_from(version: u8) -> Result<Self, Self::Error> {
        match version {
            66 => Ok(Self::Eth66),
            _ => Err(ParseVersionError(version.to_string())),
        }
    }
}

impl From<EthVersion> for u8 {
    fn from(version: EthVersion) -> Self {
        version as Self
    }
}

impl std::fmt::Display for EthVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "eth/{}", *self as u8)
    }
}

impl Encodable for EthVersion {
    fn encode(&self, out: &mut dyn BufMut) {
        (*self as u8).encode(out)
    }

    fn length(&self) -> usize {
        (*self as u8).length()
    }
}

impl Decodable for EthVersion {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let version = u8::decode(buf)?;
        Self::try_from(version).map_err(|_| alloy_rlp::Error::Custom("unknown eth version"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_conversions() {
        assert_eq!(EthVersion::try_from(66).unwrap(), EthVersion::Eth66);
        assert!(EthVersion::try_from(65).is_err());
        assert_eq!(u8::from(EthVersion::Eth66), 66);
        assert_eq!(EthVersion::Eth66.total_messages(), 17);
    }
}
