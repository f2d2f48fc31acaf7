//! The `eth` status handshake message.

use alloy_primitives::{hex, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use devp2p_forkid::ForkId;

use crate::version::EthVersion;

/// The status message exchanged once per `eth` stream before any other
/// traffic. Peers on a different network, genesis or incompatible fork are
/// dropped based on it.
///
/// The total difficulty is peer-reported and untrusted.
#[derive(Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Status {
    /// The advertised protocol version, e.g. 66.
    pub version: EthVersion,
    /// The network id, as in
    /// [EIP-155](https://eips.ethereum.org/EIPS/eip-155#list-of-chain-ids).
    pub network_id: u64,
    /// Total difficulty of the peer's best chain.
    pub total_difficulty: U256,
    /// The peer's best block hash.
    pub blockhash: B256,
    /// The genesis hash of the peer's chain.
    pub genesis: B256,
    /// The peer's [EIP-2124](https://eips.ethereum.org/EIPS/eip-2124) fork
    /// id.
    pub forkid: ForkId,
}

impl Status {
    /// Returns a builder for the status message.
    pub fn builder() -> StatusBuilder {
        StatusBuilder::default()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Status {{ version: {}, network: {}, td: {}, blockhash: {}, genesis: {}, forkid: {}/{} }}",
            self.version,
            self.network_id,
            self.total_difficulty,
            hex::encode(self.blockhash),
            hex::encode(self.genesis),
            self.forkid.hash,
            self.forkid.next,
        )
    }
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Status")
            .field("version", &self.version)
            .field("network_id", &self.network_id)
            .field("total_difficulty", &self.total_difficulty)
            .field("blockhash", &hex::encode(self.blockhash))
            .field("genesis", &hex::encode(self.genesis))
            .field("forkid", &self.forkid)
            .finish()
    }
}

/// Builder for [`Status`] messages.
#[derive(Debug)]
pub struct StatusBuilder {
    status: Status,
}

impl Default for StatusBuilder {
    fn default() -> Self {
        Self {
            status: Status {
                version: EthVersion::Eth66,
                network_id: 1,
                total_difficulty: U256::ZERO,
                blockhash: B256::ZERO,
                genesis: B256::ZERO,
                forkid: ForkId { hash: Default::default(), next: 0 },
            },
        }
    }
}

impl StatusBuilder {
    /// Consumes the builder.
    pub fn build(self) -> Status {
        self.status
    }

    /// Sets the protocol version.
    pub fn version(mut self, version: EthVersion) -> Self {
        self.status.version = version;
        self
    }

    /// Sets the network id.
    pub fn network_id(mut self, network_id: u64) -> Self {
        self.status.network_id = network_id;
        self
    }

    /// Sets the total difficulty.
    pub fn total_difficulty(mut self, total_difficulty: U256) -> Self {
        self.status.total_difficulty = total_difficulty;
        self
    }

    /// Sets the best block hash.
    pub fn blockhash(mut self, blockhash: B256) -> Self {
        self.status.blockhash = blockhash;
        self
    }

    /// Sets the genesis hash.
    pub fn genesis(mut self, genesis: B256) -> Self {
        self.status.genesis = genesis;
        self
    }

    /// Sets the fork id.
    pub fn forkid(mut self, forkid: ForkId) -> Self {
        self.status.forkid = forkid;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_rlp::{Decodable, Encodable};
    use devp2p_forkid::ForkHash;
    use std::str::FromStr;

    #[test]
    fn encode_network_status_message() {
        let expected = hex!("f850423884024190faa0f8514c4680ef27700751b08f37645309ce65a449616a3ea966bf39dd935bb27ba00d21840abff46b96c84b2ac9e10e4f5cdaeb5693cb665db62a2f3b02d2d57b5bc6845d43d2fd80");
        let status = Status::builder()
            .version(EthVersion::Eth66)
            .network_id(56)
            .total_difficulty(U256::from(37851386u64))
            .blockhash(
                B256::from_str("f8514c4680ef27700751b08f37645309ce65a449616a3ea966bf39dd935bb27b")
                    .unwrap(),
            )
            .genesis(
                B256::from_str("0d21840abff46b96c84b2ac9e10e4f5cdaeb5693cb665db62a2f3b02d2d57b5b")
                    .unwrap(),
            )
            .forkid(ForkId { hash: ForkHash(hex!("5d43d2fd")), next: 0 })
            .build();

        let mut rlp_status = vec![];
        status.encode(&mut rlp_status);
        assert_eq!(rlp_status, expected);
    }

    #[test]
    fn decode_network_status_message() {
        let data = hex!("f850423884024190faa0f8514c4680ef27700751b08f37645309ce65a449616a3ea966bf39dd935bb27ba00d21840abff46b96c84b2ac9e10e4f5cdaeb5693cb665db62a2f3b02d2d57b5bc6845d43d2fd80");
        let status = Status::decode(&mut data.as_slice()).unwrap();
        assert_eq!(status.version, EthVersion::Eth66);
        assert_eq!(status.network_id, 56);
        assert_eq!(status.total_difficulty, U256::from(37851386u64));
        assert_eq!(status.forkid, ForkId { hash: ForkHash(hex!("5d43d2fd")), next: 0 });
    }

    #[test]
    fn decode_another_network_status_message() {
        let data = hex!("f86142820834936d68fcffffffffffffffffffffffffdeab81b8a0523e8163a6d620a4cc152c547a05f28a03fec91a2a615194cb86df9731372c0ca06499dccdc7c7def3ebb1ce4c6ee27ec6bd02aee570625ca391919faf77ef27bdc6841a67ccd880");
        let status = Status::decode(&mut data.as_slice()).unwrap();
        assert_eq!(status.version, EthVersion::Eth66);
        assert_eq!(status.network_id, 2100);
        assert_eq!(
            status.total_difficulty,
            U256::from_str("0x000000000000000000000000006d68fcffffffffffffffffffffffffdeab81b8")
                .unwrap(),
        );
        assert_eq!(status.forkid, ForkId { hash: ForkHash(hex!("1a67ccd8")), next: 0 });
    }

    #[test]
    fn status_roundtrip() {
        let status = Status::builder()
            .network_id(1)
            .total_difficulty(U256::from(17_179_869_184u64))
            .blockhash(B256::repeat_byte(7))
            .genesis(B256::repeat_byte(9))
            .forkid(ForkId { hash: ForkHash([0xfc, 0x64, 0xec, 0x04]), next: 1_150_000 })
            .build();
        let mut encoded = Vec::new();
        status.encode(&mut encoded);
        assert_eq!(encoded.len(), status.length());
        assert_eq!(Status::decode(&mut encoded.as_slice()).unwrap(), status);
    }
}
