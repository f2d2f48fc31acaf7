#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! Node identity for the devp2p stack: 512-bit node ids, `enode://` URLs and
//! [EIP-778](https://eips.ethereum.org/EIPS/eip-778) node records.

use alloy_primitives::B512;
use secp256k1::{PublicKey, SecretKey, SECP256K1};

pub mod enr;
mod node_record;

pub use enr::Enr;
pub use node_record::{NodeRecord, NodeRecordParseError};

/// A node's public identity: the uncompressed secp256k1 public key without the
/// leading `0x04` tag byte.
pub type PeerId = B512;

/// Converts a secp256k1 public key to the 64-byte node id.
pub fn pk2id(pk: &PublicKey) -> PeerId {
    PeerId::from_slice(&pk.serialize_uncompressed()[1..])
}

/// Converts a 64-byte node id back into a secp256k1 public key.
///
/// Fails when the id does not name a point on the curve.
pub fn id2pk(id: PeerId) -> Result<PublicKey, secp256k1::Error> {
    let mut buf = [0u8; 65];
    buf[0] = 4;
    buf[1..].copy_from_slice(id.as_slice());
    PublicKey::from_slice(&buf)
}

/// Returns the node id belonging to the given secret key.
pub fn id_from_secret(secret: &SecretKey) -> PeerId {
    pk2id(&PublicKey::from_secret_key(SECP256K1, secret))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pk2id2pk() {
        let key = SecretKey::new(&mut rand::thread_rng());
        let pk = PublicKey::from_secret_key(SECP256K1, &key);
        assert_eq!(pk, id2pk(pk2id(&pk)).unwrap());
    }

    #[test]
    fn rejects_off_curve_id() {
        assert!(id2pk(PeerId::repeat_byte(0xff)).is_err());
    }
}
