//! Key-derivation helpers for the ECIES envelope.

use alloy_primitives::B256;
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

/// SHA-256 of the input.
pub fn sha256(data: &[u8]) -> B256 {
    B256::from_slice(&Sha256::digest(data))
}

/// HMAC-SHA-256 over the given chunks, with `auth_data` appended last.
pub fn hmac_sha256(key: &[u8], input: &[&[u8]], auth_data: &[u8]) -> B256 {
    let mut hmac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
    for chunk in input {
        hmac.update(chunk);
    }
    hmac.update(auth_data);
    B256::from_slice(&hmac.finalize().into_bytes())
}

/// The x coordinate of the shared Diffie-Hellman point.
pub fn ecdh_x(public: &PublicKey, secret: &SecretKey) -> B256 {
    B256::from_slice(&secp256k1::ecdh::shared_secret_point(public, secret)[..32])
}

/// NIST SP 800-56 single-step (concatenation) KDF over SHA-256.
pub fn kdf(secret: B256, s1: &[u8], dest: &mut [u8]) {
    let mut ctr = 1u32;
    let mut written = 0;
    while written < dest.len() {
        let mut hasher = Sha256::new();
        hasher.update(ctr.to_be_bytes());
        hasher.update(secret.as_slice());
        hasher.update(s1);
        let digest = hasher.finalize();
        let take = digest.len().min(dest.len() - written);
        dest[written..written + take].copy_from_slice(&digest[..take]);
        written += take;
        ctr += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::SECP256K1;

    #[test]
    fn ecdh_is_symmetric() {
        let (sk_a, pk_a) = SECP256K1.generate_keypair(&mut rand::thread_rng());
        let (sk_b, pk_b) = SECP256K1.generate_keypair(&mut rand::thread_rng());
        assert_eq!(ecdh_x(&pk_b, &sk_a), ecdh_x(&pk_a, &sk_b));
    }

    #[test]
    fn kdf_is_deterministic_and_length_exact() {
        let secret = B256::repeat_byte(0x11);
        let mut a = [0u8; 32];
        let mut b = [0u8; 48];
        kdf(secret, &[], &mut a);
        kdf(secret, &[], &mut b);
        assert_eq!(a, b[..32]);
        assert_ne!(b[32..], [0u8; 16]);
    }
}
