//! The RLPx frame MAC.
//!
//! A nonstandard construction: a running Keccak-256 state whose updates mix
//! in the output of a single AES-256 block encryption of the current digest,
//! keyed with the handshake-derived MAC secret. Only the first 16 bytes of
//! the digest are ever used.

use aes::{
    cipher::{BlockEncrypt, KeyInit},
    Aes256Enc,
};
use alloy_primitives::{B128, B256};
use sha3::{Digest, Keccak256};

/// Running MAC state for one direction of a session.
#[derive(Clone)]
pub struct FrameMac {
    secret: B256,
    hasher: Keccak256,
}

impl std::fmt::Debug for FrameMac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameMac").finish_non_exhaustive()
    }
}

impl FrameMac {
    /// Creates a MAC keyed with the given secret.
    pub fn new(secret: B256) -> Self {
        Self { secret, hasher: Keccak256::new() }
    }

    /// Absorbs raw bytes into the keccak state. Used only while seeding the
    /// MAC with the handshake transcript.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data)
    }

    /// Absorbs an encrypted frame header.
    pub fn update_header(&mut self, header_ciphertext: &[u8; 16]) {
        let mut block = self.encrypted_digest();
        for (b, h) in block.iter_mut().zip(header_ciphertext) {
            *b ^= h;
        }
        self.hasher.update(block);
    }

    /// Absorbs an encrypted frame body.
    pub fn update_body(&mut self, body_ciphertext: &[u8]) {
        self.hasher.update(body_ciphertext);
        let prev = self.digest();
        let mut block = self.encrypted_digest();
        for (b, p) in block.iter_mut().zip(prev.as_slice()) {
            *b ^= p;
        }
        self.hasher.update(block);
    }

    /// The first 16 bytes of the current keccak digest.
    pub fn digest(&self) -> B128 {
        B128::from_slice(&self.hasher.clone().finalize()[..16])
    }

    /// AES-256 of the current digest under the MAC secret.
    fn encrypted_digest(&self) -> aes::Block {
        let aes = Aes256Enc::new(self.secret.as_slice().into());
        let mut block = aes::Block::clone_from_slice(self.digest().as_slice());
        aes.encrypt_block(&mut block);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_changes_with_updates() {
        let mut mac = FrameMac::new(B256::repeat_byte(1));
        let before = mac.digest();
        mac.update(b"some seed data");
        assert_ne!(before, mac.digest());
    }

    #[test]
    fn identical_streams_produce_identical_digests() {
        let secret = B256::repeat_byte(7);
        let mut a = FrameMac::new(secret);
        let mut b = FrameMac::new(secret);

        let header = [3u8; 16];
        a.update_header(&header);
        b.update_header(&header);
        assert_eq!(a.digest(), b.digest());

        a.update_body(b"frame body bytes");
        b.update_body(b"frame body bytes");
        assert_eq!(a.digest(), b.digest());

        a.update_body(b"diverging");
        assert_ne!(a.digest(), b.digest());
    }
}
