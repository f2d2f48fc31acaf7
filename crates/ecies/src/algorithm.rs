//! The ECIES handshake state machine and frame cipher.
//!
//! One [`Ecies`] value holds everything a single connection needs: the static
//! and ephemeral keys, the handshake transcript, and (after the auth/ack
//! exchange) the per-direction AES-256-CTR ciphers and running MACs.

use aes::{Aes128, Aes256};
use alloy_primitives::{keccak256, Bytes, B128, B256};
use alloy_rlp::{Encodable, RlpEncodable};
use bytes::{BufMut, BytesMut};
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr64BE;
use devp2p_enode::{id2pk, pk2id, PeerId};
use rand::{thread_rng, Rng};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    Message, PublicKey, SecretKey, SECP256K1,
};
use sha3::{Digest, Keccak256};

use crate::{
    mac::FrameMac,
    util::{ecdh_x, hmac_sha256, kdf, sha256},
    EciesError, MAX_BODY_SIZE,
};

/// Historical protocol version byte carried at the end of auth and ack.
const HANDSHAKE_VERSION: u8 = 4;

/// auth plaintext: signature(65) || keccak(ephemeral-id)(32) || id(64) ||
/// nonce(32) || version(1).
const AUTH_BODY_LEN: usize = 65 + 32 + 64 + 32 + 1;

/// ack plaintext: ephemeral-id(64) || nonce(32) || version(1).
const ACK_BODY_LEN: usize = 64 + 32 + 1;

/// ECIES envelope overhead: ephemeral pubkey(65) || iv(16) || tag(32).
const ENVELOPE_OVERHEAD: usize = 65 + 16 + 32;

/// The frame header tuple; `context_id` is reserved and always zero.
#[derive(RlpEncodable)]
struct HeaderMeta {
    protocol_id: u64,
    context_id: u64,
}

/// Connection-level ECIES state.
pub struct Ecies {
    secret_key: SecretKey,
    public_key: PublicKey,
    remote_public_key: Option<PublicKey>,
    remote_id: Option<PeerId>,

    ephemeral_secret_key: SecretKey,
    ephemeral_public_key: PublicKey,
    remote_ephemeral_public_key: Option<PublicKey>,
    ephemeral_shared_secret: Option<B256>,

    nonce: B256,
    remote_nonce: Option<B256>,

    init_msg: Option<Bytes>,
    remote_init_msg: Option<Bytes>,

    aes_secret: Option<B256>,
    mac_secret: Option<B256>,

    body_size: Option<usize>,
    egress_aes: Option<Ctr64BE<Aes256>>,
    ingress_aes: Option<Ctr64BE<Aes256>>,
    egress_mac: Option<FrameMac>,
    ingress_mac: Option<FrameMac>,
}

impl std::fmt::Debug for Ecies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ecies").field("remote_id", &self.remote_id).finish_non_exhaustive()
    }
}

impl Ecies {
    fn new(secret_key: SecretKey, remote_id: Option<PeerId>) -> Result<Self, EciesError> {
        let public_key = PublicKey::from_secret_key(SECP256K1, &secret_key);
        let remote_public_key = remote_id.map(id2pk).transpose()?;
        let ephemeral_secret_key = SecretKey::new(&mut thread_rng());
        let ephemeral_public_key = PublicKey::from_secret_key(SECP256K1, &ephemeral_secret_key);

        Ok(Self {
            secret_key,
            public_key,
            remote_public_key,
            remote_id,
            ephemeral_secret_key,
            ephemeral_public_key,
            remote_ephemeral_public_key: None,
            ephemeral_shared_secret: None,
            nonce: B256::from(thread_rng().gen::<[u8; 32]>()),
            remote_nonce: None,
            init_msg: None,
            remote_init_msg: None,
            aes_secret: None,
            mac_secret: None,
            body_size: None,
            egress_aes: None,
            ingress_aes: None,
            egress_mac: None,
            ingress_mac: None,
        })
    }

    /// State for the dialing side, which knows the responder's identity.
    pub fn new_client(secret_key: SecretKey, remote_id: PeerId) -> Result<Self, EciesError> {
        Self::new(secret_key, Some(remote_id))
    }

    /// State for the listening side; the initiator's identity arrives with
    /// the auth message.
    pub fn new_server(secret_key: SecretKey) -> Result<Self, EciesError> {
        Self::new(secret_key, None)
    }

    /// The remote node id, once known.
    pub fn remote_id(&self) -> Option<PeerId> {
        self.remote_id
    }

    /// The local node id.
    pub fn local_id(&self) -> PeerId {
        pk2id(&self.public_key)
    }

    // --- ECIES envelope ---

    fn encrypt_message(&self, data: &[u8], out: &mut BytesMut) -> Result<(), EciesError> {
        let remote_public_key =
            self.remote_public_key.as_ref().ok_or(EciesError::HandshakeNotCompleted)?;

        let ephemeral = SecretKey::new(&mut thread_rng());
        let x = ecdh_x(remote_public_key, &ephemeral);
        let mut key = [0u8; 32];
        kdf(x, &[], &mut key);
        let mac_key = sha256(&key[16..32]);

        let iv = B128::from(thread_rng().gen::<[u8; 16]>());
        let mut encrypted = data.to_vec();
        let mut cipher = Ctr64BE::<Aes128>::new((&key[..16]).into(), iv.as_slice().into());
        cipher.apply_keystream(&mut encrypted);

        // the u16 length prefix written by the caller is authenticated data
        let total_size = (ENVELOPE_OVERHEAD + data.len()) as u16;
        let tag =
            hmac_sha256(mac_key.as_slice(), &[iv.as_slice(), &encrypted], &total_size.to_be_bytes());

        out.extend_from_slice(
            &PublicKey::from_secret_key(SECP256K1, &ephemeral).serialize_uncompressed(),
        );
        out.extend_from_slice(iv.as_slice());
        out.extend_from_slice(&encrypted);
        out.extend_from_slice(tag.as_slice());
        Ok(())
    }

    /// Decrypts an envelope. `data` is the full wire message including the
    /// u16 length prefix, which participates in the tag.
    fn decrypt_message<'a>(&self, data: &'a mut [u8]) -> Result<&'a mut [u8], EciesError> {
        if data.len() < 2 + ENVELOPE_OVERHEAD {
            return Err(EciesError::HandshakeTruncated)
        }
        let (auth_data, encrypted) = data.split_at_mut(2);
        let (pubkey_bytes, rest) = encrypted.split_at_mut(65);
        let public_key = PublicKey::from_slice(pubkey_bytes)?;
        let (iv, rest) = rest.split_at_mut(16);
        let split = rest.len() - 32;
        let (ciphertext, tag_bytes) = rest.split_at_mut(split);

        let x = ecdh_x(&public_key, &self.secret_key);
        let mut key = [0u8; 32];
        kdf(x, &[], &mut key);
        let mac_key = sha256(&key[16..32]);

        let tag = B256::from_slice(tag_bytes);
        let check = hmac_sha256(mac_key.as_slice(), &[iv, ciphertext], auth_data);
        if check != tag {
            return Err(EciesError::TagCheckFailed)
        }

        let mut cipher = Ctr64BE::<Aes128>::new((&key[..16]).into(), (&*iv).into());
        cipher.apply_keystream(ciphertext);
        Ok(ciphertext)
    }

    // --- auth ---

    fn create_auth_unencrypted(&self) -> Result<BytesMut, EciesError> {
        let remote_public_key =
            self.remote_public_key.as_ref().ok_or(EciesError::HandshakeNotCompleted)?;
        let x = ecdh_x(remote_public_key, &self.secret_key);
        let msg = x ^ self.nonce;
        let (rec_id, sig) = SECP256K1
            .sign_ecdsa_recoverable(
                &Message::from_digest_slice(msg.as_slice())?,
                &self.ephemeral_secret_key,
            )
            .serialize_compact();

        let mut out = BytesMut::with_capacity(AUTH_BODY_LEN);
        out.extend_from_slice(&sig);
        out.put_u8(rec_id.to_i32() as u8);
        out.extend_from_slice(keccak256(pk2id(&self.ephemeral_public_key)).as_slice());
        out.extend_from_slice(self.local_id().as_slice());
        out.extend_from_slice(self.nonce.as_slice());
        out.put_u8(HANDSHAKE_VERSION);
        Ok(out)
    }

    /// Writes the length-prefixed auth message and records it for the MAC
    /// transcript.
    pub fn write_auth(&mut self, out: &mut BytesMut) -> Result<(), EciesError> {
        let unencrypted = self.create_auth_unencrypted()?;

        let mut msg = BytesMut::new();
        msg.put_u16(0);
        self.encrypt_message(&unencrypted, &mut msg)?;
        let len = (msg.len() - 2) as u16;
        msg[..2].copy_from_slice(&len.to_be_bytes());

        self.init_msg = Some(Bytes::copy_from_slice(&msg));
        out.extend_from_slice(&msg);
        Ok(())
    }

    fn parse_auth_unencrypted(&mut self, data: &[u8]) -> Result<PeerId, EciesError> {
        if data.len() < AUTH_BODY_LEN {
            return Err(EciesError::HandshakeTruncated)
        }
        let sig = RecoverableSignature::from_compact(
            &data[..64],
            RecoveryId::from_i32(data[64] as i32)?,
        )?;
        // data[65..97] is keccak(ephemeral-id), recomputed below via recovery
        let remote_id = PeerId::from_slice(&data[97..161]);
        let remote_public_key = id2pk(remote_id)?;
        let remote_nonce = B256::from_slice(&data[161..193]);
        // the trailing version byte is historical and ignored

        let x = ecdh_x(&remote_public_key, &self.secret_key);
        let msg = x ^ remote_nonce;
        let remote_ephemeral =
            SECP256K1.recover_ecdsa(&Message::from_digest_slice(msg.as_slice())?, &sig)?;

        self.remote_id = Some(remote_id);
        self.remote_public_key = Some(remote_public_key);
        self.remote_nonce = Some(remote_nonce);
        self.remote_ephemeral_public_key = Some(remote_ephemeral);
        self.ephemeral_shared_secret =
            Some(ecdh_x(&remote_ephemeral, &self.ephemeral_secret_key));
        Ok(remote_id)
    }

    /// Consumes the full auth wire message (prefix included) and returns the
    /// initiator's node id.
    pub fn read_auth(&mut self, data: &mut [u8]) -> Result<PeerId, EciesError> {
        self.remote_init_msg = Some(Bytes::copy_from_slice(data));
        let unencrypted = self.decrypt_message(data)?;
        let unencrypted = unencrypted.to_vec();
        self.parse_auth_unencrypted(&unencrypted)
    }

    // --- ack ---

    fn create_ack_unencrypted(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(ACK_BODY_LEN);
        out.extend_from_slice(pk2id(&self.ephemeral_public_key).as_slice());
        out.extend_from_slice(self.nonce.as_slice());
        out.put_u8(HANDSHAKE_VERSION);
        out
    }

    /// Writes the length-prefixed ack message and switches to frame mode.
    pub fn write_ack(&mut self, out: &mut BytesMut) -> Result<(), EciesError> {
        let unencrypted = self.create_ack_unencrypted();

        let mut msg = BytesMut::new();
        msg.put_u16(0);
        self.encrypt_message(&unencrypted, &mut msg)?;
        let len = (msg.len() - 2) as u16;
        msg[..2].copy_from_slice(&len.to_be_bytes());

        self.init_msg = Some(Bytes::copy_from_slice(&msg));
        out.extend_from_slice(&msg);
        self.setup_frame(true)
    }

    fn parse_ack_unencrypted(&mut self, data: &[u8]) -> Result<(), EciesError> {
        if data.len() < ACK_BODY_LEN {
            return Err(EciesError::HandshakeTruncated)
        }
        let remote_ephemeral = id2pk(PeerId::from_slice(&data[..64]))?;
        self.remote_nonce = Some(B256::from_slice(&data[64..96]));
        self.remote_ephemeral_public_key = Some(remote_ephemeral);
        self.ephemeral_shared_secret =
            Some(ecdh_x(&remote_ephemeral, &self.ephemeral_secret_key));
        Ok(())
    }

    /// Consumes the full ack wire message and switches to frame mode.
    pub fn read_ack(&mut self, data: &mut [u8]) -> Result<(), EciesError> {
        self.remote_init_msg = Some(Bytes::copy_from_slice(data));
        let unencrypted = self.decrypt_message(data)?;
        let unencrypted = unencrypted.to_vec();
        self.parse_ack_unencrypted(&unencrypted)?;
        self.setup_frame(false)
    }

    // --- secret schedule ---

    fn setup_frame(&mut self, incoming_first: bool) -> Result<(), EciesError> {
        let ephemeral_shared =
            self.ephemeral_shared_secret.ok_or(EciesError::HandshakeNotCompleted)?;
        let remote_nonce = self.remote_nonce.ok_or(EciesError::HandshakeNotCompleted)?;
        let init_msg = self.init_msg.clone().ok_or(EciesError::HandshakeNotCompleted)?;
        let remote_init_msg =
            self.remote_init_msg.clone().ok_or(EciesError::HandshakeNotCompleted)?;

        // keccak(responder-nonce || initiator-nonce), same value on both ends
        let mut hasher = Keccak256::new();
        if incoming_first {
            hasher.update(self.nonce);
            hasher.update(remote_nonce);
        } else {
            hasher.update(remote_nonce);
            hasher.update(self.nonce);
        }
        let h_nonce = B256::from_slice(&hasher.finalize());

        let shared_secret = keccak_pair(ephemeral_shared, h_nonce);
        let aes_secret = keccak_pair(ephemeral_shared, shared_secret);
        let mac_secret = keccak_pair(ephemeral_shared, aes_secret);
        self.aes_secret = Some(aes_secret);
        self.mac_secret = Some(mac_secret);

        let iv = B128::ZERO;
        self.egress_aes =
            Some(Ctr64BE::<Aes256>::new(aes_secret.as_slice().into(), iv.as_slice().into()));
        self.ingress_aes =
            Some(Ctr64BE::<Aes256>::new(aes_secret.as_slice().into(), iv.as_slice().into()));

        let mut egress_mac = FrameMac::new(mac_secret);
        egress_mac.update((mac_secret ^ remote_nonce).as_slice());
        egress_mac.update(&init_msg);
        self.egress_mac = Some(egress_mac);

        let mut ingress_mac = FrameMac::new(mac_secret);
        ingress_mac.update((mac_secret ^ self.nonce).as_slice());
        ingress_mac.update(&remote_init_msg);
        self.ingress_mac = Some(ingress_mac);
        Ok(())
    }

    /// The derived frame secrets, for handshake diagnostics.
    pub fn frame_secrets(&self) -> Option<(B256, B256)> {
        Some((self.aes_secret?, self.mac_secret?))
    }

    // --- frames ---

    /// Size of an encoded frame header: 16 bytes of data plus the MAC.
    pub const fn header_len() -> usize {
        32
    }

    /// Wire size of the pending frame body (padded data plus the MAC), once
    /// a header has been read.
    pub fn body_len(&self) -> Option<usize> {
        self.body_size.map(|size| size.div_ceil(16) * 16 + 16)
    }

    /// Writes an encrypted, MACed frame header announcing `body_size` bytes
    /// owned by `protocol_id`.
    pub fn write_header(
        &mut self,
        out: &mut BytesMut,
        body_size: usize,
        protocol_id: u64,
    ) -> Result<(), EciesError> {
        if body_size > MAX_BODY_SIZE {
            return Err(EciesError::BodyTooLarge(body_size))
        }

        let mut header = [0u8; 16];
        header[..3].copy_from_slice(&(body_size as u32).to_be_bytes()[1..]);
        let mut meta = Vec::with_capacity(13);
        HeaderMeta { protocol_id, context_id: 0 }.encode(&mut meta);
        header[3..3 + meta.len()].copy_from_slice(&meta);

        let egress_aes = self.egress_aes.as_mut().ok_or(EciesError::HandshakeNotCompleted)?;
        let egress_mac = self.egress_mac.as_mut().ok_or(EciesError::HandshakeNotCompleted)?;
        egress_aes.apply_keystream(&mut header);
        egress_mac.update_header(&header);

        out.reserve(Self::header_len());
        out.extend_from_slice(&header);
        out.extend_from_slice(egress_mac.digest().as_slice());
        Ok(())
    }

    /// Verifies and decrypts a frame header, returning the body size.
    pub fn read_header(&mut self, data: &mut [u8]) -> Result<usize, EciesError> {
        if data.len() < Self::header_len() {
            return Err(EciesError::FrameTruncated)
        }
        let (header_bytes, mac_bytes) = data.split_at_mut(16);
        let header_ct: &[u8; 16] =
            (&*header_bytes).try_into().map_err(|_| EciesError::FrameTruncated)?;

        let ingress_mac = self.ingress_mac.as_mut().ok_or(EciesError::HandshakeNotCompleted)?;
        ingress_mac.update_header(header_ct);
        if ingress_mac.digest().as_slice() != &mac_bytes[..16] {
            return Err(EciesError::HeaderMacMismatch)
        }

        let ingress_aes = self.ingress_aes.as_mut().ok_or(EciesError::HandshakeNotCompleted)?;
        ingress_aes.apply_keystream(header_bytes);

        let size = u32::from_be_bytes([0, header_bytes[0], header_bytes[1], header_bytes[2]]) as usize;
        self.body_size = Some(size);
        Ok(size)
    }

    /// Writes the padded, encrypted body followed by its MAC.
    pub fn write_body(&mut self, out: &mut BytesMut, body: &[u8]) -> Result<(), EciesError> {
        let padded = body.len().div_ceil(16) * 16;
        let start = out.len();
        out.resize(start + padded, 0);
        out[start..start + body.len()].copy_from_slice(body);

        let egress_aes = self.egress_aes.as_mut().ok_or(EciesError::HandshakeNotCompleted)?;
        let egress_mac = self.egress_mac.as_mut().ok_or(EciesError::HandshakeNotCompleted)?;
        egress_aes.apply_keystream(&mut out[start..]);
        egress_mac.update_body(&out[start..]);

        out.extend_from_slice(egress_mac.digest().as_slice());
        Ok(())
    }

    /// Verifies and decrypts a frame body, returning the unpadded payload.
    pub fn read_body<'a>(&mut self, data: &'a mut [u8]) -> Result<&'a mut [u8], EciesError> {
        let body_size = self.body_size.take().ok_or(EciesError::HeaderNotRead)?;
        if data.len() < 16 || data.len() - 16 < body_size {
            return Err(EciesError::FrameTruncated)
        }
        let split = data.len() - 16;
        let (body, mac_bytes) = data.split_at_mut(split);

        let ingress_mac = self.ingress_mac.as_mut().ok_or(EciesError::HandshakeNotCompleted)?;
        ingress_mac.update_body(body);
        if ingress_mac.digest().as_slice() != &mac_bytes[..16] {
            return Err(EciesError::BodyMacMismatch)
        }

        let ingress_aes = self.ingress_aes.as_mut().ok_or(EciesError::HandshakeNotCompleted)?;
        ingress_aes.apply_keystream(body);
        Ok(&mut body[..body_size])
    }
}

fn keccak_pair(a: B256, b: B256) -> B256 {
    let mut hasher = Keccak256::new();
    hasher.update(a);
    hasher.update(b);
    B256::from_slice(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshaken_pair() -> (Ecies, Ecies) {
        let client_key = SecretKey::new(&mut thread_rng());
        let server_key = SecretKey::new(&mut thread_rng());
        let server_id = devp2p_enode::id_from_secret(&server_key);

        let mut client = Ecies::new_client(client_key, server_id).unwrap();
        let mut server = Ecies::new_server(server_key).unwrap();

        let mut auth = BytesMut::new();
        client.write_auth(&mut auth).unwrap();
        let initiator = server.read_auth(&mut auth).unwrap();
        assert_eq!(initiator, devp2p_enode::id_from_secret(&client_key));

        let mut ack = BytesMut::new();
        server.write_ack(&mut ack).unwrap();
        client.read_ack(&mut ack).unwrap();

        (client, server)
    }

    #[test]
    fn handshake_derives_matching_secrets() {
        let (client, server) = handshaken_pair();
        let client_secrets = client.frame_secrets().unwrap();
        let server_secrets = server.frame_secrets().unwrap();
        assert_eq!(client_secrets, server_secrets);
    }

    #[test]
    fn auth_rejected_by_wrong_responder() {
        let client_key = SecretKey::new(&mut thread_rng());
        let server_key = SecretKey::new(&mut thread_rng());
        let other_key = SecretKey::new(&mut thread_rng());

        let mut client =
            Ecies::new_client(client_key, devp2p_enode::id_from_secret(&server_key)).unwrap();
        let mut auth = BytesMut::new();
        client.write_auth(&mut auth).unwrap();

        // decrypting under a different static key must fail the tag check
        let mut other = Ecies::new_server(other_key).unwrap();
        assert!(matches!(other.read_auth(&mut auth), Err(EciesError::TagCheckFailed)));
    }

    #[test]
    fn frame_roundtrip() {
        let (mut client, mut server) = handshaken_pair();

        for payload in [&b"hello world"[..], &[0u8; 16], &[7u8; 1000]] {
            let mut wire = BytesMut::new();
            client.write_header(&mut wire, payload.len(), 0).unwrap();
            client.write_body(&mut wire, payload).unwrap();

            let (header, body) = wire.split_at_mut(Ecies::header_len());
            let size = server.read_header(header).unwrap();
            assert_eq!(size, payload.len());
            assert_eq!(server.body_len(), Some(body.len()));
            let decrypted = server.read_body(body).unwrap();
            assert_eq!(decrypted, payload);
        }
    }

    #[test]
    fn corrupted_header_fails_mac_check() {
        let (mut client, mut server) = handshaken_pair();

        let mut wire = BytesMut::new();
        client.write_header(&mut wire, 4, 0).unwrap();
        wire[0] ^= 0x01;
        assert!(matches!(
            server.read_header(&mut wire),
            Err(EciesError::HeaderMacMismatch)
        ));
    }

    #[test]
    fn corrupted_body_fails_mac_check() {
        let (mut client, mut server) = handshaken_pair();

        let mut wire = BytesMut::new();
        client.write_header(&mut wire, 5, 0).unwrap();
        client.write_body(&mut wire, b"01234").unwrap();

        let (header, body) = wire.split_at_mut(Ecies::header_len());
        server.read_header(header).unwrap();
        body[0] ^= 0x01;
        assert!(matches!(server.read_body(body), Err(EciesError::BodyMacMismatch)));
    }

    #[test]
    fn oversized_body_is_rejected() {
        let (mut client, _) = handshaken_pair();
        let mut wire = BytesMut::new();
        assert!(matches!(
            client.write_header(&mut wire, MAX_BODY_SIZE + 1, 0),
            Err(EciesError::BodyTooLarge(_))
        ));
    }
}
