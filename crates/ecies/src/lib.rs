#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! The RLPx ECIES framed transport: the authenticated key-exchange handshake
//! and the per-direction AES-CTR + keccak-MAC frame codec layered over any
//! byte stream.

pub mod algorithm;
pub mod mac;
pub mod stream;
pub mod util;

mod error;

pub use algorithm::Ecies;
pub use error::EciesError;
pub use stream::{EciesCodec, EciesStream};

use alloy_primitives::Bytes;
use bytes::BytesMut;
use devp2p_enode::PeerId;

/// Maximum frame body size: the frame header carries a 3-byte length.
pub const MAX_BODY_SIZE: usize = (1 << 24) - 1;

/// A frame scheduled for egress: the serialized body plus the id of the
/// code window that owns it (0 for the base protocol).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Owner of the multiplexed code window this body belongs to.
    pub protocol_id: u64,
    /// The serialized message body.
    pub data: Bytes,
}

impl Frame {
    /// A frame owned by the base protocol.
    pub fn base(data: Bytes) -> Self {
        Self { protocol_id: 0, data }
    }
}

/// Values written out by an [`EciesCodec`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EgressValue {
    /// The initiator's auth message.
    Auth,
    /// The responder's auth-ack message.
    Ack,
    /// A framed message body, already serialized by the caller.
    Frame(Frame),
}

/// Values produced by an [`EciesCodec`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngressValue {
    /// An auth message arrived, carrying the initiator's node id.
    AuthReceived(PeerId),
    /// The auth-ack arrived.
    AckReceived,
    /// A verified and decrypted frame body.
    Frame(BytesMut),
}
