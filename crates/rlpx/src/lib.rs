#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! The RLPx session layer.
//!
//! Builds on [`devp2p_ecies`] for the encrypted framed transport and adds
//! the hello/capability negotiation, the base-protocol housekeeping
//! (ping/pong, disconnect) and the logical-stream multiplexer that hands one
//! ordered message channel to every negotiated sub-protocol. [`Rlpx`] wires
//! the whole thing into the server's [`devp2p::Transport`] boundary.

mod capability;
mod disconnect;
mod error;
mod hello;
mod session;
mod stream;
mod transport;

pub use capability::{Capability, SharedCapabilities, SharedCapability};
pub use disconnect::{DisconnectReason, UnknownDisconnectReason};
pub use error::RlpxError;
pub use hello::Hello;
pub use session::{Session, SessionContext};
pub use stream::{RlpxStream, StreamWriter};
pub use transport::{Rlpx, TcpSession};

/// The `p2p` base protocol version advertised in the hello message.
pub const BASE_PROTOCOL_VERSION: u8 = 5;

/// Base protocol version at which snappy frame compression turns on.
pub(crate) const SNAPPY_PROTOCOL_VERSION: u8 = 5;

/// Message codes reserved for the base protocol; capability windows start
/// here.
pub const BASE_PROTOCOL_LENGTH: u64 = 16;

/// Maximum uncompressed message payload, per EIP-706.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024 - 1;

/// Base-protocol message codes.
pub(crate) mod codes {
    pub(crate) const HELLO: u64 = 0x00;
    pub(crate) const DISCONNECT: u64 = 0x01;
    pub(crate) const PING: u64 = 0x02;
    pub(crate) const PONG: u64 = 0x03;
}
