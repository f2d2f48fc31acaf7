#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! Types and the per-peer handler for the `eth/66` wire protocol:
//! <https://github.com/ethereum/devp2p/blob/master/caps/eth.md>

mod backend;
mod error;
mod handler;
mod message;
mod status;
mod types;
mod version;

pub use backend::Backend;
pub use error::{EthStreamError, RequestError, StatusMismatch};
pub use handler::{EthPeer, EthProtocol, HANDSHAKE_TIMEOUT, REQUEST_TIMEOUT};
pub use message::{EthMessageId, RequestPair, UnknownMessageId};
pub use status::{Status, StatusBuilder};
pub use types::{
    BlockHashNumber, GetBlockHeaders, HashList, HashOrNumber, HeadersDirection, NewBlockHashes,
    RawBody,
};
pub use version::{EthVersion, ParseVersionError};
