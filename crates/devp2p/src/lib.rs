#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! The devp2p peer server.
//!
//! This crate owns a single node's peer lifecycle: accepting inbound
//! sessions, dialing outbound ones with a bounded worker pool, rescheduling
//! busy peers, tracking the active peer set and fanning out join/leave
//! events. The transport, the discovery source, the durable peer store and
//! the sub-protocol handlers are all collaborators behind traits defined
//! here.

mod config;
mod discovery;
mod error;
mod peer;
mod peerstore;
mod periodic;
mod server;
mod transport;

pub use config::ServerConfig;
pub use discovery::{Discovery, NoopDiscovery};
pub use error::{
    DiscoveryError, DispatcherError, PeerStoreError, ProtocolError, ServerError, StreamError,
    TransportError,
};
pub use peer::{Peer, PeerStatus};
pub use peerstore::{JsonPeerStore, NoopPeerStore, PeerStore};
pub use periodic::{Dispatcher, Job};
pub use server::{EventType, MemberEvent, Protocol, ProtocolHandler, Server};
pub use transport::{
    Info, MsgWriter, ProtocolSpec, ProtocolStream, RawMsg, Session, SessionHandle, Transport,
};

pub use devp2p_enode::{NodeRecord, PeerId};
