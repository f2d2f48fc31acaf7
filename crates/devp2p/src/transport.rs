//! The boundary between the server and the session layer.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use alloy_primitives::Bytes;
use async_trait::async_trait;
use devp2p_enode::NodeRecord;
use secp256k1::SecretKey;
use tokio_util::sync::CancellationToken;

use crate::error::{StreamError, TransportError};

/// The registration form of a sub-protocol: its wire name and version plus
/// the number of message codes it reserves on the multiplexed channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProtocolSpec {
    /// Wire name, e.g. `"eth"`.
    pub name: String,
    /// Version advertised in the hello message.
    pub version: u32,
    /// Width of the message-code window the protocol reserves.
    pub length: u64,
}

impl ProtocolSpec {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, version: u32, length: u64) -> Self {
        Self { name: name.into(), version, length }
    }
}

/// What a node knows about itself or about a connected peer.
#[derive(Clone, Debug)]
pub struct Info {
    /// Client software identifier.
    pub client: String,
    /// The node's address record.
    pub enode: NodeRecord,
    /// Advertised (for the local node) or negotiated (for a session)
    /// sub-protocols.
    pub capabilities: Vec<ProtocolSpec>,
    /// The TCP port the node claims to listen on.
    pub listen_port: u16,
}

/// A message delivered on a logical stream; the code is relative to the
/// stream's window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMsg {
    /// Sub-protocol-relative message code.
    pub code: u64,
    /// Message payload, decompressed.
    pub data: Bytes,
}

/// Write half of a logical stream. Cheap to share; writes from different
/// tasks serialize at the session's frame codec.
#[async_trait]
pub trait MsgWriter: Send + Sync + 'static {
    /// Writes a message with a sub-protocol-relative code.
    async fn write_msg(&self, code: u64, payload: &[u8]) -> Result<(), StreamError>;
}

/// One logical, ordered message channel within a session, belonging to one
/// negotiated sub-protocol.
#[async_trait]
pub trait ProtocolStream: Send + 'static {
    /// The sub-protocol this stream belongs to.
    fn protocol(&self) -> &ProtocolSpec;

    /// A shareable writer for this stream.
    fn writer(&self) -> Arc<dyn MsgWriter>;

    /// Waits for the next message. Returns [`StreamError::Closed`] once the
    /// session is gone and all buffered messages were drained.
    async fn read_msg(&mut self) -> Result<RawMsg, StreamError>;

    /// Like [`ProtocolStream::read_msg`] with a deadline.
    async fn read_msg_timeout(&mut self, timeout: Duration) -> Result<RawMsg, StreamError> {
        tokio::time::timeout(timeout, self.read_msg())
            .await
            .map_err(|_| StreamError::Timeout)?
    }
}

/// The object-safe portion of a session kept alive for the peer table.
pub trait SessionHandle: Send + Sync + 'static {
    /// Whether the session has been closed.
    fn is_closed(&self) -> bool;

    /// A token cancelled when the session closes, however that happens.
    fn closed(&self) -> CancellationToken;

    /// Starts an orderly close. Idempotent.
    fn close(&self);

    /// Closes the session signaling that the local peer limit was hit, so
    /// the remote can schedule a retry. Defaults to a plain close.
    fn close_busy(&self) {
        self.close()
    }
}

/// An established, authenticated connection with negotiated sub-protocols.
pub trait Session: SessionHandle + Sized {
    /// The stream type handed to sub-protocol handlers.
    type Stream: ProtocolStream;

    /// Information about the remote node, from its hello.
    fn info(&self) -> &Info;

    /// Takes ownership of the per-capability streams. Yields once; later
    /// calls return an empty vector.
    fn take_streams(&mut self) -> Vec<Self::Stream>;
}

/// A transport dials, accepts and tears down sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Session type produced by this transport.
    type Session: Session;

    /// Binds the listener and prepares for dialing.
    async fn setup(
        &self,
        secret_key: SecretKey,
        protocols: Vec<ProtocolSpec>,
        info: Info,
        bind: SocketAddr,
    ) -> Result<(), TransportError>;

    /// Dials an enode URL, completing the full handshake within `timeout`.
    async fn dial(&self, addr: &str, timeout: Duration)
        -> Result<Self::Session, TransportError>;

    /// Waits for the next fully established inbound session.
    async fn accept(&self) -> Result<Self::Session, TransportError>;

    /// Shuts the listener down.
    async fn close(&self) -> Result<(), TransportError>;
}
