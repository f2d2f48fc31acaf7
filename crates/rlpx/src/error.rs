use std::io;

use devp2p::{StreamError, TransportError};
use devp2p_ecies::EciesError;

use crate::disconnect::DisconnectReason;

/// Failures of the RLPx session layer.
#[derive(Debug, thiserror::Error)]
pub enum RlpxError {
    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The encrypted transport failed (handshake or frame MACs).
    #[error(transparent)]
    Ecies(#[from] EciesError),
    /// Malformed RLP in a base-protocol message.
    #[error(transparent)]
    Rlp(#[from] alloy_rlp::Error),
    /// Snappy (de)compression failed.
    #[error(transparent)]
    Snap(#[from] snap::Error),
    /// The handshake did not complete within its deadline.
    #[error("handshake timed out")]
    HandshakeTimeout,
    /// The connection closed before the hello exchange finished.
    #[error("connection closed during handshake")]
    HandshakeEof,
    /// The first message was not a hello.
    #[error("expected hello, got message {0:#x}")]
    NonHelloMessage(u64),
    /// A second hello arrived after the handshake.
    #[error("hello received after handshake")]
    HelloAfterHandshake,
    /// The peer disconnected us with the given reason.
    #[error("disconnected by peer: {0}")]
    Disconnected(DisconnectReason),
    /// No sub-protocol is supported by both sides.
    #[error("no shared capabilities")]
    UselessPeer,
    /// The remote node id equals the local one.
    #[error("connected to self")]
    ConnectedToSelf,
    /// The hello identity does not match the ECIES-authenticated one.
    #[error("hello identity does not match the transport identity")]
    UnexpectedHandshakeIdentity,
    /// The payload exceeds [`crate::MAX_PAYLOAD_SIZE`].
    #[error("message of {0} bytes exceeds the payload limit")]
    MessageTooBig(usize),
    /// A frame body carried no message code.
    #[error("empty message")]
    EmptyMessage,
    /// The message-code byte is not a valid single-byte RLP integer.
    #[error("invalid message code byte {0:#x}")]
    InvalidMessageCode(u8),
    /// A reserved base-protocol code without defined meaning was used.
    #[error("unknown reserved message {0:#x}")]
    UnknownReservedMessage(u64),
    /// A message code outside every negotiated window was used.
    #[error("message code {0} outside all capability windows")]
    MessageCodeOutOfRange(u64),
    /// The session is closed.
    #[error("session closed")]
    SessionClosed,
    /// The peer did not answer a ping in time.
    #[error("ping timed out")]
    PingTimeout,
}

impl From<RlpxError> for StreamError {
    fn from(err: RlpxError) -> Self {
        match err {
            RlpxError::SessionClosed | RlpxError::Disconnected(_) => Self::Closed,
            RlpxError::MessageCodeOutOfRange(code) => Self::CodeOutOfRange(code),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<RlpxError> for TransportError {
    fn from(err: RlpxError) -> Self {
        match err {
            RlpxError::Disconnected(DisconnectReason::TooManyPeers) => Self::TooManyPeers,
            RlpxError::Io(io) => Self::Io(io),
            RlpxError::HandshakeTimeout => Self::Timeout,
            other => Self::Handshake(other.to_string()),
        }
    }
}
