use std::io;

/// Failures surfaced by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The local or remote node is at its peer limit. Dials failing with
    /// this are rescheduled by the periodic dispatcher.
    #[error("too many peers")]
    TooManyPeers,
    /// The address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// The cryptographic or hello handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// The dial did not complete within the dial timeout.
    #[error("dial timed out")]
    Timeout,
    /// The transport has been shut down.
    #[error("transport is closed")]
    Closed,
    /// Socket-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures surfaced while reading from or writing to a logical stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The owning session is closed; no further messages will arrive.
    #[error("session closed")]
    Closed,
    /// The read deadline fired.
    #[error("read timed out")]
    Timeout,
    /// A message code outside the stream's window was used.
    #[error("message code {0} out of range")]
    CodeOutOfRange(u64),
    /// Any other wire-level violation.
    #[error("{0}")]
    Protocol(String),
}

/// Failures produced by a sub-protocol handler.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The underlying stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// The sub-protocol's own handshake (e.g. the eth status exchange)
    /// failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
    /// Handler-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Failures from a [`PeerStore`](crate::PeerStore).
#[derive(Debug, thiserror::Error)]
pub enum PeerStoreError {
    /// Filesystem failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The stored file is not valid JSON.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Failures from a [`Discovery`](crate::Discovery) component.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A lookup failed.
    #[error("lookup failed: {0}")]
    Lookup(String),
    /// Network-level failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures from the periodic [`Dispatcher`](crate::Dispatcher).
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatcherError {
    /// A job with the same id is already scheduled.
    #[error("job is already tracked")]
    AlreadyTracked,
    /// No job with the given id is scheduled.
    #[error("job not found")]
    NotFound,
}

/// Top-level server failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A sub-protocol handler failed during session setup.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The peer store failed.
    #[error(transparent)]
    PeerStore(#[from] PeerStoreError),
    /// The discovery component failed.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    /// A dial target is not a valid enode URL.
    #[error("invalid enode url: {0}")]
    InvalidEnode(String),
}

impl ServerError {
    /// Whether this failure means the remote (or we) ran out of peer slots,
    /// which makes the address worth retrying later.
    pub fn is_too_many_peers(&self) -> bool {
        matches!(self, Self::Transport(TransportError::TooManyPeers))
    }
}
