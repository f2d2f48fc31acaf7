use devp2p::{ProtocolError, StreamError};
use devp2p_forkid::ValidationError;

/// Which status field disagreed during the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusMismatch {
    /// Protocol versions differ.
    Version,
    /// Network ids differ.
    NetworkId,
    /// Genesis hashes differ.
    Genesis,
}

impl std::fmt::Display for StatusMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Version => "protocol version",
            Self::NetworkId => "network id",
            Self::Genesis => "genesis hash",
        };
        f.write_str(s)
    }
}

/// Failures of the per-peer `eth` handler.
#[derive(Debug, thiserror::Error)]
pub enum EthStreamError {
    /// The underlying stream failed.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Malformed RLP payload.
    #[error(transparent)]
    Rlp(#[from] alloy_rlp::Error),
    /// The peer's first message was not a status.
    #[error("expected status, got message {0:#x}")]
    NonStatusMessage(u64),
    /// A status arrived after the handshake.
    #[error("status received after handshake")]
    StatusAfterHandshake,
    /// A status field disagreed.
    #[error("status mismatch: incorrect {0}")]
    StatusMismatch(StatusMismatch),
    /// The peer's fork id is incompatible with the local chain.
    #[error(transparent)]
    ForkId(#[from] ValidationError),
    /// A message code outside the `eth` set was used.
    #[error("unknown eth message id {0:#x}")]
    UnknownMessage(u64),
}

impl From<EthStreamError> for ProtocolError {
    fn from(err: EthStreamError) -> Self {
        match err {
            EthStreamError::Stream(stream) => Self::Stream(stream),
            EthStreamError::StatusMismatch(_) |
            EthStreamError::ForkId(_) |
            EthStreamError::NonStatusMessage(_) => Self::Handshake(err.to_string()),
            other => Self::Other(other.to_string()),
        }
    }
}

/// Outcome classes for one outbound request.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// No response arrived within the request deadline.
    #[error("request timed out")]
    Timeout,
    /// The peer closed before answering.
    #[error("peer closed")]
    Closed,
    /// The request could not be written.
    #[error(transparent)]
    Stream(#[from] StreamError),
}
