use std::io;

/// Errors produced by the ECIES handshake and frame codec.
#[derive(Debug, thiserror::Error)]
pub enum EciesError {
    /// Underlying transport failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Curve-level failure (bad point, bad signature, ...).
    #[error(transparent)]
    Secp256k1(#[from] secp256k1::Error),
    /// The HMAC tag of an ECIES envelope did not verify.
    #[error("envelope tag check failed")]
    TagCheckFailed,
    /// A handshake message was shorter than its fixed layout.
    #[error("handshake message too short")]
    HandshakeTruncated,
    /// A frame header or body was shorter than announced.
    #[error("frame truncated")]
    FrameTruncated,
    /// A body was read without first reading its header.
    #[error("frame header not read")]
    HeaderNotRead,
    /// The running MAC of a frame header did not verify.
    #[error("frame header mac mismatch")]
    HeaderMacMismatch,
    /// The running MAC of a frame body did not verify.
    #[error("frame body mac mismatch")]
    BodyMacMismatch,
    /// The frame body exceeds the 3-byte length field.
    #[error("frame body too large: {0} bytes")]
    BodyTooLarge(usize),
    /// The peer sent something other than the expected handshake message.
    #[error("invalid handshake: expected {expected}")]
    InvalidHandshake {
        /// Human-readable name of the expected message.
        expected: &'static str,
    },
    /// Frame state used before the handshake finished.
    #[error("handshake not completed")]
    HandshakeNotCompleted,
}

impl From<EciesError> for io::Error {
    fn from(err: EciesError) -> Self {
        match err {
            EciesError::Io(io) => io,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
