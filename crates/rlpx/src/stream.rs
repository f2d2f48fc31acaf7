//! Logical streams multiplexed over one session.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::BytesMut;
use devp2p::{MsgWriter, ProtocolSpec, ProtocolStream, RawMsg, StreamError};
use devp2p_ecies::{EciesStream, Frame};
use futures::{stream::SplitSink, SinkExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{error::RlpxError, MAX_PAYLOAD_SIZE};

/// Shared close latch of a session: a cancellation token plus the first
/// recorded close reason.
#[derive(Clone)]
pub(crate) struct CloseState {
    inner: Arc<CloseInner>,
}

struct CloseInner {
    token: CancellationToken,
    reason: OnceLock<String>,
}

impl CloseState {
    pub(crate) fn new() -> Self {
        Self { inner: Arc::new(CloseInner { token: CancellationToken::new(), reason: OnceLock::new() }) }
    }

    /// Records the reason (first writer wins) and trips the latch.
    pub(crate) fn close_with(&self, reason: impl Into<String>) {
        let _ = self.inner.reason.set(reason.into());
        self.inner.token.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub(crate) fn reason(&self) -> Option<&str> {
        self.inner.reason.get().map(String::as_str)
    }
}

/// The egress half of a session: the frame sink plus the snappy encoder,
/// behind one lock so writes from any stream serialize at the cipher.
pub(crate) struct FrameSink<Io> {
    pub(crate) sink: SplitSink<EciesStream<Io>, Frame>,
    pub(crate) encoder: snap::raw::Encoder,
    pub(crate) snappy: bool,
}

/// Cheap handle to the shared frame sink.
pub(crate) struct FrameWriter<Io> {
    inner: Arc<Mutex<FrameSink<Io>>>,
    close: CloseState,
}

impl<Io> Clone for FrameWriter<Io> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), close: self.close.clone() }
    }
}

impl<Io> FrameWriter<Io>
where
    Io: tokio::io::AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(sink: FrameSink<Io>, close: CloseState) -> Self {
        Self { inner: Arc::new(Mutex::new(sink)), close }
    }

    /// Serializes and sends one message with an absolute code.
    pub(crate) async fn write_frame(
        &self,
        code: u64,
        payload: &[u8],
        protocol_id: u64,
    ) -> Result<(), RlpxError> {
        if self.close.is_closed() {
            return Err(RlpxError::SessionClosed)
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(RlpxError::MessageTooBig(payload.len()))
        }

        let mut guard = self.inner.lock().await;
        let mut buf = BytesMut::with_capacity(payload.len() + 1);
        encode_code(&mut buf, code);
        if guard.snappy {
            let compressed = guard.encoder.compress_vec(payload)?;
            buf.extend_from_slice(&compressed);
        } else {
            buf.extend_from_slice(payload);
        }

        guard
            .sink
            .send(Frame { protocol_id, data: buf.freeze().into() })
            .await
            .map_err(RlpxError::Ecies)
    }
}

/// Writes a message code as its RLP form (code 0 is the empty-string byte).
pub(crate) fn encode_code(buf: &mut BytesMut, code: u64) {
    debug_assert!(code < 0x80);
    if code == 0 {
        buf.extend_from_slice(&[alloy_rlp::EMPTY_STRING_CODE]);
    } else {
        buf.extend_from_slice(&[code as u8]);
    }
}

/// Splits the RLP-encoded message code off a frame body.
///
/// Accepts the lenient `0x00` form for code 0 alongside the canonical
/// `0x80`.
pub(crate) fn decode_code(buf: &mut BytesMut) -> Result<u64, RlpxError> {
    let first = *buf.first().ok_or(RlpxError::EmptyMessage)?;
    let code = match first {
        alloy_rlp::EMPTY_STRING_CODE => 0,
        byte if byte < alloy_rlp::EMPTY_STRING_CODE => byte as u64,
        byte => return Err(RlpxError::InvalidMessageCode(byte)),
    };
    let _ = buf.split_to(1);
    Ok(code)
}

/// The write half of one logical stream. Clones share the session's frame
/// writer.
pub struct StreamWriter<Io> {
    pub(crate) frames: FrameWriter<Io>,
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

impl<Io> Clone for StreamWriter<Io> {
    fn clone(&self) -> Self {
        Self { frames: self.frames.clone(), offset: self.offset, length: self.length }
    }
}

impl<Io> StreamWriter<Io>
where
    Io: tokio::io::AsyncWrite + Unpin + Send,
{
    /// Writes a message with a sub-protocol-relative code.
    pub async fn write_msg(&self, code: u64, payload: &[u8]) -> Result<(), RlpxError> {
        if code >= self.length {
            return Err(RlpxError::MessageCodeOutOfRange(code))
        }
        self.frames.write_frame(code + self.offset, payload, self.offset).await
    }
}

#[async_trait]
impl<Io> MsgWriter for StreamWriter<Io>
where
    Io: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn write_msg(&self, code: u64, payload: &[u8]) -> Result<(), StreamError> {
        StreamWriter::write_msg(self, code, payload).await.map_err(Into::into)
    }
}

/// One ordered message channel belonging to a negotiated capability.
///
/// The session's reader task feeds the channel; reads drain buffered
/// messages even after the session closed, then report the close.
pub struct RlpxStream<Io> {
    pub(crate) spec: ProtocolSpec,
    pub(crate) ingress: mpsc::UnboundedReceiver<RawMsg>,
    pub(crate) writer: StreamWriter<Io>,
    pub(crate) close: CloseState,
}

impl<Io> RlpxStream<Io>
where
    Io: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    /// The capability this stream belongs to.
    pub fn protocol(&self) -> &ProtocolSpec {
        &self.spec
    }

    /// A cloneable writer for this stream.
    pub fn stream_writer(&self) -> StreamWriter<Io> {
        self.writer.clone()
    }

    /// Waits for the next message.
    pub async fn read_msg(&mut self) -> Result<RawMsg, RlpxError> {
        match self.ingress.recv().await {
            Some(msg) => Ok(msg),
            None => Err(self.closed_error()),
        }
    }

    fn closed_error(&self) -> RlpxError {
        if let Some(reason) = self.close.reason() {
            tracing::trace!(target: "rlpx::stream", cap = %self.spec.name, %reason, "stream closed");
        }
        RlpxError::SessionClosed
    }
}

#[async_trait]
impl<Io> ProtocolStream for RlpxStream<Io>
where
    Io: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn protocol(&self) -> &ProtocolSpec {
        &self.spec
    }

    fn writer(&self) -> Arc<dyn MsgWriter> {
        Arc::new(self.writer.clone())
    }

    async fn read_msg(&mut self) -> Result<RawMsg, StreamError> {
        RlpxStream::read_msg(self).await.map_err(Into::into)
    }
}
