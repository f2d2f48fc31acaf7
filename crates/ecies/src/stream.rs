//! Tokio codec and framed stream over [`Ecies`].

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::BytesMut;
use devp2p_enode::PeerId;
use futures::{ready, Sink, SinkExt};
use secp256k1::SecretKey;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::{Stream, StreamExt};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::trace;

use crate::{Ecies, EciesError, EgressValue, Frame, IngressValue};

/// Wire-level state of an ECIES connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CodecState {
    /// Waiting for the initiator's auth message.
    Auth,
    /// Waiting for the responder's ack message.
    Ack,
    /// Waiting for the next frame header.
    Header,
    /// Waiting for the body announced by the last header.
    Body,
}

/// Tokio codec driving the [`Ecies`] state machine.
#[derive(Debug)]
pub struct EciesCodec {
    ecies: Ecies,
    state: CodecState,
}

impl EciesCodec {
    /// Codec for the listening side.
    pub fn new_server(secret_key: SecretKey) -> Result<Self, EciesError> {
        Ok(Self { ecies: Ecies::new_server(secret_key)?, state: CodecState::Auth })
    }

    /// Codec for the dialing side.
    pub fn new_client(secret_key: SecretKey, remote_id: PeerId) -> Result<Self, EciesError> {
        Ok(Self { ecies: Ecies::new_client(secret_key, remote_id)?, state: CodecState::Auth })
    }
}

impl Decoder for EciesCodec {
    type Item = IngressValue;
    type Error = EciesError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                CodecState::Auth => {
                    if buf.len() < 2 {
                        return Ok(None)
                    }
                    let payload_size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                    let total_size = payload_size + 2;
                    if buf.len() < total_size {
                        trace!(have = buf.len(), need = total_size, "buffering auth");
                        return Ok(None)
                    }

                    let remote_id = self.ecies.read_auth(&mut buf.split_to(total_size))?;
                    self.state = CodecState::Header;
                    return Ok(Some(IngressValue::AuthReceived(remote_id)))
                }
                CodecState::Ack => {
                    if buf.len() < 2 {
                        return Ok(None)
                    }
                    let payload_size = u16::from_be_bytes([buf[0], buf[1]]) as usize;
                    let total_size = payload_size + 2;
                    if buf.len() < total_size {
                        trace!(have = buf.len(), need = total_size, "buffering ack");
                        return Ok(None)
                    }

                    self.ecies.read_ack(&mut buf.split_to(total_size))?;
                    self.state = CodecState::Header;
                    return Ok(Some(IngressValue::AckReceived))
                }
                CodecState::Header => {
                    if buf.len() < Ecies::header_len() {
                        return Ok(None)
                    }
                    self.ecies.read_header(&mut buf.split_to(Ecies::header_len()))?;
                    self.state = CodecState::Body;
                }
                CodecState::Body => {
                    let body_len = self.ecies.body_len().ok_or(EciesError::HeaderNotRead)?;
                    if buf.len() < body_len {
                        return Ok(None)
                    }
                    let mut data = buf.split_to(body_len);
                    let body = self.ecies.read_body(&mut data)?;
                    let body = BytesMut::from(&body[..]);
                    self.state = CodecState::Header;
                    return Ok(Some(IngressValue::Frame(body)))
                }
            }
        }
    }
}

impl Encoder<EgressValue> for EciesCodec {
    type Error = EciesError;

    fn encode(&mut self, item: EgressValue, buf: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            EgressValue::Auth => {
                self.state = CodecState::Ack;
                self.ecies.write_auth(buf)
            }
            EgressValue::Ack => {
                self.state = CodecState::Header;
                self.ecies.write_ack(buf)
            }
            EgressValue::Frame(frame) => {
                self.ecies.write_header(buf, frame.data.len(), frame.protocol_id)?;
                self.ecies.write_body(buf, &frame.data)
            }
        }
    }
}

/// A framed ECIES connection exchanging raw message bodies.
#[derive(Debug)]
pub struct EciesStream<Io> {
    inner: Framed<Io, EciesCodec>,
    remote_id: PeerId,
}

impl<Io> EciesStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Dials through the handshake: sends auth, waits for the ack.
    pub async fn connect(
        io: Io,
        secret_key: SecretKey,
        remote_id: PeerId,
    ) -> Result<Self, EciesError> {
        let codec = EciesCodec::new_client(secret_key, remote_id)?;
        let mut inner = codec.framed(io);

        trace!("sending ecies auth");
        inner.send(EgressValue::Auth).await?;

        trace!("waiting for ecies ack");
        match inner.next().await.transpose()? {
            Some(IngressValue::AckReceived) => Ok(Self { inner, remote_id }),
            _ => Err(EciesError::InvalidHandshake { expected: "ack" }),
        }
    }

    /// Accepts the handshake on an inbound connection: waits for auth,
    /// replies with the ack.
    pub async fn incoming(io: Io, secret_key: SecretKey) -> Result<Self, EciesError> {
        let codec = EciesCodec::new_server(secret_key)?;
        let mut inner = codec.framed(io);

        trace!("waiting for ecies auth");
        let remote_id = match inner.next().await.transpose()? {
            Some(IngressValue::AuthReceived(remote_id)) => remote_id,
            _ => return Err(EciesError::InvalidHandshake { expected: "auth" }),
        };

        trace!("sending ecies ack");
        inner.send(EgressValue::Ack).await?;
        Ok(Self { inner, remote_id })
    }

    /// The authenticated remote node id.
    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }
}

impl<Io> Stream for EciesStream<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<BytesMut, EciesError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(Pin::new(&mut self.get_mut().inner).poll_next(cx)) {
            Some(Ok(IngressValue::Frame(body))) => Poll::Ready(Some(Ok(body))),
            Some(Ok(other)) => Poll::Ready(Some(Err(EciesError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected frame, got {other:?}"),
            ))))),
            Some(Err(err)) => Poll::Ready(Some(Err(err))),
            None => Poll::Ready(None),
        }
    }
}

impl<Io> Sink<Frame> for EciesStream<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = EciesError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        Pin::new(&mut self.get_mut().inner).start_send(EgressValue::Frame(item))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}
