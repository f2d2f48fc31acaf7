//! Established RLPx sessions: hello exchange, base-protocol housekeeping
//! and the frame-to-stream demultiplexer.

use std::{net::IpAddr, time::Duration};

use alloy_rlp::{Decodable, Encodable, EMPTY_LIST_CODE};
use bytes::BytesMut;
use devp2p::{Info, NodeRecord, ProtocolSpec, RawMsg, SessionHandle};
use devp2p_ecies::{EciesStream, Frame};
use devp2p_enode::{id_from_secret, PeerId};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use secp256k1::SecretKey;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    capability::SharedCapabilities,
    codes,
    disconnect::{decode_disconnect_payload, DisconnectReason},
    error::RlpxError,
    hello::Hello,
    stream::{decode_code, encode_code, CloseState, FrameSink, FrameWriter, RlpxStream, StreamWriter},
    BASE_PROTOCOL_LENGTH, BASE_PROTOCOL_VERSION, MAX_PAYLOAD_SIZE, SNAPPY_PROTOCOL_VERSION,
};

/// Overall deadline for the ECIES plus hello handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Keepalive ping interval.
const PING_INTERVAL: Duration = Duration::from_secs(60);
/// How long to wait for a pong before giving up on the peer.
const PING_TIMEOUT: Duration = Duration::from_secs(15);
/// Grace period for flushing a disconnect message.
const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Everything needed to establish sessions for the local node.
#[derive(Clone, Debug)]
pub struct SessionContext {
    /// The node's static secret key.
    pub secret_key: SecretKey,
    /// Client name advertised in the hello.
    pub client: String,
    /// Listen port advertised in the hello.
    pub listen_port: u16,
    /// Registered sub-protocols.
    pub protocols: Vec<ProtocolSpec>,
}

impl SessionContext {
    fn local_hello(&self) -> Hello {
        Hello {
            protocol_version: BASE_PROTOCOL_VERSION,
            client_id: self.client.clone(),
            capabilities: self
                .protocols
                .iter()
                .map(|p| crate::Capability::new(p.name.clone(), p.version))
                .collect(),
            port: self.listen_port,
            id: id_from_secret(&self.secret_key),
        }
    }

    /// Dials through the full handshake as the initiator.
    pub async fn connect<Io>(
        &self,
        io: Io,
        remote_id: PeerId,
        remote_ip: IpAddr,
    ) -> Result<Session<Io>, RlpxError>
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let ecies = EciesStream::connect(io, self.secret_key, remote_id).await?;
            self.establish(ecies, remote_ip).await
        })
        .await
        .map_err(|_| RlpxError::HandshakeTimeout)?
    }

    /// Accepts the full handshake as the responder.
    pub async fn accept<Io>(&self, io: Io, remote_ip: IpAddr) -> Result<Session<Io>, RlpxError>
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            let ecies = EciesStream::incoming(io, self.secret_key).await?;
            self.establish(ecies, remote_ip).await
        })
        .await
        .map_err(|_| RlpxError::HandshakeTimeout)?
    }

    async fn establish<Io>(
        &self,
        mut ecies: EciesStream<Io>,
        remote_ip: IpAddr,
    ) -> Result<Session<Io>, RlpxError>
    where
        Io: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let local_hello = self.local_hello();
        let their_hello = exchange_hello(&mut ecies, &local_hello).await?;
        trace!(
            target: "rlpx::session",
            client = %their_hello.client_id,
            caps = their_hello.capabilities.len(),
            "hello received",
        );

        if their_hello.id == local_hello.id {
            send_disconnect_raw(&mut ecies, DisconnectReason::ConnectedToSelf).await;
            return Err(RlpxError::ConnectedToSelf)
        }
        if their_hello.id != ecies.remote_id() {
            send_disconnect_raw(&mut ecies, DisconnectReason::UnexpectedHandshakeIdentity).await;
            return Err(RlpxError::UnexpectedHandshakeIdentity)
        }

        let shared = match SharedCapabilities::try_new(&self.protocols, &their_hello.capabilities)
        {
            Ok(shared) => shared,
            Err(err) => {
                send_disconnect_raw(&mut ecies, DisconnectReason::UselessPeer).await;
                return Err(err)
            }
        };

        let snappy = local_hello.protocol_version >= SNAPPY_PROTOCOL_VERSION &&
            their_hello.protocol_version >= SNAPPY_PROTOCOL_VERSION;

        let info = Info {
            client: their_hello.client_id,
            enode: NodeRecord {
                address: remote_ip,
                tcp_port: their_hello.port,
                udp_port: their_hello.port,
                id: their_hello.id,
            },
            capabilities: shared.iter().map(|cap| cap.spec()).collect(),
            listen_port: their_hello.port,
        };

        let (sink, ingress): (SplitSink<EciesStream<Io>, Frame>, SplitStream<EciesStream<Io>>) =
            ecies.split();
        let close = CloseState::new();
        let writer = FrameWriter::new(
            FrameSink { sink, encoder: snap::raw::Encoder::new(), snappy },
            close.clone(),
        );

        let (pong_tx, pong_rx) = watch::channel(0u64);
        let mut streams = Vec::with_capacity(shared.len());
        let mut routes = Vec::with_capacity(shared.len());
        for cap in shared.iter() {
            let (tx, rx) = mpsc::unbounded_channel();
            routes.push(StreamRoute { offset: cap.offset, length: cap.length, tx });
            streams.push(RlpxStream {
                spec: cap.spec(),
                ingress: rx,
                writer: StreamWriter {
                    frames: writer.clone(),
                    offset: cap.offset,
                    length: cap.length,
                },
                close: close.clone(),
            });
        }

        tokio::spawn(read_loop(ingress, routes, writer.clone(), close.clone(), snappy, pong_tx));
        tokio::spawn(keepalive(writer.clone(), pong_rx.clone(), close.clone()));

        Ok(Session { info, shared, streams, writer, close, pong_rx })
    }
}

async fn exchange_hello<Io>(
    ecies: &mut EciesStream<Io>,
    local: &Hello,
) -> Result<Hello, RlpxError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode_code(&mut buf, codes::HELLO);
    local.encode(&mut buf);
    ecies.send(Frame::base(buf.freeze().into())).await?;

    let mut msg = match ecies.next().await {
        Some(res) => res?,
        None => return Err(RlpxError::HandshakeEof),
    };
    let code = decode_code(&mut msg)?;
    match code {
        codes::HELLO => Ok(Hello::decode(&mut &msg[..])?),
        codes::DISCONNECT => {
            let reason =
                decode_disconnect_payload(&msg).unwrap_or(DisconnectReason::DisconnectRequested);
            Err(RlpxError::Disconnected(reason))
        }
        other => Err(RlpxError::NonHelloMessage(other)),
    }
}

/// Best-effort disconnect before the session split into halves. Frames are
/// still uncompressed at this point.
async fn send_disconnect_raw<Io>(ecies: &mut EciesStream<Io>, reason: DisconnectReason)
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    encode_code(&mut buf, codes::DISCONNECT);
    reason.encode(&mut buf);
    let _ = ecies.send(Frame::base(buf.freeze().into())).await;
}

struct StreamRoute {
    offset: u64,
    length: u64,
    tx: mpsc::UnboundedSender<RawMsg>,
}

enum Flow {
    Continue,
    Close(String),
}

async fn read_loop<Io>(
    mut ingress: SplitStream<EciesStream<Io>>,
    routes: Vec<StreamRoute>,
    writer: FrameWriter<Io>,
    close: CloseState,
    snappy: bool,
    pong_tx: watch::Sender<u64>,
) where
    Io: AsyncRead + AsyncWrite + Unpin + Send,
{
    let token = close.token();
    let mut decoder = snap::raw::Decoder::new();
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = ingress.next() => frame,
        };
        let bytes = match frame {
            Some(Ok(bytes)) => bytes,
            Some(Err(err)) => {
                close.close_with(format!("transport error: {err}"));
                break
            }
            None => {
                close.close_with("peer closed the connection");
                break
            }
        };

        match handle_frame(bytes, &routes, &writer, &mut decoder, snappy, &pong_tx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close(reason)) => {
                debug!(target: "rlpx::session", %reason, "session closing");
                close.close_with(reason);
                break
            }
            Err(err) => {
                debug!(target: "rlpx::session", %err, "protocol violation, tearing session down");
                let mut payload = Vec::new();
                DisconnectReason::ProtocolBreach.encode(&mut payload);
                let _ = writer.write_frame(codes::DISCONNECT, &payload, 0).await;
                close.close_with(err.to_string());
                break
            }
        }
    }
    close.close_with("session closed");
}

async fn handle_frame<Io>(
    mut bytes: BytesMut,
    routes: &[StreamRoute],
    writer: &FrameWriter<Io>,
    decoder: &mut snap::raw::Decoder,
    snappy: bool,
    pong_tx: &watch::Sender<u64>,
) -> Result<Flow, RlpxError>
where
    Io: AsyncWrite + Unpin + Send,
{
    let code = decode_code(&mut bytes)?;

    if code < BASE_PROTOCOL_LENGTH {
        return match code {
            codes::HELLO => Err(RlpxError::HelloAfterHandshake),
            codes::DISCONNECT => {
                let reason = decode_disconnect_lenient(&bytes, decoder, snappy);
                Ok(Flow::Close(format!("disconnected by peer: {reason}")))
            }
            codes::PING => {
                trace!(target: "rlpx::session", "ping");
                writer.write_frame(codes::PONG, &[EMPTY_LIST_CODE], 0).await?;
                Ok(Flow::Continue)
            }
            codes::PONG => {
                pong_tx.send_modify(|count| *count += 1);
                Ok(Flow::Continue)
            }
            other => Err(RlpxError::UnknownReservedMessage(other)),
        }
    }

    let Some(route) = routes.iter().find(|r| code >= r.offset && code < r.offset + r.length)
    else {
        return Err(RlpxError::MessageCodeOutOfRange(code))
    };

    let data = if snappy {
        decompress(decoder, &bytes)?
    } else {
        alloy_primitives::Bytes::from(bytes.freeze())
    };
    if data.len() > MAX_PAYLOAD_SIZE {
        return Err(RlpxError::MessageTooBig(data.len()))
    }

    // the app may have dropped its stream half; discarding is fine then
    let _ = route.tx.send(RawMsg { code: code - route.offset, data });
    Ok(Flow::Continue)
}

fn decompress(
    decoder: &mut snap::raw::Decoder,
    input: &[u8],
) -> Result<alloy_primitives::Bytes, RlpxError> {
    let len = snap::raw::decompress_len(input)?;
    if len > MAX_PAYLOAD_SIZE {
        return Err(RlpxError::MessageTooBig(len))
    }
    Ok(decoder.decompress_vec(input)?.into())
}

/// Disconnect payloads arrive compressed from compliant peers but raw from
/// several older clients; try both.
fn decode_disconnect_lenient(
    payload: &[u8],
    decoder: &mut snap::raw::Decoder,
    snappy: bool,
) -> DisconnectReason {
    if snappy {
        if let Ok(raw) = decoder.decompress_vec(payload) {
            if let Some(reason) = decode_disconnect_payload(&raw) {
                return reason
            }
        }
    }
    decode_disconnect_payload(payload).unwrap_or(DisconnectReason::DisconnectRequested)
}

async fn keepalive<Io>(
    writer: FrameWriter<Io>,
    mut pong_rx: watch::Receiver<u64>,
    close: CloseState,
) where
    Io: AsyncWrite + Unpin + Send,
{
    let token = close.token();
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(PING_INTERVAL) => {}
        }
        let seen = *pong_rx.borrow_and_update();
        if writer.write_frame(codes::PING, &[EMPTY_LIST_CODE], 0).await.is_err() {
            return
        }
        let answered = tokio::time::timeout(PING_TIMEOUT, wait_pong(&mut pong_rx, seen)).await;
        if !matches!(answered, Ok(true)) {
            let mut payload = Vec::new();
            DisconnectReason::PingTimeout.encode(&mut payload);
            let _ = writer.write_frame(codes::DISCONNECT, &payload, 0).await;
            close.close_with("ping timeout");
            return
        }
    }
}

async fn wait_pong(rx: &mut watch::Receiver<u64>, seen: u64) -> bool {
    loop {
        if *rx.borrow_and_update() != seen {
            return true
        }
        if rx.changed().await.is_err() {
            return false
        }
    }
}

/// An established session: negotiated capabilities, one logical stream per
/// capability and the shared frame writer.
pub struct Session<Io> {
    info: Info,
    shared: SharedCapabilities,
    streams: Vec<RlpxStream<Io>>,
    writer: FrameWriter<Io>,
    close: CloseState,
    pong_rx: watch::Receiver<u64>,
}

impl<Io> Session<Io>
where
    Io: AsyncWrite + Unpin + Send + Sync + 'static,
{
    /// The authenticated remote node id.
    pub fn remote_id(&self) -> PeerId {
        self.info.enode.id
    }

    /// The capability set negotiated with this peer.
    pub fn shared_capabilities(&self) -> &SharedCapabilities {
        &self.shared
    }

    /// The close reason, once the session is closed.
    pub fn close_reason(&self) -> Option<String> {
        self.close.reason().map(str::to_string)
    }

    /// Sends a ping and waits for the matching pong.
    pub async fn ping(&self) -> Result<(), RlpxError> {
        let mut rx = self.pong_rx.clone();
        let seen = *rx.borrow_and_update();
        self.writer.write_frame(codes::PING, &[EMPTY_LIST_CODE], 0).await?;
        match tokio::time::timeout(PING_TIMEOUT, wait_pong(&mut rx, seen)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RlpxError::SessionClosed),
            Err(_) => Err(RlpxError::PingTimeout),
        }
    }

    /// Sends a disconnect with the given reason and closes the session.
    pub async fn disconnect(&self, reason: DisconnectReason) {
        let mut payload = Vec::new();
        reason.encode(&mut payload);
        let _ = tokio::time::timeout(
            GRACE_PERIOD,
            self.writer.write_frame(codes::DISCONNECT, &payload, 0),
        )
        .await;
        self.close.close_with(format!("closed locally: {reason}"));
    }

    fn close_with_reason(&self, reason: DisconnectReason) {
        if self.close.is_closed() {
            return
        }
        let writer = self.writer.clone();
        let close = self.close.clone();
        tokio::spawn(async move {
            let mut payload = Vec::new();
            reason.encode(&mut payload);
            let _ = tokio::time::timeout(
                GRACE_PERIOD,
                writer.write_frame(codes::DISCONNECT, &payload, 0),
            )
            .await;
            close.close_with(format!("closed locally: {reason}"));
        });
    }
}

impl<Io> SessionHandle for Session<Io>
where
    Io: AsyncWrite + Unpin + Send + Sync + 'static,
{
    fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    fn closed(&self) -> CancellationToken {
        self.close.token()
    }

    fn close(&self) {
        self.close_with_reason(DisconnectReason::DisconnectRequested);
    }

    fn close_busy(&self) {
        self.close_with_reason(DisconnectReason::TooManyPeers);
    }
}

impl<Io> devp2p::Session for Session<Io>
where
    Io: AsyncWrite + Unpin + Send + Sync + 'static,
{
    type Stream = RlpxStream<Io>;

    fn info(&self) -> &Info {
        &self.info
    }

    fn take_streams(&mut self) -> Vec<Self::Stream> {
        std::mem::take(&mut self.streams)
    }
}
