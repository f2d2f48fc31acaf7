//! The per-peer `eth/66` handler: status handshake, request/response
//! correlation and message dispatch.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use alloy_primitives::Bytes;
use alloy_rlp::{Decodable, Encodable, Header};
use async_trait::async_trait;
use devp2p::{
    MsgWriter, Peer, ProtocolError, ProtocolHandler, ProtocolSpec, ProtocolStream, RawMsg,
};
use tracing::{debug, trace};

use crate::{
    backend::Backend,
    error::{EthStreamError, RequestError, StatusMismatch},
    message::{EthMessageId, RequestPair},
    status::Status,
    types::{take_raw_item, GetBlockHeaders, HashList, HashOrNumber, HeadersDirection, NewBlockHashes, RawBody},
    version::EthVersion,
};

/// Deadline for one outbound request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(6);
/// Deadline for the status exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type ResponseSlot = tokio::sync::oneshot::Sender<Result<Bytes, RequestError>>;
type Inflight = Arc<Mutex<HashMap<u64, ResponseSlot>>>;

/// The `eth/66` sub-protocol registration.
pub struct EthProtocol {
    backend: Arc<dyn Backend>,
}

impl EthProtocol {
    /// Wraps a backend into a protocol handler.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// The registration spec: `eth/66` with its 17-code window.
    pub fn spec() -> ProtocolSpec {
        ProtocolSpec::new("eth", EthVersion::Eth66 as u32, EthVersion::Eth66.total_messages())
    }
}

impl std::fmt::Debug for EthProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthProtocol").finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: ProtocolStream> ProtocolHandler<S> for EthProtocol {
    async fn open(&self, mut stream: S, peer: Arc<Peer>) -> Result<(), ProtocolError> {
        let local = self.backend.status();
        let fork_filter = self.backend.fork_filter();
        let writer = stream.writer();

        // both sides send immediately and read concurrently
        let mut status_rlp = Vec::new();
        local.encode(&mut status_rlp);
        let (sent, received) = tokio::join!(
            writer.write_msg(EthMessageId::Status as u64, &status_rlp),
            stream.read_msg_timeout(HANDSHAKE_TIMEOUT),
        );
        let result: Result<Status, EthStreamError> = (|| {
            sent?;
            let msg = received?;
            if msg.code != EthMessageId::Status as u64 {
                return Err(EthStreamError::NonStatusMessage(msg.code))
            }
            let remote = Status::decode(&mut &msg.data[..])?;
            validate_status(&local, &remote, &fork_filter)?;
            Ok(remote)
        })();

        let remote = match result {
            Ok(remote) => remote,
            Err(err) => {
                debug!(target: "eth", peer = peer.pretty_id(), %err, "status handshake failed");
                peer.close();
                return Err(err.into())
            }
        };
        debug!(target: "eth", peer = peer.pretty_id(), %remote, "peer on the same chain");

        let eth_peer =
            EthPeer { writer: writer.clone(), inflight: Default::default(), peer: peer.clone() };
        self.backend.notify_peer(eth_peer.clone()).await;

        tokio::spawn(run_loop(stream, self.backend.clone(), eth_peer));
        Ok(())
    }
}

fn validate_status(
    local: &Status,
    remote: &Status,
    fork_filter: &devp2p_forkid::ForkFilter,
) -> Result<(), EthStreamError> {
    if local.version != remote.version {
        return Err(EthStreamError::StatusMismatch(StatusMismatch::Version))
    }
    if local.network_id != remote.network_id {
        return Err(EthStreamError::StatusMismatch(StatusMismatch::NetworkId))
    }
    if local.genesis != remote.genesis {
        return Err(EthStreamError::StatusMismatch(StatusMismatch::Genesis))
    }
    fork_filter.validate(remote.forkid)?;
    Ok(())
}

/// Handle to a peer that passed the `eth` handshake. Cheap to clone; all
/// clones share the inflight-request table.
#[derive(Clone)]
pub struct EthPeer {
    writer: Arc<dyn MsgWriter>,
    inflight: Inflight,
    peer: Arc<Peer>,
}

impl std::fmt::Debug for EthPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EthPeer").field("peer", &self.peer.pretty_id()).finish_non_exhaustive()
    }
}

impl EthPeer {
    /// The server-level peer behind this handle.
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    /// Requests up to `limit` headers starting at the given block.
    pub async fn get_block_headers(
        &self,
        request: GetBlockHeaders,
    ) -> Result<Bytes, RequestError> {
        self.request(EthMessageId::GetBlockHeaders, &request).await
    }

    /// Requests the header of a single block by number.
    pub async fn get_block_by_number(&self, number: u64) -> Result<Bytes, RequestError> {
        self.get_block_headers(GetBlockHeaders {
            start_block: HashOrNumber::Number(number),
            limit: 1,
            skip: 0,
            direction: HeadersDirection::Rising,
        })
        .await
    }

    /// Requests block bodies by hash.
    pub async fn get_block_bodies(
        &self,
        hashes: Vec<alloy_primitives::B256>,
    ) -> Result<Bytes, RequestError> {
        self.request(EthMessageId::GetBlockBodies, &HashList(hashes)).await
    }

    /// Requests pooled transactions by hash.
    pub async fn get_pooled_transactions(
        &self,
        hashes: Vec<alloy_primitives::B256>,
    ) -> Result<Bytes, RequestError> {
        self.request(EthMessageId::GetPooledTransactions, &HashList(hashes)).await
    }

    /// Sends a request and waits for the correlated response body.
    pub async fn request<T: Encodable + Send + Sync>(
        &self,
        code: EthMessageId,
        body: &T,
    ) -> Result<Bytes, RequestError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let request_id = self.register(tx);

        let mut buf = Vec::new();
        RequestPair { request_id, message: body }.encode(&mut buf);
        if let Err(err) = self.writer.write_msg(code as u64, &buf).await {
            self.inflight.lock().expect("inflight lock poisoned").remove(&request_id);
            return Err(err.into())
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => {
                self.inflight.lock().expect("inflight lock poisoned").remove(&request_id);
                Err(RequestError::Timeout)
            }
        }
    }

    /// Picks a request id that is unique among the outstanding requests and
    /// registers the response slot under it.
    fn register(&self, slot: ResponseSlot) -> u64 {
        let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
        loop {
            let id = rand::random::<u64>();
            if let Entry::Vacant(entry) = inflight.entry(id) {
                entry.insert(slot);
                return id
            }
        }
    }
}

async fn run_loop<S: ProtocolStream>(mut stream: S, backend: Arc<dyn Backend>, peer: EthPeer) {
    loop {
        let msg = match stream.read_msg().await {
            Ok(msg) => msg,
            Err(err) => {
                trace!(target: "eth", peer = peer.peer.pretty_id(), %err, "stream finished");
                break
            }
        };
        if let Err(err) = handle_msg(&backend, &peer, msg).await {
            debug!(target: "eth", peer = peer.peer.pretty_id(), %err, "dropping peer");
            break
        }
    }

    // every pending waiter learns the peer is gone
    let waiters: Vec<ResponseSlot> = {
        let mut inflight = peer.inflight.lock().expect("inflight lock poisoned");
        inflight.drain().map(|(_, slot)| slot).collect()
    };
    for slot in waiters {
        let _ = slot.send(Err(RequestError::Closed));
    }
    peer.peer.close();
}

async fn handle_msg(
    backend: &Arc<dyn Backend>,
    peer: &EthPeer,
    msg: RawMsg,
) -> Result<(), EthStreamError> {
    let id = EthMessageId::try_from(msg.code).map_err(|err| EthStreamError::UnknownMessage(err.0))?;
    match id {
        EthMessageId::Status => Err(EthStreamError::StatusAfterHandshake),

        EthMessageId::Transactions => {
            backend.notify_transactions(msg.data).await;
            Ok(())
        }
        EthMessageId::NewBlock => {
            backend.notify_block(msg.data).await;
            Ok(())
        }
        EthMessageId::NewBlockHashes => {
            let hashes = NewBlockHashes::decode(&mut &msg.data[..])?;
            backend.notify_block_hashes(hashes.0).await;
            Ok(())
        }
        EthMessageId::NewPooledTransactionHashes => {
            let HashList(hashes) = HashList::decode(&mut &msg.data[..])?;
            backend.notify_transaction_hashes(hashes).await;
            Ok(())
        }

        EthMessageId::GetBlockHeaders => {
            let request = RequestPair::<GetBlockHeaders>::decode(&mut &msg.data[..])?;
            let body = backend.get_block_headers(request.message).await;
            respond(peer, EthMessageId::BlockHeaders, request.request_id, body).await
        }
        EthMessageId::GetBlockBodies => {
            let request = RequestPair::<HashList>::decode(&mut &msg.data[..])?;
            let body = backend.get_block_bodies(request.message.0).await;
            respond(peer, EthMessageId::BlockBodies, request.request_id, body).await
        }
        EthMessageId::GetPooledTransactions => {
            let request = RequestPair::<HashList>::decode(&mut &msg.data[..])?;
            let body = backend.get_transactions(request.message.0).await;
            respond(peer, EthMessageId::PooledTransactions, request.request_id, body).await
        }
        EthMessageId::GetNodeData => {
            let request = RequestPair::<HashList>::decode(&mut &msg.data[..])?;
            respond(peer, EthMessageId::NodeData, request.request_id, RawBody::empty_list()).await
        }
        EthMessageId::GetReceipts => {
            let request = RequestPair::<HashList>::decode(&mut &msg.data[..])?;
            respond(peer, EthMessageId::Receipts, request.request_id, RawBody::empty_list()).await
        }

        EthMessageId::BlockHeaders |
        EthMessageId::BlockBodies |
        EthMessageId::PooledTransactions |
        EthMessageId::NodeData |
        EthMessageId::Receipts => deliver_response(peer, &msg.data),
    }
}

async fn respond(
    peer: &EthPeer,
    code: EthMessageId,
    request_id: u64,
    body: RawBody,
) -> Result<(), EthStreamError> {
    let mut buf = Vec::new();
    RequestPair { request_id, message: body }.encode(&mut buf);
    peer.writer.write_msg(code as u64, &buf).await.map_err(Into::into)
}

/// Completes the waiter registered under the response's request id.
/// Unknown ids (late responses, duplicates) are discarded.
fn deliver_response(peer: &EthPeer, data: &[u8]) -> Result<(), EthStreamError> {
    let mut buf = data;
    let header = Header::decode(&mut buf)?;
    if !header.list {
        return Err(alloy_rlp::Error::UnexpectedString.into())
    }
    let mut payload = &buf[..header.payload_length.min(buf.len())];
    let request_id = u64::decode(&mut payload)?;
    let body = take_raw_item(&mut payload)?;

    let slot = peer.inflight.lock().expect("inflight lock poisoned").remove(&request_id);
    match slot {
        Some(slot) => {
            let _ = slot.send(Ok(body));
        }
        None => {
            trace!(target: "eth", peer = peer.peer.pretty_id(), request_id, "unsolicited response discarded");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawBody;
    use alloy_primitives::{b256, B256, U256};
    use devp2p::{Info, NodeRecord, PeerId, SessionHandle, StreamError};
    use devp2p_forkid::{ForkFilter, ForkHash, ForkId};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const GENESIS: B256 =
        b256!("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3");
    const MAINNET_FORKS: [u64; 12] = [
        1_150_000, 1_920_000, 2_463_000, 2_675_000, 4_370_000, 7_280_000, 9_069_000, 9_200_000,
        12_244_000, 12_965_000, 13_773_000, 15_050_000,
    ];

    struct TestSessionHandle {
        token: CancellationToken,
    }

    impl SessionHandle for TestSessionHandle {
        fn is_closed(&self) -> bool {
            self.token.is_cancelled()
        }

        fn closed(&self) -> CancellationToken {
            self.token.clone()
        }

        fn close(&self) {
            self.token.cancel();
        }
    }

    fn test_peer() -> Arc<Peer> {
        let record = NodeRecord {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 30303,
            udp_port: 30303,
            id: PeerId::repeat_byte(0x7f),
        };
        let info = Info {
            client: "test/0.1.0".into(),
            enode: record,
            capabilities: vec![EthProtocol::spec()],
            listen_port: 30303,
        };
        Arc::new(Peer::new(info, Arc::new(TestSessionHandle { token: CancellationToken::new() })))
    }

    #[derive(Clone)]
    struct TestWriter {
        outgoing: mpsc::UnboundedSender<RawMsg>,
    }

    #[async_trait]
    impl MsgWriter for TestWriter {
        async fn write_msg(&self, code: u64, payload: &[u8]) -> Result<(), StreamError> {
            self.outgoing
                .send(RawMsg { code, data: Bytes::copy_from_slice(payload) })
                .map_err(|_| StreamError::Closed)
        }
    }

    struct TestStream {
        spec: ProtocolSpec,
        incoming: mpsc::UnboundedReceiver<RawMsg>,
        writer: TestWriter,
    }

    #[async_trait]
    impl ProtocolStream for TestStream {
        fn protocol(&self) -> &ProtocolSpec {
            &self.spec
        }

        fn writer(&self) -> Arc<dyn MsgWriter> {
            Arc::new(self.writer.clone())
        }

        async fn read_msg(&mut self) -> Result<RawMsg, StreamError> {
            self.incoming.recv().await.ok_or(StreamError::Closed)
        }
    }

    /// An in-memory stream: inject with the sender, observe writes on the
    /// receiver.
    fn wire() -> (TestStream, mpsc::UnboundedSender<RawMsg>, mpsc::UnboundedReceiver<RawMsg>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let stream = TestStream {
            spec: EthProtocol::spec(),
            incoming: in_rx,
            writer: TestWriter { outgoing: out_tx },
        };
        (stream, in_tx, out_rx)
    }

    #[derive(Debug, PartialEq)]
    enum BackendEvent {
        Transactions(Bytes),
        TransactionHashes(Vec<B256>),
        BlockHashes(Vec<crate::types::BlockHashNumber>),
        Block(Bytes),
    }

    struct TestBackend {
        status: Status,
        filter: ForkFilter,
        headers: RawBody,
        peers: mpsc::UnboundedSender<EthPeer>,
        events: mpsc::UnboundedSender<BackendEvent>,
    }

    impl TestBackend {
        fn new(
            status: Status,
            filter: ForkFilter,
        ) -> (Self, mpsc::UnboundedReceiver<EthPeer>, mpsc::UnboundedReceiver<BackendEvent>) {
            let (peers_tx, peers_rx) = mpsc::unbounded_channel();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let mut headers = Vec::new();
            HashList(vec![B256::repeat_byte(0xdd)]).encode(&mut headers);
            let backend = Self {
                status,
                filter,
                headers: RawBody(headers.into()),
                peers: peers_tx,
                events: events_tx,
            };
            (backend, peers_rx, events_rx)
        }
    }

    #[async_trait]
    impl Backend for TestBackend {
        fn status(&self) -> Status {
            self.status
        }

        fn fork_filter(&self) -> ForkFilter {
            self.filter.clone()
        }

        async fn notify_peer(&self, peer: EthPeer) {
            let _ = self.peers.send(peer);
        }

        async fn get_block_headers(&self, _request: GetBlockHeaders) -> RawBody {
            self.headers.clone()
        }

        async fn get_block_bodies(&self, _hashes: Vec<B256>) -> RawBody {
            RawBody::empty_list()
        }

        async fn get_transactions(&self, _hashes: Vec<B256>) -> RawBody {
            RawBody::empty_list()
        }

        async fn notify_transactions(&self, raw: Bytes) {
            let _ = self.events.send(BackendEvent::Transactions(raw));
        }

        async fn notify_transaction_hashes(&self, hashes: Vec<B256>) {
            let _ = self.events.send(BackendEvent::TransactionHashes(hashes));
        }

        async fn notify_block_hashes(&self, hashes: Vec<crate::types::BlockHashNumber>) {
            let _ = self.events.send(BackendEvent::BlockHashes(hashes));
        }

        async fn notify_block(&self, raw: Bytes) {
            let _ = self.events.send(BackendEvent::Block(raw));
        }
    }

    fn fork_filter() -> ForkFilter {
        ForkFilter::new(7_987_396, GENESIS, MAINNET_FORKS)
    }

    fn local_status(filter: &ForkFilter) -> Status {
        Status::builder()
            .network_id(1)
            .total_difficulty(U256::from(17u64))
            .blockhash(B256::repeat_byte(1))
            .genesis(GENESIS)
            .forkid(filter.current())
            .build()
    }

    fn status_msg(status: &Status) -> RawMsg {
        let mut rlp = Vec::new();
        status.encode(&mut rlp);
        RawMsg { code: EthMessageId::Status as u64, data: rlp.into() }
    }

    /// Runs the handshake against a well-behaved remote and returns the
    /// wiring.
    async fn open_handshaken() -> (
        EthPeer,
        mpsc::UnboundedSender<RawMsg>,
        mpsc::UnboundedReceiver<RawMsg>,
        mpsc::UnboundedReceiver<BackendEvent>,
        Arc<Peer>,
    ) {
        let filter = fork_filter();
        let status = local_status(&filter);
        let (backend, mut peers_rx, events_rx) = TestBackend::new(status, filter);
        let protocol = EthProtocol::new(Arc::new(backend));
        let peer = test_peer();

        let (stream, in_tx, mut out_rx) = wire();
        in_tx.send(status_msg(&status)).unwrap();
        ProtocolHandler::open(&protocol, stream, peer.clone()).await.unwrap();

        let sent = out_rx.recv().await.unwrap();
        assert_eq!(sent.code, EthMessageId::Status as u64);
        let eth_peer = peers_rx.recv().await.unwrap();
        (eth_peer, in_tx, out_rx, events_rx, peer)
    }

    fn response_msg(code: EthMessageId, request_id: u64, body: &RawBody) -> RawMsg {
        let mut rlp = Vec::new();
        RequestPair { request_id, message: body }.encode(&mut rlp);
        RawMsg { code: code as u64, data: rlp.into() }
    }

    #[tokio::test]
    async fn request_response_correlation() {
        let (eth_peer, in_tx, mut out_rx, _events, _peer) = open_handshaken().await;

        let task = tokio::spawn({
            let peer = eth_peer.clone();
            async move { peer.get_block_by_number(0).await }
        });

        let request = out_rx.recv().await.unwrap();
        assert_eq!(request.code, EthMessageId::GetBlockHeaders as u64);
        let pair = RequestPair::<GetBlockHeaders>::decode(&mut &request.data[..]).unwrap();

        let mut wrong_body = Vec::new();
        HashList(vec![B256::repeat_byte(0xbb)]).encode(&mut wrong_body);
        let mut right_body = Vec::new();
        HashList(vec![B256::repeat_byte(0xaa)]).encode(&mut right_body);

        // a response under a foreign id must not wake the waiter
        in_tx
            .send(response_msg(
                EthMessageId::BlockHeaders,
                pair.request_id ^ 0xffff_ffff,
                &RawBody(wrong_body.clone().into()),
            ))
            .unwrap();
        in_tx
            .send(response_msg(
                EthMessageId::BlockHeaders,
                pair.request_id,
                &RawBody(right_body.clone().into()),
            ))
            .unwrap();

        let body = task.await.unwrap().unwrap();
        assert_eq!(&body[..], &right_body[..]);
        assert!(eth_peer.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_deregisters() {
        let (eth_peer, _in_tx, mut out_rx, _events, _peer) = open_handshaken().await;

        let task = tokio::spawn({
            let peer = eth_peer.clone();
            async move { peer.get_block_by_number(7).await }
        });
        let _request = out_rx.recv().await.unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RequestError::Timeout));
        assert!(eth_peer.inflight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn peer_close_drains_inflight_waiters() {
        let (eth_peer, in_tx, mut out_rx, _events, peer) = open_handshaken().await;

        let task = tokio::spawn({
            let peer = eth_peer.clone();
            async move { peer.get_block_by_number(7).await }
        });
        let _request = out_rx.recv().await.unwrap();

        // the session goes away before any response arrives
        drop(in_tx);

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RequestError::Closed));
        assert!(eth_peer.inflight.lock().unwrap().is_empty());
        // invariant: the peer is closed once its handler exits
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn serves_header_requests() {
        let (_eth_peer, in_tx, mut out_rx, _events, _peer) = open_handshaken().await;

        let request = GetBlockHeaders {
            start_block: HashOrNumber::Number(100),
            limit: 10,
            skip: 0,
            direction: HeadersDirection::Rising,
        };
        let mut rlp = Vec::new();
        RequestPair { request_id: 0x1234, message: request }.encode(&mut rlp);
        in_tx
            .send(RawMsg { code: EthMessageId::GetBlockHeaders as u64, data: rlp.into() })
            .unwrap();

        let response = out_rx.recv().await.unwrap();
        assert_eq!(response.code, EthMessageId::BlockHeaders as u64);
        let pair = RequestPair::<RawBody>::decode(&mut &response.data[..]).unwrap();
        assert_eq!(pair.request_id, 0x1234);
        let HashList(hashes) = HashList::decode(&mut &pair.message.0[..]).unwrap();
        assert_eq!(hashes, vec![B256::repeat_byte(0xdd)]);
    }

    #[tokio::test]
    async fn broadcasts_are_forwarded_to_the_backend() {
        let (_eth_peer, in_tx, _out_rx, mut events, _peer) = open_handshaken().await;

        let raw_txs = Bytes::from_static(&[0xc1, 0x80]);
        in_tx
            .send(RawMsg { code: EthMessageId::Transactions as u64, data: raw_txs.clone() })
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), BackendEvent::Transactions(raw_txs));

        let mut hashes_rlp = Vec::new();
        HashList(vec![B256::repeat_byte(5)]).encode(&mut hashes_rlp);
        in_tx
            .send(RawMsg {
                code: EthMessageId::NewPooledTransactionHashes as u64,
                data: hashes_rlp.into(),
            })
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            BackendEvent::TransactionHashes(vec![B256::repeat_byte(5)])
        );

        let mut blocks_rlp = Vec::new();
        NewBlockHashes(vec![crate::types::BlockHashNumber {
            hash: B256::repeat_byte(6),
            number: 42,
        }])
        .encode(&mut blocks_rlp);
        in_tx
            .send(RawMsg { code: EthMessageId::NewBlockHashes as u64, data: blocks_rlp.into() })
            .unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            BackendEvent::BlockHashes(vec![crate::types::BlockHashNumber {
                hash: B256::repeat_byte(6),
                number: 42,
            }])
        );
    }

    #[tokio::test]
    async fn rejects_wrong_genesis() {
        let filter = fork_filter();
        let status = local_status(&filter);
        let (backend, _peers_rx, _events_rx) = TestBackend::new(status, filter);
        let protocol = EthProtocol::new(Arc::new(backend));
        let peer = test_peer();

        let (stream, in_tx, _out_rx) = wire();
        let mut remote = status;
        remote.genesis = B256::repeat_byte(0xee);
        in_tx.send(status_msg(&remote)).unwrap();

        let err = ProtocolHandler::open(&protocol, stream, peer.clone()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Handshake(_)), "unexpected error: {err}");
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn rejects_incompatible_fork_id() {
        let filter = fork_filter();
        let status = local_status(&filter);
        let (backend, _peers_rx, _events_rx) = TestBackend::new(status, filter);
        let protocol = EthProtocol::new(Arc::new(backend));
        let peer = test_peer();

        let (stream, in_tx, _out_rx) = wire();
        let mut remote = status;
        remote.forkid = ForkId { hash: ForkHash([0x5c, 0xdd, 0xc0, 0xe1]), next: 0 };
        in_tx.send(status_msg(&remote)).unwrap();

        let err = ProtocolHandler::open(&protocol, stream, peer.clone()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Handshake(_)), "unexpected error: {err}");
        assert!(peer.is_closed());
    }
}
