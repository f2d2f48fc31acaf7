//! The peer server: accept loop, dial pool, peer table and event fan-out.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use devp2p_enode::{NodeRecord, PeerId};
use secp256k1::SecretKey;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    config::{ServerConfig, DIAL_QUEUE_BUFFER, EVENT_BUFFER},
    discovery::Discovery,
    error::{ProtocolError, ServerError, TransportError},
    peer::{Peer, PeerStatus},
    peerstore::{NoopPeerStore, PeerStore},
    periodic::{Dispatcher, Job},
    transport::{Info, ProtocolSpec, ProtocolStream, Session, SessionHandle, Transport},
};

/// Kinds of peer-set membership changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// A peer completed all sub-protocol handshakes and joined the set.
    NodeJoin,
    /// A peer's session closed and it left the set.
    NodeLeave,
    /// A session authenticated but failed sub-protocol negotiation.
    NodeHandshakeFail,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NodeJoin => "node join",
            Self::NodeLeave => "node leave",
            Self::NodeHandshakeFail => "node handshake failed",
        };
        f.write_str(s)
    }
}

/// A peer-set membership change.
#[derive(Clone, Debug)]
pub struct MemberEvent {
    /// What happened.
    pub event_type: EventType,
    /// The peer it happened to.
    pub peer: Arc<Peer>,
}

/// Callback run for each negotiated stream of a registered sub-protocol.
///
/// `open` must complete the protocol's own handshake and spawn whatever
/// long-running work it needs, then return. The peer joins the set only
/// after every handler's `open` succeeded.
#[async_trait]
pub trait ProtocolHandler<S: ProtocolStream>: Send + Sync + 'static {
    /// Runs the sub-protocol handshake for one stream.
    async fn open(&self, stream: S, peer: Arc<Peer>) -> Result<(), ProtocolError>;
}

/// A registered sub-protocol: its spec plus its per-stream handler.
pub struct Protocol<S> {
    /// Name, version and code-window width.
    pub spec: ProtocolSpec,
    /// Handler invoked for every negotiated stream.
    pub handler: Arc<dyn ProtocolHandler<S>>,
}

impl<S> Clone for Protocol<S> {
    fn clone(&self) -> Self {
        Self { spec: self.spec.clone(), handler: self.handler.clone() }
    }
}

impl<S> std::fmt::Debug for Protocol<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol").field("spec", &self.spec).finish_non_exhaustive()
    }
}

/// A busy peer scheduled for a later dial retry.
struct PeriodicDial {
    enode: String,
}

impl Job for PeriodicDial {
    fn id(&self) -> &str {
        &self.enode
    }
}

type SessionStream<T> = <<T as Transport>::Session as Session>::Stream;

struct ServerCtx<T: Transport> {
    config: ServerConfig,
    local: NodeRecord,
    transport: Arc<T>,
    protocols: Mutex<Vec<Protocol<SessionStream<T>>>>,
    peers: Mutex<HashMap<PeerId, Arc<Peer>>>,
    events_tx: mpsc::Sender<MemberEvent>,
    dial_tx: mpsc::Sender<String>,
    dispatcher: Dispatcher,
    peer_store: Mutex<Arc<dyn PeerStore>>,
    close: CancellationToken,
}

/// The devp2p node: one listener, a dial pool and the active peer set.
pub struct Server<T: Transport> {
    ctx: Arc<ServerCtx<T>>,
    secret_key: SecretKey,
    info: Option<Info>,
    events_rx: Option<mpsc::Receiver<MemberEvent>>,
    dial_rx: Option<mpsc::Receiver<String>>,
    dispatcher_rx: Option<mpsc::Receiver<Arc<dyn Job>>>,
    discovery: Option<Box<dyn Discovery>>,
}

impl<T: Transport> Server<T> {
    /// Creates a server. Must be called within a tokio runtime; background
    /// tasks are spawned by [`Server::start`].
    pub fn new(secret_key: SecretKey, transport: T, config: ServerConfig) -> Self {
        let local = NodeRecord::from_secret_key(config.bind_addr(), &secret_key);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (dial_tx, dial_rx) = mpsc::channel(DIAL_QUEUE_BUFFER);
        let (dispatcher, dispatcher_rx) = Dispatcher::new();

        let ctx = Arc::new(ServerCtx {
            config,
            local,
            transport: Arc::new(transport),
            protocols: Mutex::new(Vec::new()),
            peers: Mutex::new(HashMap::new()),
            events_tx,
            dial_tx,
            dispatcher,
            peer_store: Mutex::new(Arc::new(NoopPeerStore)),
            close: CancellationToken::new(),
        });

        Self {
            ctx,
            secret_key,
            info: None,
            events_rx: Some(events_rx),
            dial_rx: Some(dial_rx),
            dispatcher_rx: Some(dispatcher_rx),
            discovery: None,
        }
    }

    /// The local node's address record.
    pub fn local_enode(&self) -> NodeRecord {
        self.ctx.local
    }

    /// The local node id.
    pub fn id(&self) -> PeerId {
        self.ctx.local.id
    }

    /// The transport this server runs on.
    pub fn transport(&self) -> &T {
        &self.ctx.transport
    }

    /// The local node info, available once started.
    pub fn info(&self) -> Option<&Info> {
        self.info.as_ref()
    }

    /// Registers a sub-protocol. Call before [`Server::start`].
    pub fn register_protocol(
        &self,
        spec: ProtocolSpec,
        handler: Arc<dyn ProtocolHandler<SessionStream<T>>>,
    ) {
        self.ctx.protocols.lock().expect("protocols lock poisoned").push(Protocol { spec, handler });
    }

    /// Replaces the peer store. Call before [`Server::start`].
    pub fn set_peer_store(&self, store: Arc<dyn PeerStore>) {
        *self.ctx.peer_store.lock().expect("peer store lock poisoned") = store;
    }

    /// Installs a discovery source. Call before [`Server::start`].
    pub fn set_discovery(&mut self, discovery: Box<dyn Discovery>) {
        self.discovery = Some(discovery);
    }

    /// Takes the membership event stream. Yields once.
    pub fn events(&mut self) -> Option<mpsc::Receiver<MemberEvent>> {
        self.events_rx.take()
    }

    /// Enqueues an address for the dial workers. Never blocks; the request
    /// is dropped when the queue is full.
    pub fn dial(&self, enode: impl Into<String>) {
        let _ = self.ctx.dial_tx.try_send(enode.into());
    }

    /// Dials an address and waits for the outcome.
    pub async fn dial_sync(&self, enode: &str) -> Result<(), ServerError> {
        self.ctx.connect(enode).await
    }

    /// Node ids of all connected peers.
    pub fn peers(&self) -> Vec<PeerId> {
        self.ctx.peers.lock().expect("peers lock poisoned").keys().copied().collect()
    }

    /// Looks up a connected peer.
    pub fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.ctx.peers.lock().expect("peers lock poisoned").get(id).cloned()
    }

    /// Looks up a connected peer by a hex prefix of its node id.
    pub fn peer_by_prefix(&self, prefix: &str) -> Option<Arc<Peer>> {
        self.ctx
            .peers
            .lock()
            .expect("peers lock poisoned")
            .values()
            .find(|p| alloy_primitives::hex::encode(p.id()).starts_with(prefix))
            .cloned()
    }

    /// Boots the node: loads the peer store, binds the transport, starts
    /// the accept loop, discovery and the dial pool.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        // bootstrap targets: stored peers plus configured bootnodes
        let stored = self.ctx.peer_store().load().await?;
        for addr in stored.into_iter().chain(self.ctx.config.bootnodes.clone()) {
            self.dial(addr);
        }

        let specs: Vec<ProtocolSpec> = self
            .ctx
            .protocols
            .lock()
            .expect("protocols lock poisoned")
            .iter()
            .map(|p| p.spec.clone())
            .collect();
        let info = Info {
            client: self.ctx.config.name.clone(),
            enode: self.ctx.local,
            capabilities: specs.clone(),
            listen_port: self.ctx.config.bind_port,
        };
        self.info = Some(info.clone());

        self.ctx
            .transport
            .setup(self.secret_key, specs, info, self.ctx.config.bind_addr())
            .await?;

        self.spawn_accept_loop();

        let disc_rx = match self.discovery.as_mut() {
            Some(disc) => {
                disc.schedule().await?;
                disc.deliver()
            }
            None => None,
        };

        self.spawn_dial_pool(disc_rx);
        Ok(())
    }

    /// Shuts the node down: stops the dial pool, closes every peer session,
    /// flushes the peer store and tears the transport down.
    pub async fn close(&self) {
        self.ctx.close.cancel();
        self.ctx.dispatcher.set_enabled(false);

        let peers: Vec<Arc<Peer>> =
            self.ctx.peers.lock().expect("peers lock poisoned").values().cloned().collect();
        for peer in peers {
            peer.close();
        }

        if let Err(err) = self.ctx.peer_store().close().await {
            warn!(target: "devp2p::server", %err, "failed to flush peer store");
        }
        if let Err(err) = self.ctx.transport.close().await {
            warn!(target: "devp2p::server", %err, "failed to close transport");
        }
    }

    fn spawn_accept_loop(&self) {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.close.cancelled() => return,
                    res = ctx.transport.accept() => match res {
                        Ok(session) => {
                            let ctx = ctx.clone();
                            tokio::spawn(async move {
                                if let Err(err) = ctx.add_session(session).await {
                                    debug!(target: "devp2p::server", %err, "inbound session rejected");
                                }
                            });
                        }
                        Err(TransportError::Closed) => return,
                        Err(err) => {
                            warn!(target: "devp2p::server", %err, "accept failed");
                            return
                        }
                    }
                }
            }
        });
    }

    fn spawn_dial_pool(&mut self, disc_rx: Option<mpsc::Receiver<String>>) {
        let ctx = self.ctx.clone();
        ctx.dispatcher.set_enabled(true);

        let (task_tx, task_rx) = mpsc::channel::<String>(ctx.config.dial_tasks);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        for worker in 0..ctx.config.dial_tasks {
            let ctx = ctx.clone();
            let task_rx = task_rx.clone();
            tokio::spawn(dial_worker(ctx, task_rx, worker));
        }

        let mut dial_rx = self.dial_rx.take();
        let mut disc_rx = disc_rx;
        let mut dispatcher_rx = self.dispatcher_rx.take();
        tokio::spawn(async move {
            loop {
                let addr = tokio::select! {
                    _ = ctx.close.cancelled() => return,
                    addr = recv_from(&mut dial_rx) => addr,
                    addr = recv_from(&mut disc_rx) => addr,
                    job = recv_job(&mut dispatcher_rx) => job,
                };
                if task_tx.send(addr).await.is_err() {
                    return
                }
            }
        });
    }
}

/// Receives from an optional channel; pends forever once the source is gone
/// so the surrounding select can keep serving the other sources.
async fn recv_from(rx: &mut Option<mpsc::Receiver<String>>) -> String {
    loop {
        match rx {
            Some(inner) => match inner.recv().await {
                Some(addr) => return addr,
                None => *rx = None,
            },
            None => std::future::pending::<()>().await,
        }
    }
}

async fn recv_job(rx: &mut Option<mpsc::Receiver<Arc<dyn Job>>>) -> String {
    loop {
        match rx {
            Some(inner) => match inner.recv().await {
                Some(job) => return job.id().to_string(),
                None => *rx = None,
            },
            None => std::future::pending::<()>().await,
        }
    }
}

async fn dial_worker<T: Transport>(
    ctx: Arc<ServerCtx<T>>,
    task_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    worker: usize,
) {
    loop {
        let addr = tokio::select! {
            _ = ctx.close.cancelled() => return,
            addr = async { task_rx.lock().await.recv().await } => match addr {
                Some(addr) => addr,
                None => return,
            },
        };

        trace!(target: "devp2p::dial", worker, %addr, "dialing");
        let res = ctx.connect(&addr).await;
        let tracked = ctx.dispatcher.contains(&addr);
        match res {
            Ok(()) => {
                if tracked {
                    let _ = ctx.dispatcher.remove(&addr);
                }
                if let Err(err) = ctx.peer_store().update(&addr, PeerStatus::Active).await {
                    warn!(target: "devp2p::dial", %err, "peer store update failed");
                }
            }
            Err(err) if err.is_too_many_peers() => {
                debug!(target: "devp2p::dial", worker, %addr, "peer busy, scheduling retry");
                if !tracked {
                    let _ = ctx
                        .dispatcher
                        .add(Arc::new(PeriodicDial { enode: addr }), ctx.config.dial_busy_interval);
                }
            }
            Err(err) => {
                debug!(target: "devp2p::dial", worker, %addr, %err, "dial failed");
                if tracked {
                    let _ = ctx.dispatcher.remove(&addr);
                }
            }
        }
    }
}

impl<T: Transport> ServerCtx<T> {
    fn peer_store(&self) -> Arc<dyn PeerStore> {
        self.peer_store.lock().expect("peer store lock poisoned").clone()
    }

    fn emit(&self, event_type: EventType, peer: Arc<Peer>) {
        // drop the event when nobody is keeping up
        let _ = self.events_tx.try_send(MemberEvent { event_type, peer });
    }

    fn get_protocol(&self, spec: &ProtocolSpec) -> Option<Protocol<SessionStream<T>>> {
        self.protocols
            .lock()
            .expect("protocols lock poisoned")
            .iter()
            .find(|p| p.spec.name == spec.name && p.spec.version == spec.version)
            .cloned()
    }

    async fn connect(self: &Arc<Self>, addr: &str) -> Result<(), ServerError> {
        let record: NodeRecord =
            addr.parse().map_err(|_| ServerError::InvalidEnode(addr.to_string()))?;
        if record.id == self.local.id {
            return Ok(())
        }
        if self.peers.lock().expect("peers lock poisoned").contains_key(&record.id) {
            return Ok(())
        }

        let session = self.transport.dial(addr, self.config.dial_timeout).await?;
        self.add_session(session).await
    }

    async fn add_session(self: &Arc<Self>, mut session: T::Session) -> Result<(), ServerError> {
        if self.peers.lock().expect("peers lock poisoned").len() >= self.config.max_peers {
            session.close_busy();
            return Err(TransportError::TooManyPeers.into())
        }

        let info = session.info().clone();
        let id = info.enode.id;
        let streams = session.take_streams();
        let handle: Arc<dyn SessionHandle> = Arc::new(session);
        let peer = Arc::new(Peer::new(info, handle.clone()));

        if streams.is_empty() {
            peer.close();
            return Err(ProtocolError::Other("session has no negotiated streams".into()).into())
        }

        // resolve every stream's protocol before running any handler
        let mut work = Vec::with_capacity(streams.len());
        for stream in streams {
            match self.get_protocol(stream.protocol()) {
                Some(protocol) => work.push((protocol, stream)),
                None => {
                    let spec = stream.protocol().clone();
                    peer.close();
                    return Err(ProtocolError::Other(format!(
                        "protocol {}/{} is not registered",
                        spec.name, spec.version
                    ))
                    .into())
                }
            }
        }

        let pending = work.len();
        let (errs_tx, mut errs_rx) = mpsc::channel(pending);
        for (protocol, stream) in work {
            let peer = peer.clone();
            let errs_tx = errs_tx.clone();
            tokio::spawn(async move {
                let spec = protocol.spec.clone();
                let res = protocol.handler.open(stream, peer.clone()).await;
                if res.is_ok() {
                    peer.attach_protocol(spec);
                }
                let _ = errs_tx.send(res).await;
            });
        }
        drop(errs_tx);

        for _ in 0..pending {
            match errs_rx.recv().await {
                Some(Ok(())) => {}
                Some(Err(err)) => {
                    debug!(target: "devp2p::server", peer = peer.pretty_id(), %err, "sub-protocol handshake failed");
                    peer.set_status(PeerStatus::Disconnected);
                    peer.close();
                    self.emit(EventType::NodeHandshakeFail, peer);
                    return Err(err.into())
                }
                None => break,
            }
        }

        peer.set_status(PeerStatus::Active);
        self.peers.lock().expect("peers lock poisoned").insert(id, peer.clone());

        // remove the peer once the session is gone, however that happens
        let ctx = self.clone();
        let watched = peer.clone();
        let closed = handle.closed();
        tokio::spawn(async move {
            closed.cancelled().await;
            let removed = ctx.peers.lock().expect("peers lock poisoned").remove(&watched.id());
            if removed.is_some() {
                watched.set_status(PeerStatus::Disconnected);
                ctx.emit(EventType::NodeLeave, watched);
            }
        });

        self.emit(EventType::NodeJoin, peer);
        Ok(())
    }
}
