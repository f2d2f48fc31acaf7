//! The TCP transport wiring sessions into the server.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use devp2p::{Info, NodeRecord, ProtocolSpec, Transport, TransportError};
use secp256k1::SecretKey;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, Mutex},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionContext};

/// A session over a TCP connection.
pub type TcpSession = Session<TcpStream>;

/// Buffer of fully established inbound sessions awaiting `accept`.
const SESSION_BUFFER: usize = 10;

/// The RLPx transport: listener, accept loop and dialer.
pub struct Rlpx {
    ctx: std::sync::Mutex<Option<Arc<SessionContext>>>,
    sessions: Mutex<Option<mpsc::Receiver<TcpSession>>>,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl Rlpx {
    /// Creates an unbound transport; `setup` binds it.
    pub fn new() -> Self {
        Self {
            ctx: std::sync::Mutex::new(None),
            sessions: Mutex::new(None),
            local_addr: std::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// The bound listener address, once `setup` ran. Useful when binding to
    /// port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("rlpx addr lock poisoned")
    }

    fn session_ctx(&self) -> Result<Arc<SessionContext>, TransportError> {
        self.ctx.lock().expect("rlpx ctx lock poisoned").clone().ok_or(TransportError::Closed)
    }
}

impl Default for Rlpx {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Rlpx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rlpx").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for Rlpx {
    type Session = TcpSession;

    async fn setup(
        &self,
        secret_key: SecretKey,
        protocols: Vec<ProtocolSpec>,
        info: Info,
        bind: SocketAddr,
    ) -> Result<(), TransportError> {
        let ctx = Arc::new(SessionContext {
            secret_key,
            client: info.client,
            listen_port: info.listen_port,
            protocols,
        });
        *self.ctx.lock().expect("rlpx ctx lock poisoned") = Some(ctx.clone());

        let listener = TcpListener::bind(bind).await?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock().expect("rlpx addr lock poisoned") = Some(bound);
        info!(target: "rlpx", addr = %bound, "listening");

        let (sessions_tx, sessions_rx) = mpsc::channel(SESSION_BUFFER);
        *self.sessions.lock().await = Some(sessions_rx);

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let conn = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    conn = listener.accept() => conn,
                };
                match conn {
                    Ok((socket, remote_addr)) => {
                        let ctx = ctx.clone();
                        let sessions_tx = sessions_tx.clone();
                        tokio::spawn(async move {
                            match ctx.accept(socket, remote_addr.ip()).await {
                                // drop the session when accept() is backed up
                                Ok(session) => {
                                    let _ = sessions_tx.try_send(session);
                                }
                                Err(err) => {
                                    debug!(target: "rlpx", %remote_addr, %err, "inbound handshake failed");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        warn!(target: "rlpx", %err, "listener failed");
                        return
                    }
                }
            }
        });
        Ok(())
    }

    async fn dial(&self, addr: &str, timeout: Duration) -> Result<TcpSession, TransportError> {
        let ctx = self.session_ctx()?;
        let record: NodeRecord =
            addr.parse().map_err(|_| TransportError::InvalidAddress(addr.to_string()))?;

        tokio::time::timeout(timeout, async {
            let socket = TcpStream::connect(record.tcp_addr()).await?;
            ctx.connect(socket, record.id, record.address).await.map_err(Into::into)
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    async fn accept(&self) -> Result<TcpSession, TransportError> {
        let mut guard = self.sessions.lock().await;
        let sessions = guard.as_mut().ok_or(TransportError::Closed)?;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            session = sessions.recv() => session.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shutdown.cancel();
        Ok(())
    }
}
