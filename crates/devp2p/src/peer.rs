use std::sync::{Arc, Mutex};

use devp2p_enode::PeerId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::transport::{Info, ProtocolSpec, SessionHandle};

/// Lifecycle state of a peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Connected with at least one running sub-protocol handler.
    Active,
    /// Session established, sub-protocol handshakes still running.
    Pending,
    /// The session is gone.
    Disconnected,
    /// The peer rejected us with "too many peers"; it is scheduled for a
    /// later retry.
    Busy,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Disconnected => "disconnected",
            Self::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// The server-level view of a connected remote node.
pub struct Peer {
    id: PeerId,
    pretty_id: String,
    info: Info,
    status: Mutex<PeerStatus>,
    protocols: Mutex<Vec<ProtocolSpec>>,
    conn: Arc<dyn SessionHandle>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.pretty_id)
            .field("client", &self.info.client)
            .field("status", &self.status())
            .finish()
    }
}

impl Peer {
    /// Wraps an established session into a peer entry.
    pub fn new(info: Info, conn: Arc<dyn SessionHandle>) -> Self {
        let id = info.enode.id;
        let pretty_id = alloy_primitives::hex::encode(&id.as_slice()[..4]);
        Self {
            id,
            pretty_id,
            info,
            status: Mutex::new(PeerStatus::Pending),
            protocols: Mutex::new(Vec::new()),
            conn,
        }
    }

    /// The peer's node id.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The first 8 hex characters of the node id, for logs.
    pub fn pretty_id(&self) -> &str {
        &self.pretty_id
    }

    /// Hello-level information about the peer.
    pub fn info(&self) -> &Info {
        &self.info
    }

    /// Current lifecycle status.
    pub fn status(&self) -> PeerStatus {
        *self.status.lock().expect("peer status lock poisoned")
    }

    pub(crate) fn set_status(&self, status: PeerStatus) {
        *self.status.lock().expect("peer status lock poisoned") = status;
    }

    /// The sub-protocols running on this peer.
    pub fn protocols(&self) -> Vec<ProtocolSpec> {
        self.protocols.lock().expect("peer protocols lock poisoned").clone()
    }

    /// Looks up a running sub-protocol by name.
    pub fn protocol(&self, name: &str) -> Option<ProtocolSpec> {
        self.protocols
            .lock()
            .expect("peer protocols lock poisoned")
            .iter()
            .find(|spec| spec.name == name)
            .cloned()
    }

    pub(crate) fn attach_protocol(&self, spec: ProtocolSpec) {
        self.protocols.lock().expect("peer protocols lock poisoned").push(spec);
    }

    /// Whether the underlying session is closed.
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// A token cancelled when the underlying session closes.
    pub fn closed(&self) -> CancellationToken {
        self.conn.closed()
    }

    /// Closes the underlying session.
    pub fn close(&self) {
        self.conn.close();
    }
}
