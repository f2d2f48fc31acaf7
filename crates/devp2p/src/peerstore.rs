//! Durable storage of known peer addresses.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::PeerStoreError, peer::PeerStatus};

/// Persists peer addresses across restarts.
#[async_trait]
pub trait PeerStore: Send + Sync + 'static {
    /// Returns all stored addresses, used to bootstrap dialing.
    async fn load(&self) -> Result<Vec<String>, PeerStoreError>;

    /// Records the latest observed status of an address.
    async fn update(&self, addr: &str, status: PeerStatus) -> Result<(), PeerStoreError>;

    /// Flushes and releases the store.
    async fn close(&self) -> Result<(), PeerStoreError>;
}

/// A store that remembers nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPeerStore;

#[async_trait]
impl PeerStore for NoopPeerStore {
    async fn load(&self) -> Result<Vec<String>, PeerStoreError> {
        Ok(Vec::new())
    }

    async fn update(&self, _addr: &str, _status: PeerStatus) -> Result<(), PeerStoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerStoreError> {
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PeerEntry {
    status: PeerStatus,
}

/// Stores peers in a `peers.json` file inside the given directory.
///
/// Updates are kept in memory; the file is written on [`PeerStore::close`].
#[derive(Debug)]
pub struct JsonPeerStore {
    path: PathBuf,
    peers: Mutex<HashMap<String, PeerEntry>>,
}

impl JsonPeerStore {
    /// Creates a store rooted at `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self { path: dir.as_ref().join("peers.json"), peers: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl PeerStore for JsonPeerStore {
    async fn load(&self) -> Result<Vec<String>, PeerStoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let stored: HashMap<String, PeerEntry> = serde_json::from_slice(&data)?;
        let addrs = stored.keys().cloned().collect();
        *self.peers.lock().expect("peer store lock poisoned") = stored;
        Ok(addrs)
    }

    async fn update(&self, addr: &str, status: PeerStatus) -> Result<(), PeerStoreError> {
        self.peers
            .lock()
            .expect("peer store lock poisoned")
            .insert(addr.to_string(), PeerEntry { status });
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerStoreError> {
        let snapshot = self.peers.lock().expect("peer store lock poisoned").clone();
        let data = serde_json::to_vec_pretty(&snapshot)?;
        tokio::fs::write(&self.path, data).await?;
        debug!(target: "devp2p::peerstore", path = %self.path.display(), peers = snapshot.len(), "peer store flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn json_store_roundtrip() {
        let dir = std::env::temp_dir().join(format!("devp2p-peerstore-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let store = JsonPeerStore::new(&dir);
        assert!(store.load().await.unwrap().is_empty());
        store.update("enode://aa@127.0.0.1:30303", PeerStatus::Active).await.unwrap();
        store.update("enode://bb@127.0.0.1:30304", PeerStatus::Busy).await.unwrap();
        store.close().await.unwrap();

        let reopened = JsonPeerStore::new(&dir);
        let mut addrs = reopened.load().await.unwrap();
        addrs.sort();
        assert_eq!(
            addrs,
            vec!["enode://aa@127.0.0.1:30303".to_string(), "enode://bb@127.0.0.1:30304".to_string()]
        );

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
