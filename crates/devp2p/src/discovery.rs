//! Peer discovery as a collaborator: the server only consumes a stream of
//! candidate enode URLs.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::DiscoveryError;

/// A source of candidate peer addresses.
#[async_trait]
pub trait Discovery: Send + 'static {
    /// Starts the discovery background work.
    async fn schedule(&mut self) -> Result<(), DiscoveryError>;

    /// Takes the stream of discovered enode URLs. Yields `None` on repeated
    /// calls.
    fn deliver(&mut self) -> Option<mpsc::Receiver<String>>;

    /// Stops the discovery background work.
    async fn close(&mut self) -> Result<(), DiscoveryError>;
}

/// Discovery that never finds anyone.
#[derive(Debug, Default)]
pub struct NoopDiscovery;

#[async_trait]
impl Discovery for NoopDiscovery {
    async fn schedule(&mut self) -> Result<(), DiscoveryError> {
        Ok(())
    }

    fn deliver(&mut self) -> Option<mpsc::Receiver<String>> {
        None
    }

    async fn close(&mut self) -> Result<(), DiscoveryError> {
        Ok(())
    }
}
