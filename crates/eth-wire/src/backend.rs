//! The application-level collaborator behind the `eth` handler.

use alloy_primitives::{Bytes, B256};
use async_trait::async_trait;
use devp2p_forkid::ForkFilter;

use crate::{
    handler::EthPeer,
    status::Status,
    types::{BlockHashNumber, GetBlockHeaders, RawBody},
};

/// Chain state and pool queries the `eth` handler delegates to.
///
/// Response bodies are returned as raw RLP ([`RawBody`]); the backend owns
/// the concrete header/body/transaction encodings.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// The local status to advertise in the handshake.
    fn status(&self) -> Status;

    /// The fork schedule used to validate remote fork ids.
    fn fork_filter(&self) -> ForkFilter;

    /// A peer passed the status handshake; the handle can issue requests
    /// for the lifetime of the session.
    async fn notify_peer(&self, peer: EthPeer);

    /// Serves a `GetBlockHeaders` request.
    async fn get_block_headers(&self, request: GetBlockHeaders) -> RawBody;

    /// Serves a `GetBlockBodies` request.
    async fn get_block_bodies(&self, hashes: Vec<B256>) -> RawBody;

    /// Serves a `GetPooledTransactions` request.
    async fn get_transactions(&self, hashes: Vec<B256>) -> RawBody;

    /// A `Transactions` broadcast arrived; the payload is the raw RLP list.
    async fn notify_transactions(&self, raw: Bytes);

    /// A `NewPooledTransactionHashes` broadcast arrived.
    async fn notify_transaction_hashes(&self, hashes: Vec<B256>);

    /// A `NewBlockHashes` broadcast arrived.
    async fn notify_block_hashes(&self, hashes: Vec<BlockHashNumber>);

    /// A `NewBlock` broadcast arrived; the payload is the raw RLP message.
    async fn notify_block(&self, raw: Bytes);
}
