//! Two full nodes talking `eth/66` over RLPx on loopback.

use std::{sync::Arc, time::Duration};

use alloy_primitives::{b256, Bytes, B256, U256};
use async_trait::async_trait;
use devp2p::{EventType, NodeRecord, Server, ServerConfig};
use devp2p_eth_wire::{
    Backend, BlockHashNumber, EthPeer, EthProtocol, GetBlockHeaders, HashList, RawBody, Status,
};
use devp2p_forkid::ForkFilter;
use devp2p_rlpx::Rlpx;
use secp256k1::SecretKey;
use tokio::sync::mpsc;

const GENESIS: B256 = b256!("d4e56740f876aef8c010b86a40d5f56745a118d0906a34e69aec8c0db1cb8fa3");
const FORKS: [u64; 3] = [1_150_000, 1_920_000, 2_463_000];
const HEAD: u64 = 2_000_000;

struct ChainBackend {
    status: Status,
    filter: ForkFilter,
    headers: RawBody,
    peers: mpsc::UnboundedSender<EthPeer>,
}

impl ChainBackend {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<EthPeer>) {
        let filter = ForkFilter::new(HEAD, GENESIS, FORKS);
        let status = Status::builder()
            .network_id(1)
            .total_difficulty(U256::from(1_000_000u64))
            .blockhash(B256::repeat_byte(0x42))
            .genesis(GENESIS)
            .forkid(filter.current())
            .build();
        let mut headers = Vec::new();
        alloy_rlp::Encodable::encode(&HashList(vec![B256::repeat_byte(0x42)]), &mut headers);
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        let backend =
            Arc::new(Self { status, filter, headers: RawBody(headers.into()), peers: peers_tx });
        (backend, peers_rx)
    }
}

#[async_trait]
impl Backend for ChainBackend {
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

    async fn notify_transactions(&self, _raw: Bytes) {}

    async fn notify_transaction_hashes(&self, _hashes: Vec<B256>) {}

    async fn notify_block_hashes(&self, _hashes: Vec<BlockHashNumber>) {}

    async fn notify_block(&self, _raw: Bytes) {}
}

async fn node(name: &str) -> (Server<Rlpx>, mpsc::UnboundedReceiver<EthPeer>) {
    let secret = SecretKey::new(&mut rand::thread_rng());
    let config = ServerConfig::default()
        .with_name(format!("{name}/test"))
        .with_bind_address("127.0.0.1".parse().unwrap())
        .with_bind_port(0);
    let mut server = Server::new(secret, Rlpx::new(), config);

    let (backend, peers_rx) = ChainBackend::new();
    server.register_protocol(EthProtocol::spec(), Arc::new(EthProtocol::new(backend)));
    server.start().await.unwrap();
    (server, peers_rx)
}

#[tokio::test]
async fn two_nodes_handshake_and_exchange_headers() {
    let (mut alice, mut alice_peers) = node("alice").await;
    let (mut bob, mut bob_peers) = node("bob").await;
    let mut alice_events = alice.events().unwrap();
    let mut bob_events = bob.events().unwrap();

    // alice dials bob's actual listen address
    let bob_addr = bob.transport().local_addr().unwrap();
    let target = NodeRecord {
        address: bob_addr.ip(),
        tcp_port: bob_addr.port(),
        udp_port: bob_addr.port(),
        id: bob.id(),
    };
    alice.dial_sync(&target.to_string()).await.unwrap();

    // both sides observe the join
    let event = alice_events.recv().await.unwrap();
    assert_eq!(event.event_type, EventType::NodeJoin);
    assert_eq!(event.peer.id(), bob.id());
    assert_eq!(event.peer.protocols().len(), 1);
    let event = tokio::time::timeout(Duration::from_secs(5), bob_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, EventType::NodeJoin);
    assert_eq!(event.peer.id(), alice.id());

    // both backends received a usable peer handle
    let alice_to_bob = alice_peers.recv().await.unwrap();
    let _bob_to_alice = bob_peers.recv().await.unwrap();

    // request/response across the real stack
    let headers = alice_to_bob.get_block_by_number(1).await.unwrap();
    let mut expected = Vec::new();
    alloy_rlp::Encodable::encode(&HashList(vec![B256::repeat_byte(0x42)]), &mut expected);
    assert_eq!(&headers[..], &expected[..]);

    // shutdown drops the peer on the other side
    alice.close().await;
    let event = tokio::time::timeout(Duration::from_secs(5), bob_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, EventType::NodeLeave);
    bob.close().await;
}

#[tokio::test]
async fn nodes_on_different_chains_do_not_peer() {
    let (mut alice, _alice_peers) = node("alice").await;

    // bob runs with another genesis
    let secret = SecretKey::new(&mut rand::thread_rng());
    let config = ServerConfig::default()
        .with_name("bob/test")
        .with_bind_address("127.0.0.1".parse().unwrap())
        .with_bind_port(0);
    let mut bob = Server::new(secret, Rlpx::new(), config);
    let (backend, _peers) = ChainBackend::new();
    let filter = ForkFilter::new(HEAD, B256::repeat_byte(0x66), FORKS);
    let status = Status::builder()
        .network_id(1)
        .genesis(B256::repeat_byte(0x66))
        .forkid(filter.current())
        .build();
    let backend = Arc::new(ChainBackend {
        status,
        filter,
        headers: backend.headers.clone(),
        peers: backend.peers.clone(),
    });
    bob.register_protocol(EthProtocol::spec(), Arc::new(EthProtocol::new(backend)));
    bob.start().await.unwrap();

    let bob_addr = bob.transport().local_addr().unwrap();
    let target = NodeRecord {
        address: bob_addr.ip(),
        tcp_port: bob_addr.port(),
        udp_port: bob_addr.port(),
        id: bob.id(),
    };

    let err = alice.dial_sync(&target.to_string()).await.unwrap_err();
    assert!(err.to_string().contains("genesis"), "unexpected error: {err}");
    assert!(alice.peers().is_empty());

    alice.close().await;
    bob.close().await;
}
