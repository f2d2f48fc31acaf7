#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]

//! Node discovery via DNS
//! ([EIP-1459](https://eips.ethereum.org/EIPS/eip-1459)).
//!
//! A tree of TXT records is walked depth-first starting at a signed root;
//! every resolved record is checked against the hash it was looked up
//! under. Leaves are node records which get converted to enode URLs and
//! handed to the server through the [`Discovery`] boundary.

pub mod entries;

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use devp2p::{Discovery, DiscoveryError, NodeRecord};
use devp2p_enode::Enr;
use sha3::Digest;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::entries::{parse_entry, BranchEntry, Entry, LinkEntry, NodeEntry, RootEntry};

/// How many discovered addresses may queue up before the walker blocks.
const DELIVERY_BUFFER: usize = 256;
/// Delay before refetching the root after a full tree walk.
const RECHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Delay before retrying after a resolution failure.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Supplies TXT records for tree lookups.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// Returns the TXT records of the fully qualified domain name.
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, DiscoveryError>;
}

/// An in-memory resolver backed by a map, for tests and fixtures.
#[derive(Clone, Debug, Default)]
pub struct MapResolver {
    entries: std::collections::HashMap<String, String>,
}

impl MapResolver {
    /// Inserts one TXT record.
    pub fn insert(&mut self, fqdn: impl Into<String>, record: impl Into<String>) {
        self.entries.insert(fqdn.into(), record.into());
    }
}

#[async_trait]
impl Resolver for MapResolver {
    async fn lookup_txt(&self, fqdn: &str) -> Result<Vec<String>, DiscoveryError> {
        match self.entries.get(fqdn) {
            Some(record) => Ok(vec![record.clone()]),
            None => Err(DiscoveryError::Lookup(format!("no TXT record for {fqdn}"))),
        }
    }
}

/// DNS-based [`Discovery`] rooted at one `enrtree://` link.
pub struct DnsDiscovery<R> {
    resolver: Arc<R>,
    link: LinkEntry,
    delivery: Option<mpsc::Receiver<String>>,
    shutdown: CancellationToken,
}

impl<R: Resolver> DnsDiscovery<R> {
    /// Creates a discovery client for the tree behind the given link.
    pub fn new(resolver: R, link: LinkEntry) -> Self {
        Self {
            resolver: Arc::new(resolver),
            link,
            delivery: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// Parses an `enrtree://` URL and creates the client.
    pub fn from_url(resolver: R, url: &str) -> Result<Self, entries::ParseEntryError> {
        Ok(Self::new(resolver, url.parse()?))
    }
}

#[async_trait]
impl<R: Resolver> Discovery for DnsDiscovery<R> {
    async fn schedule(&mut self) -> Result<(), DiscoveryError> {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        self.delivery = Some(rx);

        let walker = TreeWalker {
            resolver: self.resolver.clone(),
            link: self.link.clone(),
            root: None,
            missing: VecDeque::new(),
            seen: HashSet::new(),
        };
        let shutdown = self.shutdown.clone();
        tokio::spawn(walker.run(tx, shutdown));
        Ok(())
    }

    fn deliver(&mut self) -> Option<mpsc::Receiver<String>> {
        self.delivery.take()
    }

    async fn close(&mut self) -> Result<(), DiscoveryError> {
        self.shutdown.cancel();
        Ok(())
    }
}

struct TreeWalker<R> {
    resolver: Arc<R>,
    link: LinkEntry,
    root: Option<RootEntry>,
    missing: VecDeque<String>,
    seen: HashSet<String>,
}

impl<R: Resolver> TreeWalker<R> {
    async fn run(mut self, tx: mpsc::Sender<String>, shutdown: CancellationToken) {
        loop {
            let pause = match self.step(&tx).await {
                Ok(Step::Advanced) => continue,
                Ok(Step::Exhausted) => RECHECK_INTERVAL,
                Err(err) => {
                    debug!(target: "dns", domain = %self.link.domain, %err, "tree walk failed");
                    RETRY_INTERVAL
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tx.closed() => return,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Makes one unit of progress: fetches the root if missing, otherwise
    /// resolves the next outstanding subtree hash.
    async fn step(&mut self, tx: &mpsc::Sender<String>) -> Result<Step, DiscoveryError> {
        if self.root.is_none() {
            self.resolve_root().await?;
            return Ok(Step::Advanced)
        }

        let Some(target) = self.missing.pop_front() else {
            // walked everything; next round re-reads the root
            self.root = None;
            self.seen.clear();
            return Ok(Step::Exhausted)
        };
        if !self.seen.insert(target.clone()) {
            return Ok(Step::Advanced)
        }

        let expected_prefix = entries::decode_subtree_hash(&target)
            .map_err(|err| DiscoveryError::Lookup(err.to_string()))?;
        let fqdn = format!("{}.{}", target, self.link.domain);
        let records = self.resolver.lookup_txt(&fqdn).await?;

        for record in records {
            let hash = sha3::Keccak256::digest(record.as_bytes());
            if !hash.as_slice().starts_with(&expected_prefix) {
                return Err(DiscoveryError::Lookup(format!("hash mismatch for {fqdn}")))
            }
            match parse_entry(&record)
                .map_err(|err| DiscoveryError::Lookup(err.to_string()))?
            {
                Entry::Branch(BranchEntry { children }) => {
                    // depth first: children go to the front
                    for child in children.into_iter().rev() {
                        self.missing.push_front(child);
                    }
                }
                Entry::Node(NodeEntry { record }) => {
                    if let Some(enode) = enode_url(&record) {
                        trace!(target: "dns", %enode, "node discovered");
                        if tx.send(enode).await.is_err() {
                            return Err(DiscoveryError::Lookup("delivery closed".to_string()))
                        }
                    }
                }
                Entry::Link(link) => {
                    trace!(target: "dns", linked = %link.domain, "link entries are not followed");
                }
                Entry::Root(_) => {
                    return Err(DiscoveryError::Lookup(format!("unexpected root at {fqdn}")))
                }
            }
        }
        Ok(Step::Advanced)
    }

    async fn resolve_root(&mut self) -> Result<(), DiscoveryError> {
        let records = self.resolver.lookup_txt(&self.link.domain).await?;
        let record = records
            .first()
            .ok_or_else(|| DiscoveryError::Lookup(format!("no root at {}", self.link.domain)))?;
        let root: RootEntry =
            record.parse().map_err(|err: entries::ParseEntryError| {
                DiscoveryError::Lookup(err.to_string())
            })?;
        if !root.verify(&self.link.pubkey) {
            warn!(target: "dns", domain = %self.link.domain, "root signature check failed");
            return Err(DiscoveryError::Lookup("invalid root signature".to_string()))
        }
        debug!(target: "dns", domain = %self.link.domain, seq = root.seq, "root resolved");
        self.missing = VecDeque::from([root.enr_root.clone()]);
        self.seen.clear();
        self.root = Some(root);
        Ok(())
    }
}

enum Step {
    Advanced,
    Exhausted,
}

/// Converts a node record into an enode URL, when it carries enough
/// endpoint information.
fn enode_url(record: &Enr) -> Option<String> {
    let id = record.peer_id().ok()?;
    let address = record
        .ip4()
        .map(std::net::IpAddr::V4)
        .or_else(|| record.ip6().map(std::net::IpAddr::V6))?;
    let tcp_port = record.tcp().or_else(|| record.udp())?;
    let udp_port = record.udp().unwrap_or(tcp_port);
    Some(NodeRecord { address, tcp_port, udp_port, id }.to_string())
}
