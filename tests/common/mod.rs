//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A scriptable in-memory `PeerTransport`
//! - An advertisement store that is always down
//! - Node and register fixtures

#![allow(dead_code)]

pub mod containers;

pub use containers::*;

use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use parking_lot::Mutex;
use register_replication::catalog::store::{AdvertisementStore, StoreFuture};
use register_replication::network::{
    BoxFuture, NetworkError, NetworkResult, PeerTransport, StaticPeerDirectory, TransactionStream,
};
use register_replication::types::{
    CachedTransaction, LocalRegisterAdvertisement, PeerRegisterInfo, RegisterSnapshot,
    TransactionNotification,
};
use register_replication::{NodeConfig, ReplicationError, ReplicationNode};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A live feed script: transactions to emit, then either end or stay open.
#[derive(Clone)]
pub struct FeedScript {
    pub transactions: Vec<CachedTransaction>,
    pub stay_open: bool,
}

/// In-memory transport. Every peer serves what it was scripted with;
/// peers marked failing error on every exchange.
#[derive(Default)]
pub struct MockTransport {
    snapshots: DashMap<(String, String), RegisterSnapshot>,
    feeds: DashMap<(String, String), FeedScript>,
    advertisements: DashMap<String, Vec<PeerRegisterInfo>>,
    failing: DashSet<String>,
    hanging: DashSet<String>,
    delays: DashMap<String, Duration>,
    sent: Mutex<Vec<(String, TransactionNotification)>>,
    fetches: AtomicUsize,
    stream_opens: Mutex<Vec<(String, String, u64)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve_snapshot(&self, peer_id: &str, snapshot: RegisterSnapshot) {
        self.snapshots
            .insert((peer_id.to_string(), snapshot.register_id.clone()), snapshot);
    }

    pub fn serve_feed(&self, peer_id: &str, register_id: &str, script: FeedScript) {
        self.feeds
            .insert((peer_id.to_string(), register_id.to_string()), script);
    }

    pub fn serve_advertisements(&self, peer_id: &str, infos: Vec<PeerRegisterInfo>) {
        self.advertisements.insert(peer_id.to_string(), infos);
    }

    pub fn fail_peer(&self, peer_id: &str) {
        self.failing.insert(peer_id.to_string());
    }

    pub fn heal_peer(&self, peer_id: &str) {
        self.failing.remove(peer_id);
    }

    /// Notifications to and snapshot fetches from this peer never complete.
    pub fn hang_peer(&self, peer_id: &str) {
        self.hanging.insert(peer_id.to_string());
    }

    /// Snapshot fetches from this peer answer only after `delay`.
    pub fn slow_peer(&self, peer_id: &str, delay: Duration) {
        self.delays.insert(peer_id.to_string(), delay);
    }

    pub fn sent(&self) -> Vec<(String, TransactionNotification)> {
        self.sent.lock().clone()
    }

    /// Number of `fetch_register` calls that reached the transport.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn stream_opens(&self) -> Vec<(String, String, u64)> {
        self.stream_opens.lock().clone()
    }

    fn check(&self, peer_id: &str) -> NetworkResult<()> {
        if self.failing.contains(peer_id) {
            Err(NetworkError::new(format!("{} unreachable", peer_id)))
        } else {
            Ok(())
        }
    }
}

impl PeerTransport for MockTransport {
    fn send_notification(&self, peer_id: &str, notification: &TransactionNotification) -> BoxFuture<'_, ()> {
        if self.hanging.contains(peer_id) {
            return Box::pin(futures::future::pending::<NetworkResult<()>>());
        }
        let result = self.check(peer_id).map(|()| {
            self.sent
                .lock()
                .push((peer_id.to_string(), notification.clone()));
        });
        Box::pin(async move { result })
    }

    fn fetch_register(&self, peer_id: &str, register_id: &str) -> BoxFuture<'_, RegisterSnapshot> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.hanging.contains(peer_id) {
            return Box::pin(futures::future::pending::<NetworkResult<RegisterSnapshot>>());
        }
        let result = self.check(peer_id).and_then(|()| {
            self.snapshots
                .get(&(peer_id.to_string(), register_id.to_string()))
                .map(|s| s.value().clone())
                .ok_or_else(|| NetworkError::new(format!("{} does not hold {}", peer_id, register_id)))
        });
        let delay = self.delays.get(peer_id).map(|d| *d.value());
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }

    fn open_transaction_stream(
        &self,
        peer_id: &str,
        register_id: &str,
        from_version: u64,
    ) -> BoxFuture<'_, TransactionStream> {
        self.stream_opens
            .lock()
            .push((peer_id.to_string(), register_id.to_string(), from_version));
        let result = self.check(peer_id).and_then(|()| {
            let script = self
                .feeds
                .get(&(peer_id.to_string(), register_id.to_string()))
                .map(|s| s.value().clone())
                .ok_or_else(|| NetworkError::new(format!("{} has no feed for {}", peer_id, register_id)))?;
            let items = futures::stream::iter(
                script
                    .transactions
                    .into_iter()
                    .filter(move |tx| tx.version > from_version)
                    .map(Ok::<_, NetworkError>),
            );
            let stream: TransactionStream = if script.stay_open {
                items
                    .chain(futures::stream::pending::<NetworkResult<CachedTransaction>>())
                    .boxed()
            } else {
                items.boxed()
            };
            Ok(stream)
        });
        Box::pin(async move { result })
    }

    fn fetch_advertisements(&self, peer_id: &str) -> BoxFuture<'_, Vec<PeerRegisterInfo>> {
        let result = self.check(peer_id).map(|()| {
            self.advertisements
                .get(peer_id)
                .map(|a| a.value().clone())
                .unwrap_or_default()
        });
        Box::pin(async move { result })
    }
}

/// An advertisement store that is never reachable.
pub struct DownStore;

impl AdvertisementStore for DownStore {
    fn name(&self) -> &'static str {
        "down"
    }
    fn save_local(&self, _: &LocalRegisterAdvertisement) -> StoreFuture<'_, ()> {
        Box::pin(async { Err(ReplicationError::store_msg("SET", "connection refused")) })
    }
    fn delete_local(&self, _: &str) -> StoreFuture<'_, ()> {
        Box::pin(async { Err(ReplicationError::store_msg("DEL", "connection refused")) })
    }
    fn load_local(&self) -> StoreFuture<'_, Vec<LocalRegisterAdvertisement>> {
        Box::pin(async { Err(ReplicationError::store_msg("SMEMBERS", "connection refused")) })
    }
    fn refresh_local(&self, _: &[LocalRegisterAdvertisement]) -> StoreFuture<'_, ()> {
        Box::pin(async { Err(ReplicationError::store_msg("EXPIRE", "connection refused")) })
    }
    fn save_remote(&self, _: &str, _: &[PeerRegisterInfo]) -> StoreFuture<'_, ()> {
        Box::pin(async { Err(ReplicationError::store_msg("SET", "connection refused")) })
    }
    fn delete_remote_peer(&self, _: &str) -> StoreFuture<'_, ()> {
        Box::pin(async { Err(ReplicationError::store_msg("DEL", "connection refused")) })
    }
    fn load_remote(&self) -> StoreFuture<'_, HashMap<String, Vec<PeerRegisterInfo>>> {
        Box::pin(async { Err(ReplicationError::store_msg("SMEMBERS", "connection refused")) })
    }
}

/// `count` transactions for `register_id`, versions `1..=count`.
pub fn transactions(register_id: &str, count: u64) -> Vec<CachedTransaction> {
    (1..=count)
        .map(|v| CachedTransaction::new(format!("{}-tx-{}", register_id, v), register_id, v, vec![v as u8]))
        .collect()
}

pub fn snapshot(register_id: &str, count: u64) -> RegisterSnapshot {
    RegisterSnapshot {
        register_id: register_id.to_string(),
        transactions: transactions(register_id, count),
        dockets: Vec::new(),
    }
}

/// Fast ticks, no backoff, in-memory SQLite, maintenance off.
pub fn fast_config(node_id: &str) -> NodeConfig {
    let mut config = NodeConfig::for_testing(node_id);
    config.scheduler.tick_interval = "20ms".to_string();
    config.scheduler.backoff_initial_ms = 0;
    config.scheduler.backoff_max_sec = 0;
    config.maintenance.enabled = false;
    config
}

pub struct TestNode {
    pub node: ReplicationNode,
    pub directory: Arc<StaticPeerDirectory>,
    pub transport: Arc<MockTransport>,
}

pub fn test_node(config: NodeConfig, peers: &[&str]) -> TestNode {
    let directory = Arc::new(StaticPeerDirectory::with_peers(peers.iter().copied()));
    let transport = MockTransport::new();
    let node = ReplicationNode::new(config, directory.clone(), transport.clone());
    TestNode {
        node,
        directory,
        transport,
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_for<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
