// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Interfaces to the embedding daemon's peer layer.
//!
//! The node never opens sockets itself. The daemon supplies:
//!
//! - a [`PeerDirectory`]: which peers exist, which are healthy, which are banned;
//! - a [`PeerTransport`]: one async method per wire exchange.
//!
//! Both are trait objects so tests can drive the node with in-memory mocks.
//!
//! # Example
//!
//! ```rust,no_run
//! use register_replication::network::{
//!     BoxFuture, NetworkError, PeerTransport, TransactionStream,
//! };
//! use register_replication::types::{PeerRegisterInfo, RegisterSnapshot, TransactionNotification};
//!
//! struct Offline;
//!
//! impl PeerTransport for Offline {
//!     fn send_notification(&self, _peer: &str, _n: &TransactionNotification) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Err(NetworkError::new("offline")) })
//!     }
//!     fn fetch_register(&self, _peer: &str, _register: &str) -> BoxFuture<'_, RegisterSnapshot> {
//!         Box::pin(async { Err(NetworkError::new("offline")) })
//!     }
//!     fn open_transaction_stream(&self, _peer: &str, _register: &str, _from: u64)
//!         -> BoxFuture<'_, TransactionStream> {
//!         Box::pin(async { Err(NetworkError::new("offline")) })
//!     }
//!     fn fetch_advertisements(&self, _peer: &str) -> BoxFuture<'_, Vec<PeerRegisterInfo>> {
//!         Box::pin(async { Ok(vec![]) })
//!     }
//! }
//! ```

use crate::types::{CachedTransaction, PeerRegisterInfo, RegisterSnapshot, TransactionNotification};
use dashmap::DashMap;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::warn;

/// Result type for transport operations.
pub type NetworkResult<T> = std::result::Result<T, NetworkError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = NetworkResult<T>> + Send + 'a>>;

/// Live transactions for one register, in version order.
pub type TransactionStream = BoxStream<'static, NetworkResult<CachedTransaction>>;

/// Simplified error for transport operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkError(pub String);

impl NetworkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for NetworkError {}

/// What the directory knows about a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub is_banned: bool,
    /// Last observed round-trip latency, if any.
    pub latency: Option<Duration>,
}

impl PeerInfo {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            is_banned: false,
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// The daemon's view of the peer set.
pub trait PeerDirectory: Send + Sync + 'static {
    /// Peers currently considered reachable and not banned.
    fn healthy_peers(&self) -> Vec<PeerInfo>;

    fn get_peer(&self, peer_id: &str) -> Option<PeerInfo>;

    fn is_banned(&self, peer_id: &str) -> bool;

    /// Ban a misbehaving peer.
    fn ban_peer(&self, peer_id: &str, reason: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Wire exchanges with a single peer.
///
/// Implementations own connection setup; callers wrap every call in the
/// peer's circuit breaker and a per-attempt timeout.
pub trait PeerTransport: Send + Sync + 'static {
    /// Deliver a gossip notification.
    fn send_notification(
        &self,
        peer_id: &str,
        notification: &TransactionNotification,
    ) -> BoxFuture<'_, ()>;

    /// Pull the complete history of a register.
    fn fetch_register(&self, peer_id: &str, register_id: &str) -> BoxFuture<'_, RegisterSnapshot>;

    /// Follow a register's new transactions starting after `from_version`.
    fn open_transaction_stream(
        &self,
        peer_id: &str,
        register_id: &str,
        from_version: u64,
    ) -> BoxFuture<'_, TransactionStream>;

    /// Ask a peer what registers it holds.
    fn fetch_advertisements(&self, peer_id: &str) -> BoxFuture<'_, Vec<PeerRegisterInfo>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Built-in implementations
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory peer directory, for standalone nodes and tests.
#[derive(Debug, Default)]
pub struct StaticPeerDirectory {
    peers: DashMap<String, PeerInfo>,
}

impl StaticPeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peers<I, S>(peer_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let directory = Self::new();
        for id in peer_ids {
            directory.add_peer(PeerInfo::new(id));
        }
        directory
    }

    pub fn add_peer(&self, info: PeerInfo) {
        self.peers.insert(info.peer_id.clone(), info);
    }

    pub fn remove_peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.remove(peer_id).map(|(_, info)| info)
    }

    pub fn set_latency(&self, peer_id: &str, latency: Duration) {
        if let Some(mut info) = self.peers.get_mut(peer_id) {
            info.latency = Some(latency);
        }
    }

    pub fn unban(&self, peer_id: &str) {
        if let Some(mut info) = self.peers.get_mut(peer_id) {
            info.is_banned = false;
        }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerDirectory for StaticPeerDirectory {
    fn healthy_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .iter()
            .filter(|e| !e.is_banned)
            .map(|e| e.value().clone())
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    fn get_peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.get(peer_id).map(|e| e.value().clone())
    }

    fn is_banned(&self, peer_id: &str) -> bool {
        self.peers.get(peer_id).map(|e| e.is_banned).unwrap_or(false)
    }

    fn ban_peer(&self, peer_id: &str, reason: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let peer_id = peer_id.to_string();
        let reason = reason.to_string();
        Box::pin(async move {
            warn!(peer_id = %peer_id, reason = %reason, "Banning peer");
            self.peers
                .entry(peer_id.clone())
                .or_insert_with(|| PeerInfo::new(peer_id))
                .is_banned = true;
        })
    }
}

/// Transport that reaches nobody.
///
/// Used when the node runs without a network (catalog and scheduler only).
/// Every exchange fails, so replication reports its sources as failed.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTransport;

impl PeerTransport for NoOpTransport {
    fn send_notification(&self, peer_id: &str, _: &TransactionNotification) -> BoxFuture<'_, ()> {
        let msg = format!("no transport configured (peer {})", peer_id);
        Box::pin(async move { Err(NetworkError(msg)) })
    }

    fn fetch_register(&self, peer_id: &str, _: &str) -> BoxFuture<'_, RegisterSnapshot> {
        let msg = format!("no transport configured (peer {})", peer_id);
        Box::pin(async move { Err(NetworkError(msg)) })
    }

    fn open_transaction_stream(&self, peer_id: &str, _: &str, _: u64) -> BoxFuture<'_, TransactionStream> {
        let msg = format!("no transport configured (peer {})", peer_id);
        Box::pin(async move { Err(NetworkError(msg)) })
    }

    fn fetch_advertisements(&self, peer_id: &str) -> BoxFuture<'_, Vec<PeerRegisterInfo>> {
        let msg = format!("no transport configured (peer {})", peer_id);
        Box::pin(async move { Err(NetworkError(msg)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_healthy_peers_sorted_and_excludes_banned() {
        let directory = StaticPeerDirectory::with_peers(["peer-c", "peer-a", "peer-b"]);
        directory.add_peer(PeerInfo {
            peer_id: "peer-z".into(),
            is_banned: true,
            latency: None,
        });

        let ids: Vec<_> = directory
            .healthy_peers()
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        assert_eq!(ids, vec!["peer-a", "peer-b", "peer-c"]);
        assert!(directory.is_banned("peer-z"));
        assert!(!directory.is_banned("peer-a"));
        assert!(!directory.is_banned("unknown"));
    }

    #[tokio::test]
    async fn test_ban_and_unban() {
        let directory = StaticPeerDirectory::with_peers(["peer-1"]);
        directory.ban_peer("peer-1", "bad data").await;
        assert!(directory.is_banned("peer-1"));
        assert!(directory.healthy_peers().is_empty());

        directory.unban("peer-1");
        assert_eq!(directory.healthy_peers().len(), 1);
    }

    #[tokio::test]
    async fn test_ban_unknown_peer_records_it() {
        let directory = StaticPeerDirectory::new();
        directory.ban_peer("stranger", "spam").await;
        assert!(directory.is_banned("stranger"));
        assert_eq!(directory.len(), 1);
    }

    #[test]
    fn test_set_latency() {
        let directory = StaticPeerDirectory::with_peers(["peer-1"]);
        directory.set_latency("peer-1", Duration::from_millis(12));
        directory.set_latency("missing", Duration::from_millis(1));
        assert_eq!(
            directory.get_peer("peer-1").and_then(|p| p.latency),
            Some(Duration::from_millis(12))
        );
        assert!(directory.get_peer("missing").is_none());
    }

    #[tokio::test]
    async fn test_noop_transport_fails_every_exchange() {
        let transport = NoOpTransport;
        let err = transport.fetch_register("peer-1", "reg-1").await.unwrap_err();
        assert!(err.to_string().contains("peer-1"));
        assert!(transport.fetch_advertisements("peer-1").await.is_err());
        assert!(transport.open_transaction_stream("peer-1", "reg-1", 0).await.is_err());
    }
}
