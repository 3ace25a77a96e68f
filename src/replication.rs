// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Register replication: full-replica pulls and forward-only live feeds.
//!
//! # Source selection
//!
//! Candidates come from the advertisement catalog (banned peers are already
//! excluded there). Peers whose breaker is open or whose heartbeat recommends
//! failover are skipped. The rest are tried in order:
//!
//! 1. lowest observed latency (unknown latency last)
//! 2. highest advertised version
//! 3. peer id
//!
//! Each attempt goes through [`PeerHealth::call`], so a dead source costs at
//! most one timeout before the next candidate is tried and never blocks other
//! registers.
//!
//! # Subscription bookkeeping
//!
//! | Outcome | Subscription |
//! |---------|--------------|
//! | `Success` / `Started` | state advanced, failures reset |
//! | `NoSourcePeers` | untouched, the scheduler decides |
//! | `AllSourcesFailed` | failures +1, message "All source peers failed" |

use crate::cache::RegisterCache;
use crate::catalog::AdvertisementCatalog;
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::network::{NetworkError, PeerDirectory, PeerTransport, TransactionStream};
use crate::peer::PeerHealth;
use crate::types::{PeerRegisterInfo, RegisterSubscription, RegisterSyncState};
use chrono::Utc;
use futures::StreamExt;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

pub const ALL_SOURCES_FAILED: &str = "All source peers failed";

/// Result of a full-replica pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    Success {
        peer_id: String,
        transactions: usize,
        latest_version: u64,
    },
    /// Nobody advertises a full replica of the register.
    NoSourcePeers,
    /// Every usable candidate failed (or none was usable).
    AllSourcesFailed { attempts: usize },
}

impl PullOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::NoSourcePeers => "no_source_peers",
            Self::AllSourcesFailed { .. } => "all_failed",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::Success { peer_id, transactions, .. } => {
                format!("Pulled {} transactions from {}", transactions, peer_id)
            }
            Self::NoSourcePeers => "No source peers advertise a full replica".to_string(),
            Self::AllSourcesFailed { .. } => ALL_SOURCES_FAILED.to_string(),
        }
    }
}

/// How a live feed ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEnd {
    Stopped,
    StreamEnded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSummary {
    pub register_id: String,
    pub peer_id: String,
    pub transactions: u64,
    pub end: FeedEnd,
}

/// A running forward-only feed.
#[derive(Debug)]
pub struct LiveFeedHandle {
    register_id: String,
    peer_id: String,
    cancel: CancellationToken,
    received: Arc<AtomicU64>,
    task: JoinHandle<FeedSummary>,
}

impl LiveFeedHandle {
    pub fn register_id(&self) -> &str {
        &self.register_id
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Transactions received so far.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the feed to stop. Returns immediately.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the feed task and collect its summary.
    pub async fn join(self) -> FeedSummary {
        match self.task.await {
            Ok(summary) => summary,
            Err(e) => FeedSummary {
                register_id: self.register_id,
                peer_id: self.peer_id,
                transactions: self.received.load(Ordering::Relaxed),
                end: FeedEnd::Failed(format!("feed task panicked: {}", e)),
            },
        }
    }
}

/// Result of opening a live feed.
#[derive(Debug)]
pub enum FeedOutcome {
    Started(LiveFeedHandle),
    NoSourcePeers,
    AllSourcesFailed { attempts: usize },
}

impl FeedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started(_) => "started",
            Self::NoSourcePeers => "no_source_peers",
            Self::AllSourcesFailed { .. } => "all_failed",
        }
    }
}

/// Pulls and streams register data from peers.
pub struct ReplicationService {
    config: ReplicationConfig,
    catalog: Arc<AdvertisementCatalog>,
    cache: Arc<RegisterCache>,
    peers: Arc<PeerHealth>,
    directory: Arc<dyn PeerDirectory>,
    transport: Arc<dyn PeerTransport>,
}

impl ReplicationService {
    pub fn new(
        config: ReplicationConfig,
        catalog: Arc<AdvertisementCatalog>,
        cache: Arc<RegisterCache>,
        peers: Arc<PeerHealth>,
        directory: Arc<dyn PeerDirectory>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            config,
            catalog,
            cache,
            peers,
            directory,
            transport,
        }
    }

    /// Order usable sources for an attempt.
    fn rank(&self, sources: Vec<(String, PeerRegisterInfo)>) -> Vec<(String, PeerRegisterInfo)> {
        let mut ranked: Vec<(Option<Duration>, String, PeerRegisterInfo)> = sources
            .into_iter()
            .filter(|(peer_id, _)| {
                let usable = self.peers.is_available(peer_id);
                if !usable {
                    debug!(peer_id = %peer_id, "Skipping unavailable source peer");
                }
                usable
            })
            .map(|(peer_id, info)| {
                let latency = self.directory.get_peer(&peer_id).and_then(|p| p.latency);
                (latency, peer_id, info)
            })
            .collect();

        ranked.sort_by(|a, b| {
            let by_latency = match (a.0, b.0) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            };
            by_latency
                .then_with(|| b.2.latest_version.cmp(&a.2.latest_version))
                .then_with(|| a.1.cmp(&b.1))
        });
        ranked.into_iter().map(|(_, peer_id, info)| (peer_id, info)).collect()
    }

    /// Visibility for this node's advertisement of `register_id`: the
    /// existing flag if already advertised, otherwise the configured default.
    fn local_visibility(&self, register_id: &str) -> bool {
        self.catalog
            .get_advertisement(register_id)
            .map_or(self.config.advertise_public, |ad| ad.is_public)
    }

    /// Forget everything held locally for `register_id`: its advertisement
    /// and cached data.
    pub async fn discard_register(&self, register_id: &str) -> Result<()> {
        self.catalog.remove_advertisement(register_id).await?;
        self.cache.remove_register(register_id);
        Ok(())
    }

    /// Full-replica sources for `register_id`, best first.
    pub fn full_replica_candidates(&self, register_id: &str) -> Vec<String> {
        self.rank(self.catalog.full_replica_sources(register_id))
            .into_iter()
            .map(|(peer_id, _)| peer_id)
            .collect()
    }

    /// Pull the complete history of a register from the best available peer.
    ///
    /// Only cancellation and an empty register id are returned as errors.
    pub async fn pull_full_replica(
        &self,
        subscription: &mut RegisterSubscription,
        cancel: &CancellationToken,
    ) -> Result<PullOutcome> {
        let register_id = subscription.register_id.clone();
        ReplicationError::require_id("register id", &register_id)?;
        let started = Instant::now();
        subscription.last_attempt_at = Some(Utc::now());

        let sources = self.catalog.full_replica_sources(&register_id);
        if sources.is_empty() {
            debug!(register_id = %register_id, "No peer advertises a full replica");
            metrics::record_pull(&register_id, "no_source_peers", started.elapsed());
            return Ok(PullOutcome::NoSourcePeers);
        }

        let candidates = self.rank(sources);
        let timeout = self.config.pull_timeout_duration();
        let mut attempts = 0;

        for (peer_id, _) in candidates {
            if cancel.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
            attempts += 1;

            let expected = register_id.clone();
            let fetch = self.transport.fetch_register(&peer_id, &register_id);
            let attempt = async move {
                let snapshot = fetch.await?;
                if snapshot.register_id != expected {
                    return Err(NetworkError::new(format!(
                        "snapshot is for register '{}', expected '{}'",
                        snapshot.register_id, expected
                    )));
                }
                Ok(snapshot)
            };

            match self.peers.call(&peer_id, "pull", timeout, cancel, attempt).await {
                Ok(snapshot) => {
                    // Unsubscribed while the fetch was in flight: write nothing
                    if cancel.is_cancelled() {
                        return Err(ReplicationError::Cancelled);
                    }
                    let applied = self.cache.apply_snapshot(&snapshot);
                    let (latest, latest_docket) = self
                        .cache
                        .latest_versions(&register_id)
                        .unwrap_or((snapshot.latest_version(), snapshot.latest_docket_version()));

                    self.catalog
                        .advertise_register(
                            &register_id,
                            RegisterSyncState::FullyReplicated,
                            latest,
                            latest_docket,
                            self.local_visibility(&register_id),
                        )
                        .await?;
                    subscription.mark_synced(RegisterSyncState::FullyReplicated, applied as u64);

                    info!(
                        register_id = %register_id,
                        peer_id = %peer_id,
                        transactions = applied,
                        latest_version = latest,
                        "Pulled full replica"
                    );
                    metrics::record_transactions_replicated(&register_id, applied);
                    metrics::record_pull(&register_id, "success", started.elapsed());
                    return Ok(PullOutcome::Success {
                        peer_id,
                        transactions: applied,
                        latest_version: latest,
                    });
                }
                Err(ReplicationError::Cancelled) => return Err(ReplicationError::Cancelled),
                Err(e) => {
                    warn!(
                        register_id = %register_id,
                        peer_id = %peer_id,
                        error = %e,
                        "Full replica pull failed, trying next source"
                    );
                }
            }
        }

        subscription.mark_failed(ALL_SOURCES_FAILED);
        warn!(register_id = %register_id, attempts, failures = subscription.consecutive_failures, "All source peers failed");
        metrics::record_pull(&register_id, "all_failed", started.elapsed());
        Ok(PullOutcome::AllSourcesFailed { attempts })
    }

    /// Open a forward-only feed for `subscription` from the best available peer.
    ///
    /// The feed runs until its stream ends, it fails, or `cancel` fires.
    pub async fn subscribe_to_live_transactions(
        &self,
        subscription: &mut RegisterSubscription,
        cancel: &CancellationToken,
    ) -> Result<FeedOutcome> {
        let register_id = subscription.register_id.clone();
        ReplicationError::require_id("register id", &register_id)?;
        subscription.last_attempt_at = Some(Utc::now());

        let sources: Vec<_> = self
            .catalog
            .sources(&register_id)
            .into_iter()
            .filter(|(_, info)| info.sync_state != RegisterSyncState::Failed)
            .collect();
        if sources.is_empty() {
            debug!(register_id = %register_id, "No peer advertises register for live feed");
            metrics::record_live_feed(&register_id, "no_source_peers");
            return Ok(FeedOutcome::NoSourcePeers);
        }

        let timeout = self.config.stream_open_timeout_duration();
        let local_latest = self.cache.latest_versions(&register_id);
        let mut attempts = 0;

        for (peer_id, info) in self.rank(sources) {
            if cancel.is_cancelled() {
                return Err(ReplicationError::Cancelled);
            }
            attempts += 1;

            // Forward-only: start at what we hold, or at the source's head.
            let (from_version, from_docket) = local_latest.unwrap_or((info.latest_version, info.latest_docket_version));
            let open = self
                .transport
                .open_transaction_stream(&peer_id, &register_id, from_version);

            match self.peers.call(&peer_id, "open_stream", timeout, cancel, open).await {
                Ok(stream) => {
                    if cancel.is_cancelled() {
                        return Err(ReplicationError::Cancelled);
                    }
                    self.catalog
                        .advertise_register(
                            &register_id,
                            RegisterSyncState::Active,
                            from_version,
                            from_docket,
                            self.local_visibility(&register_id),
                        )
                        .await?;
                    subscription.mark_synced(RegisterSyncState::Active, 0);
                    info!(register_id = %register_id, peer_id = %peer_id, from_version, "Live feed opened");
                    metrics::record_live_feed(&register_id, "started");
                    let handle = self.spawn_feed(register_id, peer_id, stream, cancel.child_token());
                    return Ok(FeedOutcome::Started(handle));
                }
                Err(ReplicationError::Cancelled) => return Err(ReplicationError::Cancelled),
                Err(e) => {
                    warn!(
                        register_id = %register_id,
                        peer_id = %peer_id,
                        error = %e,
                        "Opening live feed failed, trying next source"
                    );
                }
            }
        }

        subscription.mark_failed(ALL_SOURCES_FAILED);
        metrics::record_live_feed(&register_id, "all_failed");
        Ok(FeedOutcome::AllSourcesFailed { attempts })
    }

    fn spawn_feed(
        &self,
        register_id: String,
        peer_id: String,
        stream: TransactionStream,
        cancel: CancellationToken,
    ) -> LiveFeedHandle {
        let received = Arc::new(AtomicU64::new(0));
        let feed = LiveFeed {
            register_id: register_id.clone(),
            peer_id: peer_id.clone(),
            cache: Arc::clone(&self.cache),
            catalog: Arc::clone(&self.catalog),
            peers: Arc::clone(&self.peers),
            received: Arc::clone(&received),
        };
        let span = tracing::info_span!("live_feed", register_id = %register_id, peer_id = %peer_id);
        let task = tokio::spawn(feed.run(stream, cancel.clone()).instrument(span));

        LiveFeedHandle {
            register_id,
            peer_id,
            cancel,
            received,
            task,
        }
    }
}

struct LiveFeed {
    register_id: String,
    peer_id: String,
    cache: Arc<RegisterCache>,
    catalog: Arc<AdvertisementCatalog>,
    peers: Arc<PeerHealth>,
    received: Arc<AtomicU64>,
}

impl LiveFeed {
    async fn run(self, mut stream: TransactionStream, cancel: CancellationToken) -> FeedSummary {
        let end = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break FeedEnd::Stopped,

                item = stream.next() => match item {
                    None => break FeedEnd::StreamEnded,
                    Some(Err(e)) => {
                        self.peers.breaker(&self.peer_id).record_failure();
                        break FeedEnd::Failed(e.0);
                    }
                    Some(Ok(tx)) => {
                        if tx.register_id != self.register_id {
                            warn!(got = %tx.register_id, "Dropping transaction for another register");
                            continue;
                        }
                        self.cache.add_transaction(tx);
                        self.received.fetch_add(1, Ordering::Relaxed);
                        self.peers.record_heartbeat(&self.peer_id);
                        metrics::record_transactions_replicated(&self.register_id, 1);

                        if let Some((latest, latest_docket)) = self.cache.latest_versions(&self.register_id) {
                            if let Err(e) = self
                                .catalog
                                .update_register_version(&self.register_id, latest, latest_docket)
                                .await
                            {
                                warn!(error = %e, "Failed to bump advertised version");
                            }
                        }
                    }
                },
            }
        };

        let transactions = self.received.load(Ordering::Relaxed);
        match &end {
            FeedEnd::Stopped => debug!(transactions, "Live feed stopped"),
            FeedEnd::StreamEnded => info!(transactions, "Live feed ended by peer"),
            FeedEnd::Failed(reason) => warn!(transactions, reason = %reason, "Live feed failed"),
        }
        metrics::record_live_feed(
            &self.register_id,
            match end {
                FeedEnd::Stopped => "stopped",
                FeedEnd::StreamEnded => "ended",
                FeedEnd::Failed(_) => "failed",
            },
        );

        FeedSummary {
            register_id: self.register_id,
            peer_id: self.peer_id,
            transactions,
            end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::MemoryAdvertisementStore;
    use crate::config::{CacheConfig, PeerHealthConfig};
    use crate::network::{BoxFuture, PeerInfo, StaticPeerDirectory};
    use crate::types::{CachedTransaction, RegisterSnapshot, ReplicationMode, TransactionNotification};
    use dashmap::DashMap;
    use parking_lot::Mutex;

    #[derive(Clone)]
    enum Reply {
        Snapshot(RegisterSnapshot),
        Fail,
        Hang,
        Stream(Vec<CachedTransaction>),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        replies: DashMap<String, Reply>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        fn reply(&self, peer_id: &str) -> Reply {
            self.calls.lock().push(peer_id.to_string());
            self.replies.get(peer_id).map(|r| r.clone()).unwrap_or(Reply::Fail)
        }
    }

    impl PeerTransport for ScriptedTransport {
        fn send_notification(&self, _: &str, _: &TransactionNotification) -> BoxFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn fetch_register(&self, peer_id: &str, _: &str) -> BoxFuture<'_, RegisterSnapshot> {
            let reply = self.reply(peer_id);
            Box::pin(async move {
                match reply {
                    Reply::Snapshot(s) => Ok(s),
                    Reply::Hang => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Err(NetworkError::new("hung"))
                    }
                    _ => Err(NetworkError::new("refused")),
                }
            })
        }

        fn open_transaction_stream(&self, peer_id: &str, _: &str, _: u64) -> BoxFuture<'_, TransactionStream> {
            let reply = self.reply(peer_id);
            Box::pin(async move {
                match reply {
                    Reply::Stream(txs) => Ok(futures::stream::iter(txs.into_iter().map(Ok::<_, NetworkError>)).boxed()),
                    _ => Err(NetworkError::new("refused")),
                }
            })
        }

        fn fetch_advertisements(&self, _: &str) -> BoxFuture<'_, Vec<PeerRegisterInfo>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    struct Fixture {
        service: ReplicationService,
        catalog: Arc<AdvertisementCatalog>,
        cache: Arc<RegisterCache>,
        directory: Arc<StaticPeerDirectory>,
        transport: Arc<ScriptedTransport>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(StaticPeerDirectory::new());
        let catalog = Arc::new(AdvertisementCatalog::new(
            "local",
            directory.clone(),
            Arc::new(MemoryAdvertisementStore::new()),
        ));
        let cache = Arc::new(RegisterCache::new(&CacheConfig::default()));
        let peers = Arc::new(PeerHealth::new(&PeerHealthConfig::default()));
        let transport = Arc::new(ScriptedTransport::default());
        let service = ReplicationService::new(
            ReplicationConfig::default(),
            catalog.clone(),
            cache.clone(),
            peers,
            directory.clone(),
            transport.clone(),
        );
        Fixture {
            service,
            catalog,
            cache,
            directory,
            transport,
        }
    }

    fn snapshot(register_id: &str, versions: u64) -> RegisterSnapshot {
        RegisterSnapshot {
            register_id: register_id.to_string(),
            transactions: (1..=versions)
                .map(|v| CachedTransaction::new(format!("tx-{}", v), register_id, v, vec![v as u8]))
                .collect(),
            dockets: Vec::new(),
        }
    }

    async fn advertise(f: &Fixture, peer: &str, state: RegisterSyncState, version: u64) {
        f.catalog
            .process_remote_advertisements(peer, vec![PeerRegisterInfo::new("reg-1", state, version, 0, true)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_source_peers_leaves_failures_alone() {
        let f = fixture();
        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        let outcome = f.service.pull_full_replica(&mut sub, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, PullOutcome::NoSourcePeers);
        assert!(outcome.message().contains("No source peers"));
        assert_eq!(sub.consecutive_failures, 0);
        assert!(sub.error_message.is_none());
    }

    #[tokio::test]
    async fn test_pull_success_updates_everything() {
        let f = fixture();
        advertise(&f, "peer-1", RegisterSyncState::FullyReplicated, 3).await;
        f.transport.replies.insert("peer-1".into(), Reply::Snapshot(snapshot("reg-1", 3)));

        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        sub.consecutive_failures = 2;
        let outcome = f.service.pull_full_replica(&mut sub, &CancellationToken::new()).await.unwrap();

        assert_eq!(
            outcome,
            PullOutcome::Success {
                peer_id: "peer-1".into(),
                transactions: 3,
                latest_version: 3
            }
        );
        assert_eq!(sub.sync_state, RegisterSyncState::FullyReplicated);
        assert_eq!(sub.consecutive_failures, 0);
        assert_eq!(sub.total_transactions_synced, 3);
        assert_eq!(f.cache.get_transactions("reg-1").len(), 3);

        let ad = f.catalog.get_advertisement("reg-1").unwrap();
        assert_eq!(ad.sync_state, RegisterSyncState::FullyReplicated);
        assert_eq!(ad.latest_version, 3);
    }

    #[tokio::test]
    async fn test_pull_keeps_local_visibility() {
        let f = fixture();
        advertise(&f, "peer-1", RegisterSyncState::FullyReplicated, 3).await;
        f.transport.replies.insert("peer-1".into(), Reply::Snapshot(snapshot("reg-1", 3)));
        f.catalog
            .advertise_register("reg-1", RegisterSyncState::Subscribing, 0, 0, false)
            .await
            .unwrap();

        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        f.service.pull_full_replica(&mut sub, &CancellationToken::new()).await.unwrap();

        // The source advertises publicly; that must not leak into ours
        let ad = f.catalog.get_advertisement("reg-1").unwrap();
        assert_eq!(ad.sync_state, RegisterSyncState::FullyReplicated);
        assert!(!ad.is_public);
    }

    #[tokio::test]
    async fn test_discard_register() {
        let f = fixture();
        advertise(&f, "peer-1", RegisterSyncState::FullyReplicated, 3).await;
        f.transport.replies.insert("peer-1".into(), Reply::Snapshot(snapshot("reg-1", 3)));
        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        f.service.pull_full_replica(&mut sub, &CancellationToken::new()).await.unwrap();
        assert!(f.catalog.get_advertisement("reg-1").unwrap().is_public);

        f.service.discard_register("reg-1").await.unwrap();
        assert!(f.catalog.get_advertisement("reg-1").is_none());
        assert!(!f.cache.contains_register("reg-1"));
    }

    #[tokio::test]
    async fn test_pull_falls_through_to_next_source() {
        let f = fixture();
        advertise(&f, "peer-a", RegisterSyncState::FullyReplicated, 9).await;
        advertise(&f, "peer-b", RegisterSyncState::FullyReplicated, 5).await;
        f.transport.replies.insert("peer-a".into(), Reply::Fail);
        f.transport.replies.insert("peer-b".into(), Reply::Snapshot(snapshot("reg-1", 5)));

        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        let outcome = f.service.pull_full_replica(&mut sub, &CancellationToken::new()).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(*f.transport.calls.lock(), vec!["peer-a", "peer-b"]);
    }

    #[tokio::test]
    async fn test_all_sources_failed_bumps_failures() {
        let f = fixture();
        advertise(&f, "peer-1", RegisterSyncState::FullyReplicated, 3).await;
        advertise(&f, "peer-2", RegisterSyncState::FullyReplicated, 3).await;

        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        let outcome = f.service.pull_full_replica(&mut sub, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome, PullOutcome::AllSourcesFailed { attempts: 2 });
        assert_eq!(sub.consecutive_failures, 1);
        assert_eq!(sub.error_message.as_deref(), Some(ALL_SOURCES_FAILED));
        assert_eq!(sub.sync_state, RegisterSyncState::Subscribing);
    }

    #[tokio::test]
    async fn test_mismatched_snapshot_is_a_failure() {
        let f = fixture();
        advertise(&f, "peer-1", RegisterSyncState::FullyReplicated, 3).await;
        f.transport.replies.insert("peer-1".into(), Reply::Snapshot(snapshot("reg-other", 3)));

        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        let outcome = f.service.pull_full_replica(&mut sub, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, PullOutcome::AllSourcesFailed { attempts: 1 });
        assert!(!f.cache.contains_register("reg-1"));
    }

    #[tokio::test]
    async fn test_candidates_ranked_by_latency_then_version() {
        let f = fixture();
        f.directory
            .add_peer(PeerInfo::new("peer-slow").with_latency(Duration::from_millis(200)));
        f.directory
            .add_peer(PeerInfo::new("peer-fast").with_latency(Duration::from_millis(10)));
        f.directory.add_peer(PeerInfo::new("peer-unknown-new"));
        f.directory.add_peer(PeerInfo::new("peer-unknown-old"));
        advertise(&f, "peer-slow", RegisterSyncState::FullyReplicated, 50).await;
        advertise(&f, "peer-fast", RegisterSyncState::FullyReplicated, 10).await;
        advertise(&f, "peer-unknown-new", RegisterSyncState::FullyReplicated, 90).await;
        advertise(&f, "peer-unknown-old", RegisterSyncState::FullyReplicated, 20).await;
        advertise(&f, "peer-active", RegisterSyncState::Active, 99).await;

        assert_eq!(
            f.service.full_replica_candidates("reg-1"),
            vec!["peer-fast", "peer-slow", "peer-unknown-new", "peer-unknown-old"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pull_cancellation() {
        let f = fixture();
        advertise(&f, "peer-1", RegisterSyncState::FullyReplicated, 3).await;
        f.transport.replies.insert("peer-1".into(), Reply::Hang);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        let err = f.service.pull_full_replica(&mut sub, &cancel).await.unwrap_err();
        assert!(matches!(err, ReplicationError::Cancelled));
        assert_eq!(sub.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_live_feed_without_peers_is_not_an_error() {
        let f = fixture();
        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::ForwardOnly);
        let outcome = f
            .service
            .subscribe_to_live_transactions(&mut sub, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FeedOutcome::NoSourcePeers));
        assert_eq!(sub.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_live_feed_fills_cache_and_bumps_version() {
        let f = fixture();
        advertise(&f, "peer-1", RegisterSyncState::Active, 10).await;
        let txs = (11..=13)
            .map(|v| CachedTransaction::new(format!("tx-{}", v), "reg-1", v, vec![1]))
            .chain(std::iter::once(CachedTransaction::new("stray", "reg-2", 99, vec![])))
            .collect();
        f.transport.replies.insert("peer-1".into(), Reply::Stream(txs));

        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::ForwardOnly);
        let outcome = f
            .service
            .subscribe_to_live_transactions(&mut sub, &CancellationToken::new())
            .await
            .unwrap();
        let FeedOutcome::Started(handle) = outcome else {
            panic!("expected feed to start");
        };
        assert_eq!(sub.sync_state, RegisterSyncState::Active);
        assert_eq!(handle.peer_id(), "peer-1");

        let summary = handle.join().await;
        assert_eq!(summary.end, FeedEnd::StreamEnded);
        assert_eq!(summary.transactions, 3);
        assert_eq!(f.cache.get_transactions("reg-1").len(), 3);
        assert!(!f.cache.contains_register("reg-2"));
        assert_eq!(f.catalog.get_advertisement("reg-1").unwrap().latest_version, 13);
    }

    #[tokio::test]
    async fn test_live_feed_stop() {
        let f = fixture();
        advertise(&f, "peer-1", RegisterSyncState::Active, 0).await;
        let pending = futures::stream::pending::<crate::network::NetworkResult<CachedTransaction>>().boxed();
        let handle = f
            .service
            .spawn_feed("reg-1".into(), "peer-1".into(), pending, CancellationToken::new());
        assert!(!handle.is_finished());
        handle.stop();
        let summary = handle.join().await;
        assert_eq!(summary.end, FeedEnd::Stopped);
        assert_eq!(summary.transactions, 0);
    }
}
