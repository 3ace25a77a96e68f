// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication node coordinator.
//!
//! The orchestrator that ties together:
//! - Gossip dissemination via [`crate::gossip::GossipEngine`]
//! - Per-peer breakers and heartbeats via [`crate::peer::PeerHealth`]
//! - The register catalog via [`crate::catalog::AdvertisementCatalog`]
//! - Pull and live-feed replication via [`crate::replication::ReplicationService`]
//! - Durable subscriptions via [`crate::scheduler::SyncScheduler`]
//!
//! # Architecture
//!
//! The node manages the replication lifecycle:
//! 1. Opens the subscription store and (optionally) the Redis advertisement store
//! 2. Rehydrates the catalog and restores subscriptions
//! 3. Handles inbound gossip and relays it to a random fanout of peers
//! 4. Periodically runs maintenance (seen-set GC, lease refresh, failover sweep)
//! 5. Handles graceful shutdown, stopping live feeds and persisting progress

mod gossip_path;
mod maintenance;
mod types;

#[cfg(test)]
mod testing;

pub use types::{ExchangeReport, GossipOutcome, HealthCheck, MaintenanceReport, NodeState, RelayReport};

use crate::cache::RegisterCache;
use crate::catalog::store::{AdvertisementKeys, MemoryAdvertisementStore, RedisAdvertisementStore};
use crate::catalog::AdvertisementCatalog;
use crate::config::NodeConfig;
use crate::error::{ReplicationError, Result};
use crate::gossip::GossipEngine;
use crate::metrics;
use crate::network::{PeerDirectory, PeerTransport};
use crate::peer::PeerHealth;
use crate::replication::ReplicationService;
use crate::resilience::{RateLimiter, RetryConfig};
use crate::scheduler::SyncScheduler;
use crate::subscription_store::SubscriptionStore;
use crate::types::{
    NetworkRegisterSummary, RegisterSubscription, RegisterSyncState, ReplicationMode, TransactionNotification,
};
use maintenance::MaintenanceContext;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

/// One ledger node's replication subsystem.
///
/// The daemon supplies the peer layer ([`PeerDirectory`], [`PeerTransport`])
/// and feeds inbound gossip through [`handle_gossip`](Self::handle_gossip).
/// Everything else (catalog, cache, subscriptions) is owned here.
///
/// Gossip can be handled as soon as the node is created. Subscriptions need
/// [`start()`](Self::start), which opens the SQLite store.
pub struct ReplicationNode {
    config: NodeConfig,

    /// Node state (broadcast to watchers)
    state_tx: watch::Sender<NodeState>,
    state_rx: watch::Receiver<NodeState>,

    directory: Arc<dyn PeerDirectory>,
    transport: Arc<dyn PeerTransport>,

    gossip: Arc<GossipEngine>,
    peers: Arc<PeerHealth>,
    cache: Arc<RegisterCache>,
    catalog: Arc<AdvertisementCatalog>,
    replication: Arc<ReplicationService>,

    /// Present once started.
    scheduler: RwLock<Option<Arc<SyncScheduler>>>,

    /// Shared across all outbound gossip sends.
    rate_limiter: Option<RateLimiter>,

    /// Accepted notifications, for local consumers.
    notifications: broadcast::Sender<TransactionNotification>,

    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationNode {
    /// Create a node in `Created` state.
    ///
    /// The catalog starts on an in-memory store; [`start()`](Self::start)
    /// swaps in Redis when `catalog.redis_url` is configured.
    pub fn new(
        config: NodeConfig,
        directory: Arc<dyn PeerDirectory>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);

        let gossip = Arc::new(GossipEngine::new(&config.gossip));
        let peers = Arc::new(PeerHealth::new(&config.peer_health));
        let cache = Arc::new(RegisterCache::new(&config.cache));
        let catalog = Arc::new(AdvertisementCatalog::new(
            config.local_node_id.clone(),
            Arc::clone(&directory),
            Arc::new(MemoryAdvertisementStore::new()),
        ));
        let replication = Arc::new(ReplicationService::new(
            config.replication.clone(),
            Arc::clone(&catalog),
            Arc::clone(&cache),
            Arc::clone(&peers),
            Arc::clone(&directory),
            Arc::clone(&transport),
        ));

        let rate_limiter = config.gossip.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for gossip relay"
            );
            RateLimiter::new(cfg)
        });

        Self {
            config,
            state_tx,
            state_rx,
            directory,
            transport,
            gossip,
            peers,
            cache,
            catalog,
            replication,
            scheduler: RwLock::new(None),
            rate_limiter,
            notifications,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.config.local_node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Get current node state.
    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), NodeState::Running)
    }

    fn set_state(&self, state: NodeState) {
        let _ = self.state_tx.send(state);
        metrics::set_node_state(&state.to_string());
    }

    fn fail_start(&self, e: ReplicationError) -> ReplicationError {
        error!(error = %e, "Replication node failed to start");
        metrics::record_error("node", "start");
        self.set_state(NodeState::Failed);
        e
    }

    pub fn gossip(&self) -> &Arc<GossipEngine> {
        &self.gossip
    }

    pub fn peer_health(&self) -> &Arc<PeerHealth> {
        &self.peers
    }

    pub fn cache(&self) -> &Arc<RegisterCache> {
        &self.cache
    }

    pub fn catalog(&self) -> &Arc<AdvertisementCatalog> {
        &self.catalog
    }

    pub fn replication(&self) -> &Arc<ReplicationService> {
        &self.replication
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    /// The subscription scheduler, once started.
    pub fn scheduler(&self) -> Option<Arc<SyncScheduler>> {
        self.scheduler.read().clone()
    }

    fn running_scheduler(&self) -> Result<Arc<SyncScheduler>> {
        self.scheduler().ok_or_else(|| ReplicationError::InvalidState {
            expected: "Running".to_string(),
            actual: self.state().to_string(),
        })
    }

    /// Receive every notification this node accepts as new.
    pub fn subscribe_transactions(&self) -> broadcast::Receiver<TransactionNotification> {
        self.notifications.subscribe()
    }

    /// Get a health snapshot for monitoring endpoints.
    ///
    /// Performs no I/O. `ready` means subscriptions are being served;
    /// `healthy` additionally requires the advertisement store to be
    /// reachable.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let catalog = self.catalog.stats();
        let known = self.directory.healthy_peers();
        let peers_available = known
            .iter()
            .filter(|p| self.peers.is_available(&p.peer_id))
            .count();
        let subscriptions = self
            .scheduler()
            .map(|s| s.stats())
            .unwrap_or_default();

        let ready = state == NodeState::Running;
        let healthy = ready && !catalog.degraded;

        HealthCheck {
            local_node_id: self.config.local_node_id.clone(),
            state,
            ready,
            healthy,
            peers_known: known.len(),
            peers_available,
            peers_circuit_open: self.peers.open_circuits(),
            peers: self.peers.snapshot(),
            catalog,
            gossip: self.gossip.stats(),
            cache: self.cache.stats(),
            subscriptions,
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the node.
    ///
    /// 1. Opens the subscription store (SQLite)
    /// 2. Connects the advertisement store (Redis, best-effort)
    /// 3. Rehydrates the catalog
    /// 4. Restores subscriptions and spawns the scheduler
    /// 5. Spawns the maintenance task (if enabled)
    pub async fn start(&self) -> Result<()> {
        let mut actual = NodeState::Created;
        let claimed = self.state_tx.send_if_modified(|state| {
            if *state == NodeState::Created {
                *state = NodeState::Starting;
                true
            } else {
                actual = *state;
                false
            }
        });
        if !claimed {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: actual.to_string(),
            });
        }
        metrics::set_node_state("Starting");

        info!(node_id = %self.config.local_node_id, "Starting replication node");

        let store = match SubscriptionStore::open(&self.config.subscriptions).await {
            Ok(store) => Arc::new(store),
            Err(e) => return Err(self.fail_start(e)),
        };
        info!(path = %store.path(), "Subscription store initialized");

        if let Some(url) = &self.config.catalog.redis_url {
            let catalog_cfg = &self.config.catalog;
            let retry = RetryConfig::startup(catalog_cfg.connect_timeout_duration());
            match RedisAdvertisementStore::connect(
                url,
                AdvertisementKeys::new(catalog_cfg.key_prefix.clone()),
                catalog_cfg.index_ttl(),
                &retry,
            )
            .await
            {
                Ok(redis) => self.catalog.attach_store(Arc::new(redis)),
                Err(e) => {
                    metrics::record_error("node", "advertisement_store_connect");
                    warn!(error = %e, "Advertisement store unavailable, keeping catalog in memory");
                }
            }
        }

        let rehydrated = self.catalog.initialize().await;

        let scheduler = Arc::new(SyncScheduler::new(
            self.config.scheduler.clone(),
            Arc::clone(&self.replication),
            store,
        ));
        let restored = match scheduler.start().await {
            Ok(restored) => restored,
            Err(e) => return Err(self.fail_start(e)),
        };
        *self.scheduler.write() = Some(scheduler);

        if self.config.maintenance.enabled {
            let handle = tokio::spawn(maintenance::run_maintenance(
                self.maintenance_context(),
                self.config.maintenance.interval(),
                self.cancel.child_token(),
            ));
            self.tasks.lock().push(handle);
            info!("Spawned maintenance task");
        }

        self.set_state(NodeState::Running);
        info!(
            local_advertisements = rehydrated.local,
            remote_peers = rehydrated.remote_peers,
            subscriptions = restored,
            "Replication node running"
        );
        Ok(())
    }

    /// Shut the node down gracefully.
    ///
    /// 1. Signal background tasks to stop
    /// 2. Wait for them to finish (with timeout)
    /// 3. Stop live feeds, persist subscription progress, close SQLite
    pub async fn shutdown(&self) {
        if matches!(self.state(), NodeState::ShuttingDown | NodeState::Stopped) {
            return;
        }
        info!("Shutting down replication node");
        self.set_state(NodeState::ShuttingDown);

        self.cancel.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        let task_count = handles.len();
        if task_count > 0 {
            info!(task_count, "Waiting for tasks to complete");
        }
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        let scheduler = self.scheduler.write().take();
        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        self.set_state(NodeState::Stopped);
        info!("Replication node stopped");
    }

    fn maintenance_context(&self) -> MaintenanceContext {
        MaintenanceContext {
            gossip: Arc::clone(&self.gossip),
            catalog: Arc::clone(&self.catalog),
            peers: Arc::clone(&self.peers),
            directory: Arc::clone(&self.directory),
            gossip_max_age: self.config.gossip.state_max_age_duration(),
            remote_max_age: self.config.catalog.index_ttl(),
        }
    }

    /// Run one maintenance pass now, outside the periodic task.
    pub async fn run_maintenance_now(&self) -> MaintenanceReport {
        maintenance::maintenance_cycle(&self.maintenance_context()).await
    }

    // =========================================================================
    // Subscriptions and advertisements
    // =========================================================================

    pub async fn subscribe_to_register(
        &self,
        register_id: &str,
        mode: ReplicationMode,
    ) -> Result<RegisterSubscription> {
        self.running_scheduler()?
            .subscribe_to_register(register_id, mode)
            .await
    }

    /// Drop a subscription along with its advertisement and cached data.
    pub async fn unsubscribe_from_register(&self, register_id: &str) -> Result<bool> {
        let removed = self.running_scheduler()?.unsubscribe_from_register(register_id).await?;
        if removed {
            self.replication.discard_register(register_id).await?;
        }
        Ok(removed)
    }

    /// All subscriptions, sorted by register id. Empty until started.
    pub fn get_subscriptions(&self) -> Vec<RegisterSubscription> {
        self.scheduler()
            .map(|s| s.get_subscriptions())
            .unwrap_or_default()
    }

    pub fn get_subscription(&self, register_id: &str) -> Option<RegisterSubscription> {
        self.scheduler()?.get_subscription(register_id)
    }

    pub async fn advertise_register(
        &self,
        register_id: &str,
        sync_state: RegisterSyncState,
        latest_version: u64,
        latest_docket_version: u64,
        is_public: bool,
    ) -> Result<bool> {
        self.catalog
            .advertise_register(register_id, sync_state, latest_version, latest_docket_version, is_public)
            .await
    }

    pub fn get_network_advertised_registers(&self) -> Vec<NetworkRegisterSummary> {
        self.catalog.get_network_advertised_registers()
    }

    /// Pull a peer's advertisements, merge them, and make every subscribed
    /// register the peer is ahead on due immediately.
    pub async fn exchange_advertisements(
        &self,
        peer_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExchangeReport> {
        ReplicationError::require_id("peer id", peer_id)?;

        let fetch = self.transport.fetch_advertisements(peer_id);
        let infos = self
            .peers
            .call(
                peer_id,
                "advertisements",
                self.config.replication.exchange_timeout_duration(),
                cancel,
                fetch,
            )
            .await?;

        let remote_versions: HashMap<String, u64> = infos
            .iter()
            .map(|info| (info.register_id.clone(), info.latest_version))
            .collect();
        let advertisements = self
            .catalog
            .process_remote_advertisements(peer_id, infos)
            .await?;
        let lagging = self.catalog.detect_version_lag(&remote_versions);

        let triggered: Vec<String> = match self.scheduler() {
            Some(scheduler) => lagging
                .iter()
                .filter(|register_id| scheduler.trigger_now(register_id))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        debug!(
            peer_id = %peer_id,
            advertisements,
            lagging = lagging.len(),
            triggered = triggered.len(),
            "Advertisement exchange complete"
        );
        Ok(ExchangeReport {
            peer_id: peer_id.to_string(),
            advertisements,
            lagging,
            triggered,
        })
    }
}
