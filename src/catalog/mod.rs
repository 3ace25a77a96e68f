// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Register advertisement catalog.
//!
//! Tracks which registers this node holds (local advertisements) and which
//! registers every known peer claims to hold (remote advertisements).
//!
//! # Consistency
//!
//! The in-memory maps are authoritative for reads. Every mutation is written
//! through to an [`AdvertisementStore`]; a store failure is logged, flips the
//! catalog into degraded mode and is otherwise swallowed. The next successful
//! store call clears the flag. On startup [`AdvertisementCatalog::initialize`]
//! rehydrates both maps from the store.
//!
//! # Timestamps
//!
//! `LastUpdated` only moves when an advertisement actually changes, and it
//! always moves forward: if the wall clock has not advanced past the previous
//! value, the new value is the previous one plus a microsecond.

pub mod store;

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::network::PeerDirectory;
use crate::types::{
    LocalRegisterAdvertisement, NetworkRegisterSummary, PeerRegisterInfo, RegisterSyncState,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use store::AdvertisementStore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What rehydration found in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RehydrateStats {
    pub local: usize,
    pub remote_peers: usize,
    pub remote_registers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogStats {
    pub local_registers: usize,
    pub remote_peers: usize,
    pub degraded: bool,
    pub store: &'static str,
}

#[derive(Debug, Clone)]
struct RemotePeer {
    registers: HashMap<String, PeerRegisterInfo>,
    received_at: Instant,
}

/// Next `LastUpdated` value, strictly after `previous`.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if prev >= now => prev + chrono::Duration::microseconds(1),
        _ => now,
    }
}

pub struct AdvertisementCatalog {
    local_node_id: String,
    directory: Arc<dyn PeerDirectory>,
    store: RwLock<Arc<dyn AdvertisementStore>>,
    local: DashMap<String, LocalRegisterAdvertisement>,
    remote: DashMap<String, RemotePeer>,
    degraded: AtomicBool,
}

impl AdvertisementCatalog {
    pub fn new(
        local_node_id: impl Into<String>,
        directory: Arc<dyn PeerDirectory>,
        store: Arc<dyn AdvertisementStore>,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            directory,
            store: RwLock::new(store),
            local: DashMap::new(),
            remote: DashMap::new(),
            degraded: AtomicBool::new(false),
        }
    }

    fn store(&self) -> Arc<dyn AdvertisementStore> {
        Arc::clone(&self.store.read())
    }

    /// Swap in a different backing store, e.g. once Redis is reachable.
    /// Nothing is copied: call [`initialize`](Self::initialize) afterwards.
    pub fn attach_store(&self, store: Arc<dyn AdvertisementStore>) {
        info!(store = store.name(), "Advertisement store attached");
        *self.store.write() = store;
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn store_result(&self, operation: &str, result: Result<()>) {
        match result {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!(store = self.store().name(), "Advertisement store recovered");
                    metrics::set_catalog_degraded(false);
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    metrics::set_catalog_degraded(true);
                }
                metrics::record_error("catalog", "store");
                warn!(
                    store = self.store().name(),
                    operation,
                    error = %e,
                    "Advertisement store write failed, continuing in memory"
                );
            }
        }
    }

    /// Load both maps from the store. Never fails: an unreachable store
    /// leaves the catalog empty and degraded.
    pub async fn initialize(&self) -> RehydrateStats {
        let mut stats = RehydrateStats::default();

        match self.store().load_local().await {
            Ok(ads) => {
                for ad in ads {
                    if ad.register_id.trim().is_empty() {
                        continue;
                    }
                    self.local.entry(ad.register_id.clone()).or_insert(ad);
                    stats.local += 1;
                }
            }
            Err(e) => self.store_result("load_local", Err(e)),
        }

        match self.store().load_remote().await {
            Ok(peers) => {
                for (peer_id, infos) in peers {
                    if peer_id == self.local_node_id || self.directory.is_banned(&peer_id) {
                        continue;
                    }
                    stats.remote_peers += 1;
                    stats.remote_registers += infos.len();
                    let registers = infos
                        .into_iter()
                        .map(|i| (i.register_id.clone(), i.normalized()))
                        .collect();
                    self.remote.entry(peer_id).or_insert(RemotePeer {
                        registers,
                        received_at: Instant::now(),
                    });
                }
            }
            Err(e) => self.store_result("load_remote", Err(e)),
        }

        info!(
            store = self.store().name(),
            local = stats.local,
            remote_peers = stats.remote_peers,
            remote_registers = stats.remote_registers,
            degraded = self.is_degraded(),
            "Advertisement catalog rehydrated"
        );
        self.record_size();
        stats
    }

    fn record_size(&self) {
        metrics::set_catalog_size(self.local.len(), self.remote.len());
    }

    // =========================================================================
    // Local advertisements
    // =========================================================================

    /// Create or update this node's advertisement for a register.
    ///
    /// Returns `false` without touching `LastUpdated` or the store when
    /// nothing changed.
    pub async fn advertise_register(
        &self,
        register_id: &str,
        sync_state: RegisterSyncState,
        latest_version: u64,
        latest_docket_version: u64,
        is_public: bool,
    ) -> Result<bool> {
        ReplicationError::require_id("register id", register_id)?;

        let updated = {
            let mut slot = self.local.entry(register_id.to_string()).or_insert_with(|| {
                LocalRegisterAdvertisement {
                    register_id: register_id.to_string(),
                    sync_state,
                    latest_version,
                    latest_docket_version,
                    is_public,
                    last_updated: DateTime::<Utc>::MIN_UTC,
                }
            });
            let fresh = slot.last_updated == DateTime::<Utc>::MIN_UTC;
            if !fresh && !slot.differs_from(sync_state, latest_version, latest_docket_version, is_public) {
                None
            } else {
                let previous = (!fresh).then_some(slot.last_updated);
                slot.sync_state = sync_state;
                slot.latest_version = latest_version;
                slot.latest_docket_version = latest_docket_version;
                slot.is_public = is_public;
                slot.last_updated = next_timestamp(previous);
                Some(slot.clone())
            }
        };

        let Some(ad) = updated else {
            return Ok(false);
        };
        debug!(
            register_id = %register_id,
            sync_state = %ad.sync_state,
            latest_version = ad.latest_version,
            "Advertising register"
        );
        let result = self.store().save_local(&ad).await;
        self.store_result("save_local", result);
        self.record_size();
        Ok(true)
    }

    /// Move an existing advertisement's versions. Returns `false` if the
    /// register is not advertised or the versions are unchanged.
    pub async fn update_register_version(
        &self,
        register_id: &str,
        latest_version: u64,
        latest_docket_version: u64,
    ) -> Result<bool> {
        ReplicationError::require_id("register id", register_id)?;
        let updated = {
            let Some(mut slot) = self.local.get_mut(register_id) else {
                debug!(register_id = %register_id, "Version update for unadvertised register ignored");
                return Ok(false);
            };
            if slot.latest_version == latest_version && slot.latest_docket_version == latest_docket_version {
                None
            } else {
                slot.latest_version = latest_version;
                slot.latest_docket_version = latest_docket_version;
                slot.last_updated = next_timestamp(Some(slot.last_updated));
                Some(slot.clone())
            }
        };
        let Some(ad) = updated else {
            return Ok(false);
        };
        let result = self.store().save_local(&ad).await;
        self.store_result("save_local", result);
        Ok(true)
    }

    pub async fn remove_advertisement(&self, register_id: &str) -> Result<bool> {
        ReplicationError::require_id("register id", register_id)?;
        if self.local.remove(register_id).is_none() {
            return Ok(false);
        }
        let result = self.store().delete_local(register_id).await;
        self.store_result("delete_local", result);
        self.record_size();
        Ok(true)
    }

    pub fn get_advertisement(&self, register_id: &str) -> Option<LocalRegisterAdvertisement> {
        self.local.get(register_id).map(|a| a.value().clone())
    }

    /// All local advertisements, sorted by register id.
    pub fn get_local_advertisements(&self) -> Vec<LocalRegisterAdvertisement> {
        let mut ads: Vec<_> = self.local.iter().map(|a| a.value().clone()).collect();
        ads.sort_by(|a, b| a.register_id.cmp(&b.register_id));
        ads
    }

    pub fn get_public_advertisements(&self) -> Vec<LocalRegisterAdvertisement> {
        self.get_local_advertisements()
            .into_iter()
            .filter(|a| a.is_public)
            .collect()
    }

    /// What this node tells peers during an advertisement exchange.
    pub fn exchange_payload(&self) -> Vec<PeerRegisterInfo> {
        self.get_public_advertisements()
            .iter()
            .map(PeerRegisterInfo::from)
            .collect()
    }

    /// Registers where a peer reports a higher version than we hold.
    ///
    /// Registers we do not advertise are ignored. Sorted by id.
    pub fn detect_version_lag(&self, remote_versions: &HashMap<String, u64>) -> Vec<String> {
        let mut lagging: Vec<String> = remote_versions
            .iter()
            .filter(|(id, remote)| {
                self.local
                    .get(id.as_str())
                    .map(|local| **remote > local.latest_version)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        lagging.sort();
        lagging
    }

    /// Rewrite local advertisements to the store and renew their lease.
    pub async fn refresh_leases(&self) {
        let ads = self.get_local_advertisements();
        if ads.is_empty() {
            return;
        }
        let result = self.store().refresh_local(&ads).await;
        self.store_result("refresh_local", result);
    }

    // =========================================================================
    // Remote advertisements
    // =========================================================================

    /// Replace everything known about `peer_id` with `advertisements`.
    ///
    /// Banned peers and this node's own id are ignored. `CanServeFullReplica`
    /// is re-derived from each entry's state. Returns the number of entries kept.
    pub async fn process_remote_advertisements(
        &self,
        peer_id: &str,
        advertisements: Vec<PeerRegisterInfo>,
    ) -> Result<usize> {
        ReplicationError::require_id("peer id", peer_id)?;
        if peer_id == self.local_node_id {
            return Ok(0);
        }
        if self.directory.is_banned(peer_id) {
            debug!(peer_id = %peer_id, "Ignoring advertisements from banned peer");
            return Ok(0);
        }

        let mut registers = HashMap::with_capacity(advertisements.len());
        for info in advertisements {
            if info.register_id.trim().is_empty() {
                warn!(peer_id = %peer_id, "Dropping advertisement with empty register id");
                continue;
            }
            registers.insert(info.register_id.clone(), info.normalized());
        }
        let kept = registers.len();
        let infos: Vec<PeerRegisterInfo> = registers.values().cloned().collect();

        self.remote.insert(
            peer_id.to_string(),
            RemotePeer {
                registers,
                received_at: Instant::now(),
            },
        );
        metrics::record_advertisements_received(peer_id, kept);

        let result = self.store().save_remote(peer_id, &infos).await;
        self.store_result("save_remote", result);
        self.record_size();
        Ok(kept)
    }

    pub fn get_peer_advertisements(&self, peer_id: &str) -> Vec<PeerRegisterInfo> {
        let mut infos: Vec<_> = self
            .remote
            .get(peer_id)
            .map(|p| p.registers.values().cloned().collect())
            .unwrap_or_default();
        infos.sort_by(|a: &PeerRegisterInfo, b| a.register_id.cmp(&b.register_id));
        infos
    }

    pub fn known_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.remote.iter().map(|p| p.key().clone()).collect();
        peers.sort();
        peers
    }

    /// Non-banned peers advertising `register_id`, with what they advertise.
    pub fn sources(&self, register_id: &str) -> Vec<(String, PeerRegisterInfo)> {
        let mut out: Vec<(String, PeerRegisterInfo)> = self
            .remote
            .iter()
            .filter(|p| !self.directory.is_banned(p.key()))
            .filter_map(|p| {
                p.registers
                    .get(register_id)
                    .map(|info| (p.key().clone(), info.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Sources that can serve the complete history.
    pub fn full_replica_sources(&self, register_id: &str) -> Vec<(String, PeerRegisterInfo)> {
        self.sources(register_id)
            .into_iter()
            .filter(|(_, info)| info.can_serve_full_replica)
            .collect()
    }

    /// One row per public register across non-banned peers and this node.
    pub fn get_network_advertised_registers(&self) -> Vec<NetworkRegisterSummary> {
        let mut rows: BTreeMap<String, NetworkRegisterSummary> = BTreeMap::new();
        let mut add = |info: &PeerRegisterInfo| {
            let row = rows
                .entry(info.register_id.clone())
                .or_insert_with(|| NetworkRegisterSummary {
                    register_id: info.register_id.clone(),
                    peer_count: 0,
                    latest_version: 0,
                    full_replica_peer_count: 0,
                    is_public: true,
                });
            row.peer_count += 1;
            row.latest_version = row.latest_version.max(info.latest_version);
            if info.can_serve_full_replica {
                row.full_replica_peer_count += 1;
            }
        };

        for peer in self.remote.iter() {
            if self.directory.is_banned(peer.key()) {
                continue;
            }
            for info in peer.registers.values().filter(|i| i.is_public) {
                add(info);
            }
        }
        for ad in self.local.iter().filter(|a| a.is_public) {
            add(&PeerRegisterInfo::from(ad.value()));
        }

        rows.into_values().collect()
    }

    /// Forget a peer entirely.
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        if self.remote.remove(peer_id).is_none() {
            return false;
        }
        let result = self.store().delete_remote_peer(peer_id).await;
        self.store_result("delete_remote_peer", result);
        self.record_size();
        true
    }

    /// Drop peers not heard from within `max_age`. Memory only: the store
    /// forgets them when their lease lapses.
    pub fn prune_stale_peers(&self, max_age: Duration) -> Vec<String> {
        let mut pruned = Vec::new();
        self.remote.retain(|peer_id, peer| {
            let keep = peer.received_at.elapsed() < max_age;
            if !keep {
                pruned.push(peer_id.clone());
            }
            keep
        });
        if !pruned.is_empty() {
            pruned.sort();
            info!(count = pruned.len(), "Pruned stale peer advertisements");
            self.record_size();
        }
        pruned
    }

    pub fn stats(&self) -> CatalogStats {
        CatalogStats {
            local_registers: self.local.len(),
            remote_peers: self.remote.len(),
            degraded: self.is_degraded(),
            store: self.store().name(),
        }
    }
}
