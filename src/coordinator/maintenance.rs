// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic housekeeping.
//!
//! Each pass:
//! 1. drops gossip seen-set entries older than `state_max_age`
//! 2. prunes remote advertisements not refreshed within the index TTL
//! 3. rewrites local advertisements so their store lease does not lapse
//! 4. sweeps peer heartbeats; failed-over peers get their Bloom filter reset

use super::types::MaintenanceReport;
use crate::catalog::AdvertisementCatalog;
use crate::gossip::GossipEngine;
use crate::metrics;
use crate::network::PeerDirectory;
use crate::peer::PeerHealth;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// Everything a maintenance pass touches.
#[derive(Clone)]
pub(crate) struct MaintenanceContext {
    pub gossip: Arc<GossipEngine>,
    pub catalog: Arc<AdvertisementCatalog>,
    pub peers: Arc<PeerHealth>,
    pub directory: Arc<dyn PeerDirectory>,
    pub gossip_max_age: Duration,
    pub remote_max_age: Duration,
}

pub(crate) async fn maintenance_cycle(ctx: &MaintenanceContext) -> MaintenanceReport {
    let started = Instant::now();

    let gossip_removed = ctx.gossip.cleanup_old_state(ctx.gossip_max_age);
    metrics::record_gossip_cleanup(gossip_removed);

    let peers_pruned = ctx.catalog.prune_stale_peers(ctx.remote_max_age);
    ctx.catalog.refresh_leases().await;

    let failovers: Vec<String> = ctx
        .peers
        .sweep()
        .into_iter()
        .map(|(peer_id, _)| {
            ctx.gossip.reset_bloom_filter(&peer_id);
            peer_id
        })
        .collect();

    let available = ctx
        .directory
        .healthy_peers()
        .iter()
        .filter(|p| ctx.peers.is_available(&p.peer_id))
        .count();
    metrics::set_healthy_peers(available);

    let report = MaintenanceReport {
        gossip_removed,
        peers_pruned,
        failovers,
    };
    metrics::record_maintenance_cycle(report.gossip_removed, report.peers_pruned.len(), started.elapsed());
    debug!(
        gossip_removed = report.gossip_removed,
        peers_pruned = report.peers_pruned.len(),
        failovers = report.failovers.len(),
        available_peers = available,
        "Maintenance pass complete"
    );
    report
}

/// Run maintenance every `interval` until `cancel` fires.
pub(crate) async fn run_maintenance(ctx: MaintenanceContext, interval: Duration, cancel: CancellationToken) {
    let span = tracing::info_span!("maintenance");

    async move {
        info!(interval_secs = interval.as_secs(), "Starting maintenance task");

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; nothing to clean yet.
        timer.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Shutdown signal received, stopping maintenance task");
                    break;
                }

                _ = timer.tick() => {
                    maintenance_cycle(&ctx).await;
                }
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::MemoryAdvertisementStore;
    use crate::config::{GossipConfig, PeerHealthConfig};
    use crate::network::StaticPeerDirectory;
    use crate::types::{PeerRegisterInfo, RegisterSyncState, TransactionNotification};

    fn context() -> MaintenanceContext {
        let directory = Arc::new(StaticPeerDirectory::with_peers(["peer-1", "peer-2"]));
        MaintenanceContext {
            gossip: Arc::new(GossipEngine::new(&GossipConfig::default())),
            catalog: Arc::new(AdvertisementCatalog::new(
                "local",
                directory.clone(),
                Arc::new(MemoryAdvertisementStore::new()),
            )),
            peers: Arc::new(PeerHealth::new(&PeerHealthConfig::default())),
            directory,
            gossip_max_age: Duration::from_secs(3600),
            remote_max_age: Duration::from_secs(300),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_prunes_and_fails_over() {
        let ctx = context();
        ctx.catalog
            .process_remote_advertisements(
                "peer-1",
                vec![PeerRegisterInfo::new("reg-1", RegisterSyncState::Active, 1, 0, true)],
            )
            .await
            .unwrap();
        ctx.peers.record_heartbeat("peer-2");
        ctx.gossip.add_to_bloom_filter("peer-2", "hash-1");

        // Defaults: 30s interval, 2 misses recommend failover
        tokio::time::advance(Duration::from_secs(301)).await;
        let report = maintenance_cycle(&ctx).await;

        assert_eq!(report.peers_pruned, vec!["peer-1"]);
        assert_eq!(report.failovers, vec!["peer-2"]);
        assert!(!ctx.gossip.check_bloom_filter("peer-2", "hash-1"));
        assert!(ctx.catalog.known_peers().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_with_zero_age_clears_gossip_state() {
        let mut ctx = context();
        ctx.gossip_max_age = Duration::ZERO;
        let n = TransactionNotification::new("tx-1", "peer-1", b"data", true, 10);
        ctx.gossip.begin_gossip(&n);

        let report = maintenance_cycle(&ctx).await;
        assert_eq!(report.gossip_removed, 1);
        assert_eq!(ctx.gossip.tracked_transactions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_maintenance_stops_on_cancel() {
        let ctx = context();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_maintenance(ctx, Duration::from_secs(30), cancel.clone()));

        tokio::time::advance(Duration::from_secs(95)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("maintenance task should stop")
            .unwrap();
    }
}
