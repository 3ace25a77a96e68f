// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gossip path: inbound notifications and relay.
//!
//! # Flow
//!
//! ```text
//! from_peer ──► banned? ──► hash ok? ──► heartbeat + sender Bloom
//!                                              │
//!                                              ▼
//!                                   begin_gossip (atomic dedup)
//!                                     │                 │
//!                                 Duplicate        first sighting
//!                                                       │
//!                                         publish to local subscribers
//!                                                       │
//!                                      Forward? ──► relay next round
//! ```
//!
//! Relay candidates are the directory's healthy peers minus the sender, the
//! origin and this node, minus peers whose breaker is open or whose heartbeat
//! needs failover. Candidates whose Bloom filter already holds the hash are
//! skipped; at most `fanout` of the rest are picked at random and sent to
//! concurrently, each through the peer's breaker.

use super::types::{GossipOutcome, RelayReport};
use super::ReplicationNode;
use crate::error::{ReplicationError, Result};
use crate::gossip::GossipDecision;
use crate::metrics;
use crate::types::{content_hash, TransactionNotification};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

impl ReplicationNode {
    /// Handle one notification received from `from_peer`.
    pub async fn handle_gossip(
        &self,
        from_peer: &str,
        mut notification: TransactionNotification,
        cancel: &CancellationToken,
    ) -> Result<GossipOutcome> {
        ReplicationError::require_id("peer id", from_peer)?;
        ReplicationError::require_id("transaction id", &notification.transaction_id)?;

        if self.directory.is_banned(from_peer) {
            debug!(peer_id = %from_peer, "Dropping notification from banned peer");
            return Ok(GossipOutcome::Rejected { reason: "banned" });
        }

        if let Some(data) = &notification.transaction_data {
            if !content_hash(data).eq_ignore_ascii_case(&notification.data_hash) {
                warn!(
                    peer_id = %from_peer,
                    transaction_id = %notification.transaction_id,
                    "Notification payload does not match its hash"
                );
                metrics::record_error("gossip", "hash_mismatch");
                self.directory.ban_peer(from_peer, "gossip payload hash mismatch").await;
                self.gossip.reset_bloom_filter(from_peer);
                return Ok(GossipOutcome::Rejected { reason: "hash_mismatch" });
            }
        }

        // Bloom filters and relays carry the lowercase form
        notification.data_hash.make_ascii_lowercase();
        self.peers.record_heartbeat(from_peer);
        self.gossip.add_to_bloom_filter(from_peer, &notification.data_hash);

        let decision = self.gossip.begin_gossip(&notification);
        if decision == GossipDecision::Duplicate {
            return Ok(GossipOutcome::Duplicate);
        }

        // No receivers is fine
        let _ = self.notifications.send(notification.clone());

        let relay = if decision == GossipDecision::Forward {
            let next = self.gossip.prepare_for_next_round(&notification);
            let exclude = [from_peer, notification.origin_peer_id.as_str(), self.local_node_id()];
            self.relay(&next, &exclude, cancel).await
        } else {
            debug!(
                transaction_id = %notification.transaction_id,
                decision = decision.as_str(),
                "Accepted without relay"
            );
            RelayReport::default()
        };

        Ok(GossipOutcome::Accepted { decision, relay })
    }

    /// Originate a notification for a transaction created on this node.
    ///
    /// The payload travels inline when it fits `full_data_threshold_bytes`.
    /// Returns an empty report if the id was already seen.
    pub async fn broadcast_transaction(
        &self,
        transaction_id: &str,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RelayReport> {
        ReplicationError::require_id("transaction id", transaction_id)?;

        let gossip_cfg = &self.config.gossip;
        let notification = TransactionNotification::new(
            transaction_id,
            self.local_node_id(),
            data,
            data.len() <= gossip_cfg.full_data_threshold_bytes,
            gossip_cfg.default_ttl,
        );

        match self.gossip.begin_gossip(&notification) {
            GossipDecision::Forward => {}
            decision => {
                debug!(
                    transaction_id = %transaction_id,
                    decision = decision.as_str(),
                    "Not broadcasting transaction"
                );
                return Ok(RelayReport::default());
            }
        }

        let exclude = [self.local_node_id()];
        Ok(self.relay(&notification, &exclude, cancel).await)
    }

    async fn relay(
        &self,
        notification: &TransactionNotification,
        exclude: &[&str],
        cancel: &CancellationToken,
    ) -> RelayReport {
        let mut report = RelayReport::default();
        let hash = notification.data_hash.as_str();

        let candidates: Vec<String> = self
            .directory
            .healthy_peers()
            .into_iter()
            .map(|peer| peer.peer_id)
            .filter(|peer_id| !exclude.contains(&peer_id.as_str()) && self.peers.is_available(peer_id))
            .filter(|peer_id| {
                let known = self.gossip.check_bloom_filter(peer_id, hash);
                if known {
                    report.filtered += 1;
                }
                !known
            })
            .collect();
        if report.filtered > 0 {
            metrics::record_gossip_filtered(report.filtered);
        }

        let mut targets = Vec::new();
        for target in self.gossip.select_targets(&candidates, &[]) {
            if let Some(limiter) = &self.rate_limiter {
                if !limiter.try_acquire() {
                    report.rate_limited += 1;
                    metrics::record_gossip_rate_limited();
                    continue;
                }
            }
            targets.push(target);
        }

        let timeout = self.config.gossip.send_timeout_duration();
        let sends = targets.into_iter().map(|target| async move {
            let send = self.transport.send_notification(&target, notification);
            let result = self.peers.call(&target, "gossip", timeout, cancel, send).await;
            (target, result)
        });

        for (target, result) in join_all(sends).await {
            match result {
                Ok(()) => {
                    self.gossip.add_to_bloom_filter(&target, hash);
                    metrics::record_gossip_send(&target, true);
                    report.delivered.push(target);
                }
                Err(e) => {
                    debug!(peer_id = %target, error = %e, "Gossip send failed");
                    metrics::record_gossip_send(&target, false);
                    report.failed.push(target);
                }
            }
        }

        debug!(
            transaction_id = %notification.transaction_id,
            round = notification.gossip_round,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            filtered = report.filtered,
            rate_limited = report.rate_limited,
            "Relayed notification"
        );
        report
    }
}
