// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gossip dissemination engine.
//!
//! Decides whether a received [`TransactionNotification`] should be
//! re-propagated, prepares the next-round copy, and tracks which peers
//! already know which transactions.
//!
//! # Forwarding rule
//!
//! ```text
//! should_gossip(n) = !seen(n.id) && n.ttl > 0 && n.gossip_round < max_gossip_rounds
//! ```
//!
//! The seen-set is keyed by transaction id and is the only correctness gate.
//! Per-peer Bloom filters are consulted to skip redundant sends and are never
//! cleared on their own: a rotation would forget hashes the peer does know,
//! which only costs extra sends, but a lost seen-set entry could re-flood.
//!
//! # Concurrency
//!
//! [`GossipEngine::begin_gossip`] checks and records in one `DashMap::entry`
//! call, so two concurrent receipts of the same transaction produce exactly
//! one `Forward`.

pub mod bloom;

use crate::config::GossipConfig;
use crate::metrics;
use crate::types::TransactionNotification;
use bloom::BloomFilter;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use std::time::Duration;
use tracing::{debug, trace};

/// Bookkeeping for a transaction this node has seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipState {
    pub transaction_id: String,
    pub started_at: DateTime<Utc>,
    pub current_round: u32,
}

/// Result of checking and recording a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipDecision {
    /// First sighting, relay the next round.
    Forward,
    /// Already seen, drop.
    Duplicate,
    /// First sighting but TTL exhausted: accept locally, do not relay.
    Expired,
    /// First sighting but round limit reached: accept locally, do not relay.
    MaxRounds,
}

impl GossipDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forwarded",
            Self::Duplicate => "duplicate",
            Self::Expired => "expired",
            Self::MaxRounds => "max_rounds",
        }
    }

    /// True for every first sighting.
    pub fn is_new(&self) -> bool {
        !matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipStats {
    pub tracked_transactions: usize,
    pub bloom_filters: usize,
    pub fanout: usize,
    pub max_gossip_rounds: u32,
}

pub struct GossipEngine {
    fanout: usize,
    max_gossip_rounds: u32,
    bloom_expected_items: usize,
    bloom_false_positive_rate: f64,
    seen: DashMap<String, GossipState>,
    filters: DashMap<String, BloomFilter>,
}

impl GossipEngine {
    pub fn new(config: &GossipConfig) -> Self {
        Self {
            fanout: config.fanout,
            max_gossip_rounds: config.max_gossip_rounds,
            bloom_expected_items: config.bloom_expected_items,
            bloom_false_positive_rate: config.bloom_false_positive_rate,
            seen: DashMap::new(),
            filters: DashMap::new(),
        }
    }

    pub fn fanout(&self) -> usize {
        self.fanout
    }

    pub fn max_gossip_rounds(&self) -> u32 {
        self.max_gossip_rounds
    }

    fn relay_limit(&self, notification: &TransactionNotification) -> Option<GossipDecision> {
        if notification.ttl <= 0 {
            Some(GossipDecision::Expired)
        } else if notification.gossip_round >= self.max_gossip_rounds {
            Some(GossipDecision::MaxRounds)
        } else {
            None
        }
    }

    /// Pure check: would this notification be relayed?
    pub fn should_gossip(&self, notification: &TransactionNotification) -> bool {
        self.relay_limit(notification).is_none()
            && !self.seen.contains_key(&notification.transaction_id)
    }

    /// Mark a transaction as seen. No-op if already tracked.
    pub fn record_seen(&self, transaction_id: &str) {
        self.seen
            .entry(transaction_id.to_string())
            .or_insert_with(|| GossipState {
                transaction_id: transaction_id.to_string(),
                started_at: Utc::now(),
                current_round: 0,
            });
    }

    /// Atomically check and record a received notification.
    pub fn begin_gossip(&self, notification: &TransactionNotification) -> GossipDecision {
        let decision = match self.seen.entry(notification.transaction_id.clone()) {
            Entry::Occupied(mut existing) => {
                let state = existing.get_mut();
                state.current_round = state.current_round.max(notification.gossip_round);
                GossipDecision::Duplicate
            }
            Entry::Vacant(slot) => {
                slot.insert(GossipState {
                    transaction_id: notification.transaction_id.clone(),
                    started_at: Utc::now(),
                    current_round: notification.gossip_round,
                });
                self.relay_limit(notification).unwrap_or(GossipDecision::Forward)
            }
        };
        trace!(
            transaction_id = %notification.transaction_id,
            round = notification.gossip_round,
            ttl = notification.ttl,
            decision = decision.as_str(),
            "Gossip decision"
        );
        metrics::record_gossip_decision(decision.as_str());
        decision
    }

    /// Atomic check-and-record; true only for the one receipt that should relay.
    pub fn try_begin_gossip(&self, notification: &TransactionNotification) -> bool {
        self.begin_gossip(notification) == GossipDecision::Forward
    }

    /// The copy to send in the next round: round and hop count up by one,
    /// TTL down by one, everything else unchanged.
    pub fn prepare_for_next_round(&self, notification: &TransactionNotification) -> TransactionNotification {
        let mut next = notification.clone();
        next.gossip_round = next.gossip_round.saturating_add(1);
        next.hop_count = next.hop_count.saturating_add(1);
        next.ttl = next.ttl.saturating_sub(1);
        next
    }

    pub fn gossip_state(&self, transaction_id: &str) -> Option<GossipState> {
        self.seen.get(transaction_id).map(|s| s.value().clone())
    }

    /// Drop state at least `max_age` old. Zero clears everything.
    pub fn cleanup_old_state(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        // Ages beyond chrono's range never expire.
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let mut removed = 0;
        self.seen.retain(|_, state| {
            let keep = now.signed_duration_since(state.started_at) < max_age;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(removed, remaining = self.seen.len(), "Cleaned up gossip state");
        }
        metrics::set_gossip_seen_entries(self.seen.len());
        removed
    }

    pub fn tracked_transactions(&self) -> usize {
        self.seen.len()
    }

    // =========================================================================
    // Bloom filters
    // =========================================================================

    /// Record that `peer_id` knows `data_hash`.
    pub fn add_to_bloom_filter(&self, peer_id: &str, data_hash: &str) {
        self.filters
            .entry(peer_id.to_string())
            .or_insert_with(|| BloomFilter::new(self.bloom_expected_items, self.bloom_false_positive_rate))
            .insert(data_hash.as_bytes());
    }

    /// True if `peer_id` probably knows `data_hash`. False for unknown peers.
    pub fn check_bloom_filter(&self, peer_id: &str, data_hash: &str) -> bool {
        self.filters
            .get(peer_id)
            .map(|f| f.contains(data_hash.as_bytes()))
            .unwrap_or(false)
    }

    /// Forget everything recorded for a peer.
    pub fn reset_bloom_filter(&self, peer_id: &str) -> bool {
        self.filters.remove(peer_id).is_some()
    }

    // =========================================================================
    // Target selection
    // =========================================================================

    /// Random subset of at most `fanout` candidates, skipping `exclude`.
    pub fn select_targets(&self, candidates: &[String], exclude: &[&str]) -> Vec<String> {
        let eligible: Vec<&String> = candidates
            .iter()
            .filter(|c| !exclude.contains(&c.as_str()))
            .collect();
        let mut rng = rand::thread_rng();
        eligible
            .choose_multiple(&mut rng, self.fanout)
            .map(|c| (*c).clone())
            .collect()
    }

    pub fn stats(&self) -> GossipStats {
        GossipStats {
            tracked_transactions: self.seen.len(),
            bloom_filters: self.filters.len(),
            fanout: self.fanout,
            max_gossip_rounds: self.max_gossip_rounds,
        }
    }
}
