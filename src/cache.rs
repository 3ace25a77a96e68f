// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded in-memory register cache.
//!
//! Holds the most recent transactions and dockets of every register this
//! node replicates. Each register has its own entry behind its own mutex, so
//! writers to different registers never contend.
//!
//! # Bounds and eviction
//!
//! An entry never holds more than `max_transactions` transactions or
//! `max_dockets` dockets. When an insert overflows the bound, the member with
//! the lowest version is evicted; among equal versions, the one inserted first
//! goes first. Members are keyed by `(version, insertion sequence)` so the
//! eviction victim is always the first key of the map.
//!
//! `latest_transaction_version` / `latest_docket_version` are running maxima
//! and survive eviction.

use crate::config::CacheConfig;
use crate::metrics;
use crate::types::{CachedDocket, CachedTransaction, RegisterSnapshot};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

type OrderKey = (u64, u64);

/// Transactions and dockets held for one register.
#[derive(Debug)]
pub struct RegisterCacheEntry {
    register_id: String,
    max_transactions: usize,
    max_dockets: usize,
    transactions: BTreeMap<OrderKey, CachedTransaction>,
    by_transaction_id: HashMap<String, OrderKey>,
    dockets: BTreeMap<OrderKey, CachedDocket>,
    by_docket_version: HashMap<u64, OrderKey>,
    next_seq: u64,
    latest_transaction_version: u64,
    latest_docket_version: u64,
}

impl RegisterCacheEntry {
    pub fn new(register_id: impl Into<String>, max_transactions: usize, max_dockets: usize) -> Self {
        Self {
            register_id: register_id.into(),
            max_transactions,
            max_dockets,
            transactions: BTreeMap::new(),
            by_transaction_id: HashMap::new(),
            dockets: BTreeMap::new(),
            by_docket_version: HashMap::new(),
            next_seq: 0,
            latest_transaction_version: 0,
            latest_docket_version: 0,
        }
    }

    fn next_key(&mut self, version: u64) -> OrderKey {
        let key = (version, self.next_seq);
        self.next_seq += 1;
        key
    }

    /// Insert or replace (by transaction id). Returns how many were evicted.
    pub fn add_transaction(&mut self, tx: CachedTransaction) -> usize {
        if let Some(old) = self.by_transaction_id.remove(&tx.transaction_id) {
            self.transactions.remove(&old);
        }
        self.latest_transaction_version = self.latest_transaction_version.max(tx.version);

        let key = self.next_key(tx.version);
        self.by_transaction_id.insert(tx.transaction_id.clone(), key);
        self.transactions.insert(key, tx);

        let mut evicted = 0;
        while self.transactions.len() > self.max_transactions {
            let Some((_, victim)) = self.transactions.pop_first() else { break };
            self.by_transaction_id.remove(&victim.transaction_id);
            trace!(
                register_id = %self.register_id,
                transaction_id = %victim.transaction_id,
                version = victim.version,
                "Evicted transaction"
            );
            evicted += 1;
        }
        evicted
    }

    /// Insert or replace (by docket version). Returns how many were evicted.
    pub fn add_docket(&mut self, docket: CachedDocket) -> usize {
        if let Some(old) = self.by_docket_version.remove(&docket.version) {
            self.dockets.remove(&old);
        }
        self.latest_docket_version = self.latest_docket_version.max(docket.version);

        let key = self.next_key(docket.version);
        self.by_docket_version.insert(docket.version, key);
        self.dockets.insert(key, docket);

        let mut evicted = 0;
        while self.dockets.len() > self.max_dockets {
            let Some((_, victim)) = self.dockets.pop_first() else { break };
            self.by_docket_version.remove(&victim.version);
            evicted += 1;
        }
        evicted
    }

    pub fn get_transaction(&self, transaction_id: &str) -> Option<&CachedTransaction> {
        let key = self.by_transaction_id.get(transaction_id)?;
        self.transactions.get(key)
    }

    /// Cached transactions in ascending version order.
    pub fn transactions(&self) -> impl Iterator<Item = &CachedTransaction> {
        self.transactions.values()
    }

    /// Cached dockets in ascending version order.
    pub fn dockets(&self) -> impl Iterator<Item = &CachedDocket> {
        self.dockets.values()
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn docket_count(&self) -> usize {
        self.dockets.len()
    }

    pub fn latest_transaction_version(&self) -> u64 {
        self.latest_transaction_version
    }

    pub fn latest_docket_version(&self) -> u64 {
        self.latest_docket_version
    }
}

/// Totals across every cached register.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub registers: usize,
    pub transactions: usize,
    pub dockets: usize,
}

/// Per-register bounded cache.
pub struct RegisterCache {
    max_transactions: usize,
    max_dockets: usize,
    entries: DashMap<String, Arc<Mutex<RegisterCacheEntry>>>,
}

impl RegisterCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_transactions: config.max_transactions_per_register,
            max_dockets: config.max_dockets_per_register,
            entries: DashMap::new(),
        }
    }

    fn entry(&self, register_id: &str) -> Arc<Mutex<RegisterCacheEntry>> {
        if let Some(existing) = self.entries.get(register_id) {
            return Arc::clone(existing.value());
        }
        let entry = self.entries.entry(register_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(RegisterCacheEntry::new(
                register_id,
                self.max_transactions,
                self.max_dockets,
            )))
        });
        Arc::clone(entry.value())
    }

    fn existing(&self, register_id: &str) -> Option<Arc<Mutex<RegisterCacheEntry>>> {
        self.entries.get(register_id).map(|e| Arc::clone(e.value()))
    }

    /// Add one transaction to its register's entry.
    pub fn add_transaction(&self, tx: CachedTransaction) -> usize {
        let entry = self.entry(&tx.register_id);
        let evicted = entry.lock().add_transaction(tx);
        metrics::record_cache_evictions("transaction", evicted);
        evicted
    }

    pub fn add_docket(&self, docket: CachedDocket) -> usize {
        let entry = self.entry(&docket.register_id);
        let evicted = entry.lock().add_docket(docket);
        metrics::record_cache_evictions("docket", evicted);
        evicted
    }

    /// Load a full-replica snapshot under a single lock acquisition.
    ///
    /// Returns the number of transactions applied.
    pub fn apply_snapshot(&self, snapshot: &RegisterSnapshot) -> usize {
        let entry = self.entry(&snapshot.register_id);
        let mut guard = entry.lock();
        let mut tx_evicted = 0;
        let mut docket_evicted = 0;
        for tx in &snapshot.transactions {
            tx_evicted += guard.add_transaction(tx.clone());
        }
        for docket in &snapshot.dockets {
            docket_evicted += guard.add_docket(docket.clone());
        }
        drop(guard);
        metrics::record_cache_evictions("transaction", tx_evicted);
        metrics::record_cache_evictions("docket", docket_evicted);
        snapshot.transactions.len()
    }

    pub fn get_transaction(&self, register_id: &str, transaction_id: &str) -> Option<CachedTransaction> {
        let entry = self.existing(register_id)?;
        let guard = entry.lock();
        guard.get_transaction(transaction_id).cloned()
    }

    /// All cached transactions for a register, ascending by version.
    pub fn get_transactions(&self, register_id: &str) -> Vec<CachedTransaction> {
        self.get_transactions_since(register_id, None)
    }

    /// Cached transactions with version strictly greater than `after`.
    pub fn get_transactions_since(&self, register_id: &str, after: Option<u64>) -> Vec<CachedTransaction> {
        let Some(entry) = self.existing(register_id) else {
            return Vec::new();
        };
        let guard = entry.lock();
        guard
            .transactions()
            .filter(|t| after.map_or(true, |v| t.version > v))
            .cloned()
            .collect()
    }

    pub fn get_dockets(&self, register_id: &str) -> Vec<CachedDocket> {
        self.existing(register_id)
            .map(|entry| entry.lock().dockets().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest transaction and docket versions seen for a register.
    pub fn latest_versions(&self, register_id: &str) -> Option<(u64, u64)> {
        let entry = self.existing(register_id)?;
        let guard = entry.lock();
        Some((guard.latest_transaction_version(), guard.latest_docket_version()))
    }

    pub fn contains_register(&self, register_id: &str) -> bool {
        self.entries.contains_key(register_id)
    }

    pub fn remove_register(&self, register_id: &str) -> bool {
        self.entries.remove(register_id).is_some()
    }

    pub fn register_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn stats(&self) -> CacheStats {
        let entries: Vec<_> = self.entries.iter().map(|e| Arc::clone(e.value())).collect();
        let mut stats = CacheStats {
            registers: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            let guard = entry.lock();
            stats.transactions += guard.transaction_count();
            stats.dockets += guard.docket_count();
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(id: &str, version: u64) -> CachedTransaction {
        CachedTransaction::new(id, "reg-1", version, id.as_bytes().to_vec())
    }

    fn docket(version: u64) -> CachedDocket {
        CachedDocket {
            register_id: "reg-1".into(),
            version,
            data: vec![],
            docket_hash: format!("hash-{}", version),
            transaction_ids: vec![],
        }
    }

    fn cache(max_tx: usize, max_dockets: usize) -> RegisterCache {
        RegisterCache::new(&CacheConfig {
            max_transactions_per_register: max_tx,
            max_dockets_per_register: max_dockets,
        })
    }

    fn versions(cache: &RegisterCache) -> Vec<u64> {
        cache.get_transactions("reg-1").iter().map(|t| t.version).collect()
    }

    #[test]
    fn test_keeps_highest_versions() {
        let cache = cache(3, 10);
        for (i, v) in [5u64, 1, 9, 3, 7].iter().enumerate() {
            cache.add_transaction(tx(&format!("tx-{}", i), *v));
        }
        assert_eq!(versions(&cache), vec![5, 7, 9]);
    }

    #[test]
    fn test_eviction_tie_breaks_by_insertion_order() {
        let cache = cache(2, 10);
        cache.add_transaction(tx("first", 1));
        cache.add_transaction(tx("second", 1));
        let evicted = cache.add_transaction(tx("third", 1));
        assert_eq!(evicted, 1);

        assert!(cache.get_transaction("reg-1", "first").is_none());
        assert!(cache.get_transaction("reg-1", "second").is_some());
        assert!(cache.get_transaction("reg-1", "third").is_some());
    }

    #[test]
    fn test_low_version_insert_into_full_entry_is_evicted_immediately() {
        let cache = cache(2, 10);
        cache.add_transaction(tx("a", 10));
        cache.add_transaction(tx("b", 20));
        assert_eq!(cache.add_transaction(tx("old", 1)), 1);
        assert_eq!(versions(&cache), vec![10, 20]);
    }

    #[test]
    fn test_latest_version_is_running_max() {
        let cache = cache(1, 1);
        cache.add_transaction(tx("a", 50));
        cache.add_transaction(tx("b", 10));
        cache.add_docket(docket(4));
        cache.add_docket(docket(2));
        assert_eq!(cache.latest_versions("reg-1"), Some((50, 4)));
        assert_eq!(versions(&cache), vec![50]);
        assert_eq!(cache.get_dockets("reg-1")[0].version, 4);
    }

    #[test]
    fn test_same_transaction_id_replaces() {
        let cache = cache(10, 10);
        cache.add_transaction(tx("a", 1));
        cache.add_transaction(tx("a", 2));
        assert_eq!(versions(&cache), vec![2]);
        assert_eq!(cache.stats().transactions, 1);
    }

    #[test]
    fn test_same_docket_version_replaces() {
        let cache = cache(10, 10);
        cache.add_docket(docket(3));
        cache.add_docket(docket(3));
        assert_eq!(cache.get_dockets("reg-1").len(), 1);
    }

    #[test]
    fn test_transactions_since() {
        let cache = cache(10, 10);
        for v in 1..=5 {
            cache.add_transaction(tx(&format!("tx-{}", v), v));
        }
        let since: Vec<u64> = cache
            .get_transactions_since("reg-1", Some(3))
            .iter()
            .map(|t| t.version)
            .collect();
        assert_eq!(since, vec![4, 5]);
        assert!(cache.get_transactions_since("missing", None).is_empty());
    }

    #[test]
    fn test_apply_snapshot() {
        let cache = cache(2, 1);
        let snapshot = RegisterSnapshot {
            register_id: "reg-1".into(),
            transactions: vec![tx("a", 1), tx("b", 2), tx("c", 3)],
            dockets: vec![docket(1), docket(2)],
        };
        assert_eq!(cache.apply_snapshot(&snapshot), 3);
        assert_eq!(versions(&cache), vec![2, 3]);
        assert_eq!(cache.latest_versions("reg-1"), Some((3, 2)));
    }

    #[test]
    fn test_registers_are_independent() {
        let cache = cache(1, 1);
        cache.add_transaction(tx("a", 1));
        cache.add_transaction(CachedTransaction::new("b", "reg-2", 1, vec![]));
        assert_eq!(cache.register_ids(), vec!["reg-1", "reg-2"]);
        assert_eq!(
            cache.stats(),
            CacheStats {
                registers: 2,
                transactions: 2,
                dockets: 0
            }
        );
        assert!(cache.remove_register("reg-2"));
        assert!(!cache.contains_register("reg-2"));
        assert_eq!(cache.latest_versions("reg-2"), None);
    }

    #[test]
    fn test_zero_bound_holds_nothing() {
        let cache = cache(0, 0);
        assert_eq!(cache.add_transaction(tx("a", 1)), 1);
        assert!(versions(&cache).is_empty());
        assert_eq!(cache.latest_versions("reg-1"), Some((1, 0)));
    }

    #[test]
    fn test_concurrent_writers_respect_bound() {
        let cache = Arc::new(cache(50, 10));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        cache.add_transaction(tx(&format!("t{}-{}", t, i), i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let kept = versions(&cache);
        assert_eq!(kept.len(), 50);
        assert!(kept.iter().all(|v| *v >= 93));
    }
}
