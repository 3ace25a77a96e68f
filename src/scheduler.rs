// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Register sync scheduler.
//!
//! Owns the set of [`RegisterSubscription`]s, persists every change to the
//! [`SubscriptionStore`], and drives each subscription through the
//! [`ReplicationService`] on a periodic tick.
//!
//! # Scheduling
//!
//! Every tick visits all subscriptions. One is due when it is not already in
//! flight, has no live feed running, and its `next_due` has passed:
//!
//! | Result | Next attempt |
//! |--------|--------------|
//! | full pull succeeded | after `full_replica_refresh` |
//! | no source peers | next tick |
//! | all sources failed | `retry_backoff(consecutive_failures)` |
//! | live feed ended | next tick |
//! | live feed failed | `retry_backoff(consecutive_failures)` |
//!
//! Each due subscription is synced in its own task, so a source that hangs
//! until its timeout delays only the register it serves. At most
//! `max_concurrent_syncs` attempts run at once ([`Bulkhead`]).
//! Reaching `failed_after_failures` consecutive failures reports the
//! subscription as `Failed`; it keeps retrying at the capped backoff and
//! recovers on the next success.
//!
//! Unsubscribing cancels the attempt in flight. The result of an attempt
//! that still completes for a subscription that is gone, or was replaced by
//! a new one, is dropped. If the register is no longer subscribed at all,
//! whatever the attempt cached or advertised is removed again.
//!
//! # Persistence
//!
//! The in-memory map is authoritative while running. Writes to SQLite are
//! best-effort, except [`SyncScheduler::start`] which must be able to read
//! the table to restore subscriptions after a restart.

use crate::config::SchedulerConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::replication::{FeedEnd, FeedOutcome, LiveFeedHandle, PullOutcome, ReplicationService};
use crate::resilience::{retry_backoff, BackoffPolicy, Bulkhead};
use crate::subscription_store::SubscriptionStore;
use crate::types::{RegisterSubscription, RegisterSyncState, ReplicationMode};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct Slot {
    subscription: RegisterSubscription,
    next_due: Instant,
    in_flight: bool,
    feed: Option<LiveFeedHandle>,
    /// Tells this subscription apart from an earlier one for the same register.
    generation: u64,
    /// Cancelled on unsubscribe. Parent of every attempt and feed.
    cancel: CancellationToken,
}

impl Slot {
    fn new(subscription: RegisterSubscription, generation: u64, cancel: CancellationToken) -> Self {
        Self {
            subscription,
            next_due: Instant::now(),
            in_flight: false,
            feed: None,
            generation,
            cancel,
        }
    }
}

/// A due subscription handed to one sync attempt.
struct Claim {
    register_id: String,
    generation: u64,
    cancel: CancellationToken,
}

/// Subscription counts for health reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total: usize,
    pub subscribing: usize,
    pub syncing: usize,
    pub active: usize,
    pub fully_replicated: usize,
    pub failed: usize,
    pub live_feeds: usize,
    pub in_flight: usize,
}

enum Attempt {
    Pull(PullOutcome),
    Feed(FeedOutcome),
}

/// Drive `attempt` to completion, cancelling `token` if `outer` fires first.
async fn linked<F>(outer: &CancellationToken, token: CancellationToken, attempt: F)
where
    F: Future<Output = ()>,
{
    tokio::pin!(attempt);
    tokio::select! {
        biased;
        () = &mut attempt => return,
        () = outer.cancelled() => token.cancel(),
    }
    attempt.await;
}

pub struct SyncScheduler {
    config: SchedulerConfig,
    backoff: BackoffPolicy,
    replication: Arc<ReplicationService>,
    store: Arc<SubscriptionStore>,
    slots: DashMap<String, Slot>,
    generations: AtomicU64,
    bulkhead: Bulkhead,
    wake: Notify,
    cancel: CancellationToken,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(
        config: SchedulerConfig,
        replication: Arc<ReplicationService>,
        store: Arc<SubscriptionStore>,
    ) -> Self {
        Self {
            backoff: config.backoff_policy(),
            bulkhead: Bulkhead::new(config.max_concurrent_syncs),
            config,
            replication,
            store,
            slots: DashMap::new(),
            generations: AtomicU64::new(0),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    fn new_slot(&self, subscription: RegisterSubscription) -> Slot {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        Slot::new(subscription, generation, self.cancel.child_token())
    }

    fn generation_of(&self, register_id: &str) -> Option<u64> {
        self.slots.get(register_id).map(|slot| slot.generation)
    }

    async fn persist(&self, subscription: &RegisterSubscription) {
        if let Err(e) = self.store.upsert(subscription).await {
            metrics::record_error("scheduler", "persist");
            warn!(
                register_id = %subscription.register_id,
                error = %e,
                "Failed to persist subscription, continuing in memory"
            );
        }
    }

    async fn forget(&self, register_id: &str) {
        if let Err(e) = self.store.delete(register_id).await {
            metrics::record_error("scheduler", "persist");
            warn!(register_id = %register_id, error = %e, "Failed to delete persisted subscription");
        }
    }

    /// Persist a result produced under `generation`.
    ///
    /// Nothing is written for a subscription that has since been replaced or
    /// dropped. If an unsubscribe or re-subscribe lands while the row is being
    /// written, the row is rewritten to match whatever is current.
    async fn persist_for(&self, generation: u64, subscription: &RegisterSubscription) {
        let register_id = subscription.register_id.as_str();
        if self.generation_of(register_id) != Some(generation) {
            return;
        }
        self.persist(subscription).await;

        let current = self
            .slots
            .get(register_id)
            .map(|slot| (slot.generation, slot.subscription.clone()));
        match current {
            Some((current, _)) if current == generation => {}
            Some((_, newer)) => self.persist(&newer).await,
            None => self.forget(register_id).await,
        }
    }

    // =========================================================================
    // Subscription management
    // =========================================================================

    /// Subscribe to a register. Idempotent: an existing subscription is
    /// returned unchanged, whatever `mode` is requested.
    pub async fn subscribe_to_register(
        &self,
        register_id: &str,
        mode: ReplicationMode,
    ) -> Result<RegisterSubscription> {
        ReplicationError::require_id("register id", register_id)?;

        let (created, generation) = match self.slots.entry(register_id.to_string()) {
            Entry::Occupied(existing) => {
                let current = existing.get().subscription.clone();
                if current.mode != mode {
                    debug!(
                        register_id = %register_id,
                        existing = %current.mode,
                        requested = %mode,
                        "Already subscribed with a different mode, keeping existing"
                    );
                }
                return Ok(current);
            }
            Entry::Vacant(vacant) => {
                let subscription = RegisterSubscription::new(register_id, mode);
                let slot = vacant.insert(self.new_slot(subscription.clone()));
                (subscription, slot.generation)
            }
        };

        info!(register_id = %register_id, mode = %mode, "Subscribed to register");
        self.persist_for(generation, &created).await;
        self.wake.notify_one();
        Ok(created)
    }

    /// Drop a subscription, cancel any attempt in flight for it and stop its
    /// live feed. Returns `false` if it did not exist.
    pub async fn unsubscribe_from_register(&self, register_id: &str) -> Result<bool> {
        ReplicationError::require_id("register id", register_id)?;
        let Some((_, slot)) = self.slots.remove(register_id) else {
            return Ok(false);
        };
        slot.cancel.cancel();
        if let Some(feed) = slot.feed {
            feed.stop();
        }
        self.forget(register_id).await;
        info!(register_id = %register_id, in_flight = slot.in_flight, "Unsubscribed from register");
        Ok(true)
    }

    fn view(slot: &Slot) -> RegisterSubscription {
        let mut subscription = slot.subscription.clone();
        if let Some(feed) = &slot.feed {
            subscription.total_transactions_synced =
                subscription.total_transactions_synced.saturating_add(feed.received());
        }
        subscription
    }

    pub fn get_subscription(&self, register_id: &str) -> Option<RegisterSubscription> {
        self.slots.get(register_id).map(|slot| Self::view(&slot))
    }

    /// All subscriptions, sorted by register id.
    pub fn get_subscriptions(&self) -> Vec<RegisterSubscription> {
        let mut subs: Vec<_> = self.slots.iter().map(|slot| Self::view(&slot)).collect();
        subs.sort_by(|a, b| a.register_id.cmp(&b.register_id));
        subs
    }

    /// Make a subscription due now, e.g. after version lag was detected.
    ///
    /// A forward-only subscription with a running feed is already current,
    /// so this returns `false` for it.
    pub fn trigger_now(&self, register_id: &str) -> bool {
        let Some(mut slot) = self.slots.get_mut(register_id) else {
            return false;
        };
        if slot.feed.is_some() {
            return false;
        }
        slot.next_due = Instant::now();
        drop(slot);
        debug!(register_id = %register_id, "Subscription sync triggered");
        self.wake.notify_one();
        true
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats::default();
        for slot in self.slots.iter() {
            stats.total += 1;
            match slot.subscription.sync_state {
                RegisterSyncState::Subscribing => stats.subscribing += 1,
                RegisterSyncState::Syncing => stats.syncing += 1,
                RegisterSyncState::Active => stats.active += 1,
                RegisterSyncState::FullyReplicated => stats.fully_replicated += 1,
                RegisterSyncState::Failed => stats.failed += 1,
            }
            if slot.feed.is_some() {
                stats.live_feeds += 1;
            }
            if slot.in_flight {
                stats.in_flight += 1;
            }
        }
        stats
    }

    fn publish_gauges(&self) {
        let stats = self.stats();
        metrics::set_subscriptions_in_state("Subscribing", stats.subscribing);
        metrics::set_subscriptions_in_state("Syncing", stats.syncing);
        metrics::set_subscriptions_in_state("Active", stats.active);
        metrics::set_subscriptions_in_state("FullyReplicated", stats.fully_replicated);
        metrics::set_subscriptions_in_state("Failed", stats.failed);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore persisted subscriptions and spawn the scheduling loop.
    ///
    /// Failing to read the subscription table is fatal. Returns the number of
    /// subscriptions restored.
    pub async fn start(self: &Arc<Self>) -> Result<usize> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ReplicationError::InvalidState {
                expected: "not started".to_string(),
                actual: "started".to_string(),
            });
        }

        let restored = match self.store.load_all().await {
            Ok(restored) => restored,
            Err(e) => {
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };
        let count = restored.len();
        for subscription in restored {
            if let Entry::Vacant(vacant) = self.slots.entry(subscription.register_id.clone()) {
                vacant.insert(self.new_slot(subscription));
            }
        }

        let this = Arc::clone(self);
        let span = tracing::info_span!("sync_scheduler");
        let handle = tokio::spawn(this.run_loop().instrument(span));
        *self.task.lock() = Some(handle);

        info!(
            restored = count,
            tick_ms = self.config.tick_interval_duration().as_millis() as u64,
            max_concurrent = self.bulkhead.max_concurrent(),
            "Sync scheduler started"
        );
        self.publish_gauges();
        Ok(count)
    }

    /// Dispatch due subscriptions as tasks and go straight back to waiting,
    /// so a slow source never holds up the next tick.
    async fn run_loop(self: Arc<Self>) {
        let mut timer = tokio::time::interval(self.config.tick_interval_duration());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut syncs = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, stopping scheduler loop");
                    break;
                }

                Some(joined) = syncs.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            metrics::record_error("scheduler", "sync_panic");
                            warn!(error = %e, "Sync attempt panicked");
                        }
                    }
                    continue;
                }

                _ = timer.tick() => {}

                _ = self.wake.notified() => {}
            }

            let started = Instant::now();
            self.reap_feeds().await;
            let due = self.claim_due();
            let count = due.len();
            for claim in due {
                let this = Arc::clone(&self);
                let span = tracing::info_span!("sync", register_id = %claim.register_id);
                syncs.spawn(async move { this.sync_one(claim).await }.instrument(span));
            }
            if count > 0 {
                debug!(due = count, in_flight = syncs.len(), "Dispatched due subscriptions");
            }
            metrics::record_scheduler_tick(count, started.elapsed());
            self.publish_gauges();
        }

        // Attempts share the scheduler's cancellation, so they wind down on their own
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            while syncs.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = syncs.len(), "Sync attempts did not stop within drain timeout, aborting");
            syncs.abort_all();
        }
    }

    /// Mark every due subscription in flight and hand out its claim.
    fn claim_due(&self) -> Vec<Claim> {
        let now = Instant::now();
        self.slots
            .iter_mut()
            .filter_map(|mut slot| {
                if slot.in_flight || slot.feed.is_some() || slot.next_due > now {
                    return None;
                }
                slot.in_flight = true;
                Some(Claim {
                    register_id: slot.key().clone(),
                    generation: slot.generation,
                    cancel: slot.cancel.child_token(),
                })
            })
            .collect()
    }

    /// Run one scheduling pass inline: collect finished feeds, then sync every
    /// due subscription and wait for all of them. Returns how many were
    /// attempted.
    pub async fn run_due(&self, cancel: &CancellationToken) -> usize {
        let started = Instant::now();
        self.reap_feeds().await;

        let due = self.claim_due();
        let count = due.len();
        if count > 0 {
            debug!(due = count, "Running due subscriptions");
            futures::future::join_all(due.into_iter().map(|claim| {
                let token = claim.cancel.clone();
                linked(cancel, token, self.sync_one(claim))
            }))
            .await;
        }

        metrics::record_scheduler_tick(count, started.elapsed());
        self.publish_gauges();
        count
    }

    /// Clear the in-flight mark. Returns `false` if the subscription this
    /// attempt belonged to is gone.
    fn release(&self, register_id: &str, generation: u64) -> bool {
        match self.slots.get_mut(register_id) {
            Some(mut slot) if slot.generation == generation => {
                slot.in_flight = false;
                true
            }
            _ => false,
        }
    }

    /// An attempt finished for a subscription that no longer exists. Undo
    /// whatever it wrote, unless the register has been subscribed again.
    async fn discard_orphan(&self, register_id: &str) {
        if self.slots.contains_key(register_id) {
            return;
        }
        debug!(register_id = %register_id, "Unsubscribed during sync, result dropped");
        if let Err(e) = self.replication.discard_register(register_id).await {
            warn!(register_id = %register_id, error = %e, "Failed to discard unsubscribed register");
        }
    }

    fn apply_failure_threshold(&self, subscription: &mut RegisterSubscription) {
        if subscription.consecutive_failures >= self.config.failed_after_failures
            && subscription.sync_state != RegisterSyncState::Failed
        {
            warn!(
                register_id = %subscription.register_id,
                failures = subscription.consecutive_failures,
                error = subscription.error_message.as_deref().unwrap_or(""),
                "Subscription marked failed, will keep retrying"
            );
            subscription.sync_state = RegisterSyncState::Failed;
        }
    }

    fn failure_delay(&self, subscription: &RegisterSubscription) -> Duration {
        retry_backoff(i64::from(subscription.consecutive_failures), &self.backoff)
    }

    async fn sync_one(&self, claim: Claim) {
        let Claim {
            register_id,
            generation,
            cancel,
        } = claim;

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if !self.release(&register_id, generation) {
                    self.discard_orphan(&register_id).await;
                }
                return;
            }
            permit = self.bulkhead.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    warn!(register_id = %register_id, error = %e, "No sync slot available");
                    self.release(&register_id, generation);
                    return;
                }
            },
        };

        let claimed = self
            .slots
            .get_mut(&register_id)
            .filter(|slot| slot.generation == generation)
            .map(|mut slot| {
                if slot.subscription.sync_state == RegisterSyncState::Subscribing {
                    slot.subscription.sync_state = RegisterSyncState::Syncing;
                }
                slot.subscription.clone()
            });
        let Some(mut subscription) = claimed else {
            return;
        };

        let attempt = match subscription.mode {
            ReplicationMode::FullReplica => self
                .replication
                .pull_full_replica(&mut subscription, &cancel)
                .await
                .map(Attempt::Pull),
            ReplicationMode::ForwardOnly => self
                .replication
                .subscribe_to_live_transactions(&mut subscription, &cancel)
                .await
                .map(Attempt::Feed),
        };

        let now = Instant::now();
        let mut feed = None;
        let (outcome, next_due) = match attempt {
            Err(ReplicationError::Cancelled) => {
                debug!(register_id = %register_id, "Sync cancelled");
                if !self.release(&register_id, generation) {
                    self.discard_orphan(&register_id).await;
                }
                return;
            }
            Err(e) => {
                subscription.mark_failed(e.to_string());
                ("error", now + self.failure_delay(&subscription))
            }
            Ok(Attempt::Pull(PullOutcome::Success { .. })) => {
                ("success", now + self.config.full_replica_refresh_duration())
            }
            Ok(Attempt::Pull(PullOutcome::NoSourcePeers)) | Ok(Attempt::Feed(FeedOutcome::NoSourcePeers)) => {
                subscription.error_message = Some(PullOutcome::NoSourcePeers.message());
                ("no_source_peers", now + self.config.tick_interval_duration())
            }
            Ok(Attempt::Pull(PullOutcome::AllSourcesFailed { .. }))
            | Ok(Attempt::Feed(FeedOutcome::AllSourcesFailed { .. })) => {
                ("all_failed", now + self.failure_delay(&subscription))
            }
            Ok(Attempt::Feed(FeedOutcome::Started(handle))) => {
                feed = Some(handle);
                ("feed_started", now)
            }
        };
        self.apply_failure_threshold(&mut subscription);

        let current = match self.slots.get_mut(&register_id) {
            Some(mut slot) if slot.generation == generation => {
                slot.subscription = subscription.clone();
                slot.next_due = next_due;
                slot.in_flight = false;
                slot.feed = feed.take();
                true
            }
            _ => false,
        };
        if let Some(orphan) = feed {
            orphan.stop();
        }

        metrics::record_sync_attempt(&register_id, outcome);
        if current {
            self.persist_for(generation, &subscription).await;
        } else {
            self.discard_orphan(&register_id).await;
        }
    }

    /// Collect live feeds that have ended and schedule their next attempt.
    async fn reap_feeds(&self) {
        let finished: Vec<(u64, LiveFeedHandle)> = self
            .slots
            .iter_mut()
            .filter_map(|mut slot| {
                if slot.feed.as_ref().map_or(false, |f| f.is_finished()) {
                    let generation = slot.generation;
                    slot.feed.take().map(|feed| (generation, feed))
                } else {
                    None
                }
            })
            .collect();

        for (generation, handle) in finished {
            let summary = handle.join().await;
            let updated = self
                .slots
                .get_mut(&summary.register_id)
                .filter(|slot| slot.generation == generation)
                .map(|mut slot| {
                    let now = Instant::now();
                    let subscription = &mut slot.subscription;
                    subscription.total_transactions_synced =
                        subscription.total_transactions_synced.saturating_add(summary.transactions);
                    let next_due = match &summary.end {
                        FeedEnd::Failed(reason) => {
                            subscription.mark_failed(format!("Live feed from {} failed: {}", summary.peer_id, reason));
                            now + retry_backoff(i64::from(subscription.consecutive_failures), &self.backoff)
                        }
                        FeedEnd::StreamEnded | FeedEnd::Stopped => now,
                    };
                    slot.next_due = next_due;
                    slot.subscription.clone()
                });

            if let Some(mut subscription) = updated {
                self.apply_failure_threshold(&mut subscription);
                if let Some(mut slot) = self.slots.get_mut(&subscription.register_id) {
                    if slot.generation == generation {
                        slot.subscription.sync_state = subscription.sync_state;
                    }
                }
                self.persist_for(generation, &subscription).await;
            }
        }
    }

    /// Stop the loop and every live feed, then close the subscription store.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("Scheduler loop did not stop within drain timeout");
            }
        }

        let feeds: Vec<(u64, LiveFeedHandle)> = self
            .slots
            .iter_mut()
            .filter_map(|mut slot| {
                let generation = slot.generation;
                slot.feed.take().map(|feed| (generation, feed))
            })
            .collect();
        for (_, feed) in &feeds {
            feed.stop();
        }
        for (generation, feed) in feeds {
            let summary = feed.join().await;
            let updated = self
                .slots
                .get_mut(&summary.register_id)
                .filter(|slot| slot.generation == generation)
                .map(|mut slot| {
                    slot.subscription.total_transactions_synced = slot
                        .subscription
                        .total_transactions_synced
                        .saturating_add(summary.transactions);
                    slot.subscription.clone()
                });
            if let Some(subscription) = updated {
                self.persist_for(generation, &subscription).await;
            }
        }

        self.store.close().await;
        info!("Sync scheduler stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}
