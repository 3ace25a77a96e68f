//! Per-peer health tracking.
//!
//! Each peer the node talks to gets a [`CircuitBreaker`] and a heartbeat
//! clock. Any successful exchange with a peer (gossip received, advertisements
//! fetched, snapshot pulled) counts as a heartbeat.
//!
//! # Availability
//!
//! ```text
//! available = breaker permits a call && heartbeat does not recommend failover
//! ```
//!
//! A peer we have never heard a heartbeat from is treated as healthy: absence
//! of evidence is not a failure. Once heard from, going silent for longer than
//! `max_missed × interval` recommends failover. [`PeerHealth::sweep`] reports
//! those peers once and forgets their heartbeat clock, so a peer that was failed
//! over becomes eligible again and is re-judged on its next contact.
//!
//! # Guarded calls
//!
//! [`PeerHealth::call`] runs one network attempt through the peer's breaker
//! with a deadline. A timeout or transport error counts against the breaker; a
//! cancellation does not. Success counts as a heartbeat.
//!
//! # Example
//!
//! ```rust,no_run
//! use register_replication::config::PeerHealthConfig;
//! use register_replication::peer::PeerHealth;
//!
//! let health = PeerHealth::new(&PeerHealthConfig::default());
//! health.record_heartbeat("peer-1");
//! assert!(health.is_available("peer-1"));
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use crate::config::PeerHealthConfig;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::network::NetworkResult;
use crate::resilience::{HeartbeatStatus, HeartbeatValidator};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct PeerEntry {
    breaker: Arc<CircuitBreaker>,
    last_heartbeat: Mutex<Option<Instant>>,
}

/// Point-in-time view of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHealthSnapshot {
    pub peer_id: String,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub since_last_heartbeat: Option<Duration>,
    pub heartbeat: HeartbeatStatus,
}

/// Concurrent map of peer id to breaker and heartbeat clock.
pub struct PeerHealth {
    circuit: CircuitConfig,
    heartbeat: HeartbeatValidator,
    peers: DashMap<String, Arc<PeerEntry>>,
}

impl PeerHealth {
    pub fn new(config: &PeerHealthConfig) -> Self {
        Self {
            circuit: config.circuit_config(),
            heartbeat: HeartbeatValidator::new(config.heartbeat_config()),
            peers: DashMap::new(),
        }
    }

    fn entry(&self, peer_id: &str) -> Arc<PeerEntry> {
        if let Some(existing) = self.peers.get(peer_id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .peers
            .entry(peer_id.to_string())
            .or_insert_with(|| {
                debug!(peer_id = %peer_id, "Tracking peer health");
                Arc::new(PeerEntry {
                    breaker: Arc::new(CircuitBreaker::new(
                        format!("peer:{}", peer_id),
                        self.circuit.clone(),
                    )),
                    last_heartbeat: Mutex::new(None),
                })
            });
        Arc::clone(entry.value())
    }

    /// The peer's circuit breaker, created on first use.
    pub fn breaker(&self, peer_id: &str) -> Arc<CircuitBreaker> {
        Arc::clone(&self.entry(peer_id).breaker)
    }

    pub fn record_heartbeat(&self, peer_id: &str) {
        *self.entry(peer_id).last_heartbeat.lock() = Some(Instant::now());
    }

    /// Time since the last heartbeat, `None` if never heard from.
    pub fn since_last_heartbeat(&self, peer_id: &str) -> Option<Duration> {
        let entry = self.peers.get(peer_id)?;
        let last = *entry.last_heartbeat.lock();
        last.map(|at| at.elapsed())
    }

    pub fn heartbeat_status(&self, peer_id: &str) -> HeartbeatStatus {
        match self.since_last_heartbeat(peer_id) {
            Some(elapsed) => self.heartbeat.evaluate(elapsed),
            None => HeartbeatStatus::Healthy,
        }
    }

    /// True if the peer may be used as a replication source or gossip target.
    pub fn is_available(&self, peer_id: &str) -> bool {
        let Some(entry) = self.peers.get(peer_id).map(|e| Arc::clone(e.value())) else {
            return true;
        };
        if !entry.breaker.is_call_permitted() {
            return false;
        }
        !self.heartbeat_status(peer_id).needs_failover()
    }

    /// Run one attempt against `peer_id` through its breaker, bounded by
    /// `timeout` and aborted by `cancel`.
    pub async fn call<T, Fut>(
        &self,
        peer_id: &str,
        operation: &'static str,
        timeout: Duration,
        cancel: &CancellationToken,
        attempt: Fut,
    ) -> Result<T>
    where
        Fut: Future<Output = NetworkResult<T>>,
    {
        let breaker = self.breaker(peer_id);
        let started = Instant::now();
        let guarded = breaker.call(|| async move {
            match tokio::time::timeout(timeout, attempt).await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(ReplicationError::peer(peer_id, e.0)),
                Err(_) => Err(ReplicationError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        });

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
            result = guarded => result,
        };
        metrics::record_peer_operation_latency(peer_id, operation, started.elapsed());

        match result {
            Ok(value) => {
                self.record_heartbeat(peer_id);
                Ok(value)
            }
            Err(CircuitError::Rejected) => Err(ReplicationError::CircuitOpen {
                peer_id: peer_id.to_string(),
            }),
            Err(CircuitError::Inner(e)) => {
                debug!(peer_id = %peer_id, operation, error = %e, "Peer call failed");
                Err(e)
            }
        }
    }

    pub fn remove_peer(&self, peer_id: &str) -> bool {
        self.peers.remove(peer_id).is_some()
    }

    pub fn open_circuits(&self) -> usize {
        self.peers
            .iter()
            .filter(|e| e.breaker.state() == CircuitState::Open)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn snapshot(&self) -> Vec<PeerHealthSnapshot> {
        let entries: Vec<(String, Arc<PeerEntry>)> = self
            .peers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut out: Vec<PeerHealthSnapshot> = entries
            .into_iter()
            .map(|(peer_id, entry)| {
                let since = (*entry.last_heartbeat.lock()).map(|at| at.elapsed());
                let heartbeat = since
                    .map(|elapsed| self.heartbeat.evaluate(elapsed))
                    .unwrap_or(HeartbeatStatus::Healthy);
                PeerHealthSnapshot {
                    peer_id,
                    circuit_state: entry.breaker.state(),
                    failure_count: entry.breaker.failure_count(),
                    since_last_heartbeat: since,
                    heartbeat,
                }
            })
            .collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    /// Evaluate every peer's heartbeat and return those needing failover.
    ///
    /// Reported peers have their heartbeat clock cleared.
    pub fn sweep(&self) -> Vec<(String, HeartbeatStatus)> {
        let mut failovers = Vec::new();
        for entry in self.peers.iter() {
            let mut last = entry.last_heartbeat.lock();
            let Some(at) = *last else { continue };
            let status = self.heartbeat.evaluate(at.elapsed());
            match status {
                HeartbeatStatus::Healthy => metrics::record_heartbeat(entry.key(), "healthy"),
                HeartbeatStatus::TimedOut { missed } => {
                    metrics::record_heartbeat(entry.key(), "timed_out");
                    debug!(peer_id = %entry.key(), missed, "Peer heartbeat overdue");
                }
                HeartbeatStatus::FailoverRecommended { missed } => {
                    metrics::record_heartbeat(entry.key(), "failover");
                    metrics::record_failover(entry.key());
                    warn!(peer_id = %entry.key(), missed, "Peer missed heartbeats, failing over");
                    *last = None;
                    failovers.push((entry.key().clone(), status));
                }
            }
        }
        failovers.sort_by(|a, b| a.0.cmp(&b.0));
        failovers
    }
}
