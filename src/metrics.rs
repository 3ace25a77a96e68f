//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Gossip decisions and fan-out sends
//! - Peer circuit breakers and heartbeats
//! - Advertisement catalog store health
//! - Full-replica pulls and live feeds
//! - Subscription scheduler progress
//! - Register cache evictions
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `register_replication_` and follow Prometheus
//! conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use register_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_gossip_decision("forwarded");
//! metrics::record_pull("reg-1", "success", Duration::from_millis(120));
//! ```

use crate::circuit_breaker::CircuitState;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Gossip
// =============================================================================

/// Record the outcome of a should-gossip check.
///
/// `decision` is one of `forwarded`, `duplicate`, `expired`, `max_rounds`.
pub fn record_gossip_decision(decision: &str) {
    counter!("register_replication_gossip_decisions_total", "decision" => decision.to_string())
        .increment(1);
}

/// Record a notification send to a peer.
pub fn record_gossip_send(peer_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "register_replication_gossip_sends_total",
        "peer_id" => peer_id.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a send skipped because the peer's filter already covers the transaction.
pub fn record_gossip_filtered(count: usize) {
    if count > 0 {
        counter!("register_replication_gossip_filtered_total").increment(count as u64);
    }
}

/// Record a send skipped by the outbound rate limiter.
pub fn record_gossip_rate_limited() {
    counter!("register_replication_gossip_rate_limited_total").increment(1);
}

/// Gauge for number of transactions tracked in the seen-set.
pub fn set_gossip_seen_entries(count: usize) {
    gauge!("register_replication_gossip_seen_entries").set(count as f64);
}

/// Record a seen-set cleanup pass.
pub fn record_gossip_cleanup(removed: usize) {
    counter!("register_replication_gossip_cleanup_runs_total").increment(1);
    if removed > 0 {
        counter!("register_replication_gossip_cleanup_removed_total").increment(removed as u64);
    }
}

// =============================================================================
// Peer Health
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "register_replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: CircuitState) {
    gauge!("register_replication_circuit_state", "circuit" => circuit_name.to_string())
        .set(state as u8 as f64);
}

/// Record a heartbeat evaluation.
pub fn record_heartbeat(peer_id: &str, status: &str) {
    counter!(
        "register_replication_heartbeats_total",
        "peer_id" => peer_id.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a failover recommendation for a peer.
pub fn record_failover(peer_id: &str) {
    counter!("register_replication_failovers_total", "peer_id" => peer_id.to_string()).increment(1);
}

/// Record peer operation latency by operation type.
pub fn record_peer_operation_latency(peer_id: &str, operation: &str, duration: Duration) {
    histogram!(
        "register_replication_peer_operation_duration_seconds",
        "peer_id" => peer_id.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Gauge for number of healthy peers.
pub fn set_healthy_peers(count: usize) {
    gauge!("register_replication_healthy_peers").set(count as f64);
}

// =============================================================================
// Advertisement Catalog
// =============================================================================

/// Record an advertisement store operation.
pub fn record_catalog_store_op(operation: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "register_replication_catalog_store_ops_total",
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Set whether the catalog is running without its backing store.
pub fn set_catalog_degraded(degraded: bool) {
    gauge!("register_replication_catalog_degraded").set(if degraded { 1.0 } else { 0.0 });
}

/// Gauge for catalog sizes.
pub fn set_catalog_size(local_registers: usize, remote_peers: usize) {
    gauge!("register_replication_catalog_local_registers").set(local_registers as f64);
    gauge!("register_replication_catalog_remote_peers").set(remote_peers as f64);
}

/// Record advertisements received from a peer.
pub fn record_advertisements_received(peer_id: &str, count: usize) {
    counter!(
        "register_replication_advertisements_received_total",
        "peer_id" => peer_id.to_string()
    )
    .increment(count as u64);
}

// =============================================================================
// Replication
// =============================================================================

/// Record a full-replica pull.
///
/// `outcome` is one of `success`, `no_source_peers`, `all_sources_failed`.
pub fn record_pull(register_id: &str, outcome: &str, duration: Duration) {
    counter!(
        "register_replication_pulls_total",
        "register_id" => register_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("register_replication_pull_duration_seconds", "outcome" => outcome.to_string())
        .record(duration.as_secs_f64());
}

/// Record a live feed start attempt.
pub fn record_live_feed(register_id: &str, outcome: &str) {
    counter!(
        "register_replication_live_feeds_total",
        "register_id" => register_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record transactions applied to the cache by replication.
pub fn record_transactions_replicated(register_id: &str, count: usize) {
    if count > 0 {
        counter!(
            "register_replication_transactions_replicated_total",
            "register_id" => register_id.to_string()
        )
        .increment(count as u64);
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Record a scheduler sync attempt.
pub fn record_sync_attempt(register_id: &str, outcome: &str) {
    counter!(
        "register_replication_sync_attempts_total",
        "register_id" => register_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Gauge for number of subscriptions in a given state.
pub fn set_subscriptions_in_state(state: &str, count: usize) {
    gauge!("register_replication_subscriptions", "state" => state.to_string()).set(count as f64);
}

/// Record subscription persistence.
pub fn record_subscription_persist(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("register_replication_subscription_persists_total", "status" => status).increment(1);
}

/// Record subscription SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn subscription_retries_total(operation: &str) {
    counter!(
        "register_replication_subscription_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a scheduler tick.
pub fn record_scheduler_tick(due: usize, duration: Duration) {
    counter!("register_replication_scheduler_ticks_total").increment(1);
    counter!("register_replication_scheduler_due_total").increment(due as u64);
    histogram!("register_replication_scheduler_tick_duration_seconds")
        .record(duration.as_secs_f64());
}

// =============================================================================
// Cache
// =============================================================================

/// Record cache evictions. `kind` is `transaction` or `docket`.
pub fn record_cache_evictions(kind: &str, count: usize) {
    if count > 0 {
        counter!("register_replication_cache_evictions_total", "kind" => kind.to_string())
            .increment(count as u64);
    }
}

// =============================================================================
// Node
// =============================================================================

/// Gauge for node state.
pub fn set_node_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("register_replication_node_state").set(value);
}

/// Record a maintenance cycle.
pub fn record_maintenance_cycle(gossip_removed: usize, peers_pruned: usize, duration: Duration) {
    counter!("register_replication_maintenance_cycles_total").increment(1);
    counter!("register_replication_maintenance_peers_pruned_total").increment(peers_pruned as u64);
    histogram!("register_replication_maintenance_cycle_duration_seconds")
        .record(duration.as_secs_f64());
    record_gossip_cleanup(gossip_removed);
}

/// Record errors by component and type.
pub fn record_error(component: &str, error_type: &str) {
    counter!(
        "register_replication_errors_total",
        "component" => component.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics crate uses global state with a no-op recorder in tests.
    // These only verify the functions accept edge-case inputs.

    #[test]
    fn test_gossip_metrics() {
        record_gossip_decision("forwarded");
        record_gossip_decision("duplicate");
        record_gossip_send("peer-1", true);
        record_gossip_send("", false);
        record_gossip_filtered(0);
        record_gossip_filtered(3);
        record_gossip_rate_limited();
        set_gossip_seen_entries(0);
        record_gossip_cleanup(0);
        record_gossip_cleanup(12);
    }

    #[test]
    fn test_circuit_metrics_all_states() {
        record_circuit_call("peer-1", "success");
        record_circuit_call("peer-1", "rejected");
        set_circuit_state("peer-1", CircuitState::Closed);
        set_circuit_state("peer-1", CircuitState::HalfOpen);
        set_circuit_state("peer-1", CircuitState::Open);
    }

    #[test]
    fn test_peer_health_metrics() {
        record_heartbeat("peer-1", "healthy");
        record_heartbeat("peer-1", "timed_out");
        record_failover("peer-1");
        record_peer_operation_latency("peer-1", "fetch_register", Duration::from_millis(25));
        set_healthy_peers(0);
    }

    #[test]
    fn test_catalog_metrics() {
        record_catalog_store_op("SADD", true);
        record_catalog_store_op("SMEMBERS", false);
        set_catalog_degraded(true);
        set_catalog_degraded(false);
        set_catalog_size(3, 7);
        record_advertisements_received("peer-1", 0);
    }

    #[test]
    fn test_replication_and_scheduler_metrics() {
        record_pull("reg-1", "success", Duration::from_millis(50));
        record_pull("reg-1", "no_source_peers", Duration::ZERO);
        record_live_feed("reg-1", "started");
        record_transactions_replicated("reg-1", 0);
        record_transactions_replicated("reg-1", 10);
        record_sync_attempt("reg-1", "failed");
        set_subscriptions_in_state("Active", 4);
        record_subscription_persist(true);
        subscription_retries_total("upsert");
        record_scheduler_tick(2, Duration::from_millis(5));
    }

    #[test]
    fn test_node_metrics() {
        for state in ["Created", "Starting", "Running", "ShuttingDown", "Stopped", "Failed", "?"] {
            set_node_state(state);
        }
        record_cache_evictions("transaction", 5);
        record_cache_evictions("docket", 0);
        record_maintenance_cycle(1, 0, Duration::from_millis(3));
        record_error("catalog", "store");
    }
}
