//! Configuration for the register replication node.
//!
//! This module defines all configuration types needed to run a
//! [`ReplicationNode`](crate::ReplicationNode). Configuration can be built
//! programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use register_replication::config::{NodeConfig, CatalogConfig};
//!
//! let config = NodeConfig {
//!     local_node_id: "node-1".into(),
//!     catalog: CatalogConfig {
//!         redis_url: Some("redis://127.0.0.1:6379".into()),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert_eq!(config.gossip.fanout, 3);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! NodeConfig
//! ├── local_node_id: String            # This node's peer id (origin of gossip)
//! ├── gossip: GossipConfig             # fanout, rounds, TTL, bloom sizing
//! ├── peer_health: PeerHealthConfig    # circuit breaker + heartbeat windows
//! ├── cache: CacheConfig               # per-register bounds
//! ├── catalog: CatalogConfig           # Redis write-through + lease TTL
//! ├── replication: ReplicationConfig   # per-attempt timeouts
//! ├── scheduler: SchedulerConfig       # loop cadence + retry backoff
//! ├── subscriptions: SubscriptionStoreConfig  # SQLite persistence
//! └── maintenance: MaintenanceConfig   # GC, lease refresh, heartbeat sweep
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! local_node_id: "ledger.node.dublin-1"
//!
//! gossip:
//!   fanout: 4
//!   state_max_age: "30m"
//!
//! catalog:
//!   redis_url: "redis://127.0.0.1:6379"
//!   index_ttl_sec: 300
//!
//! scheduler:
//!   tick_interval: "5s"
//!
//! subscriptions:
//!   sqlite_path: "/var/lib/ledger/subscriptions.db"
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::resilience::{BackoffPolicy, HeartbeatConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn parse_duration_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from daemon to ReplicationNode::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationNode::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The identity of the local node.
    /// Stamped as `OriginPeerId` on transactions this node originates.
    pub local_node_id: String,

    #[serde(default)]
    pub gossip: GossipConfig,

    #[serde(default)]
    pub peer_health: PeerHealthConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub replication: ReplicationConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub subscriptions: SubscriptionStoreConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_node_id: "local.dev.node.default".to_string(),
            gossip: GossipConfig::default(),
            peer_health: PeerHealthConfig::default(),
            cache: CacheConfig::default(),
            catalog: CatalogConfig::default(),
            replication: ReplicationConfig::default(),
            scheduler: SchedulerConfig::default(),
            subscriptions: SubscriptionStoreConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Create a minimal config for testing: no Redis, SQLite in memory,
    /// fast scheduler ticks.
    pub fn for_testing(local_node_id: &str) -> Self {
        Self {
            local_node_id: local_node_id.to_string(),
            scheduler: SchedulerConfig {
                tick_interval: "50ms".to_string(),
                ..Default::default()
            },
            subscriptions: SubscriptionStoreConfig::in_memory(),
            ..Default::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GossipConfig: epidemic dissemination
// ═══════════════════════════════════════════════════════════════════════════════

/// Gossip dissemination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Number of peers each round forwards to.
    #[serde(default = "default_fanout")]
    pub fanout: usize,

    /// Notifications at or beyond this round are not re-gossiped.
    #[serde(default = "default_max_gossip_rounds")]
    pub max_gossip_rounds: u32,

    /// Hop budget stamped on notifications this node originates.
    #[serde(default = "default_ttl")]
    pub default_ttl: i32,

    /// Seen-set entries older than this are garbage-collected.
    #[serde(default = "default_state_max_age")]
    pub state_max_age: String,

    /// Payloads up to this size travel inline (`HasFullData`).
    #[serde(default = "default_full_data_threshold_bytes")]
    pub full_data_threshold_bytes: usize,

    /// Expected distinct hashes per peer filter.
    #[serde(default = "default_bloom_expected_items")]
    pub bloom_expected_items: usize,

    /// Target false-positive rate for per-peer filters.
    #[serde(default = "default_bloom_false_positive_rate")]
    pub bloom_false_positive_rate: f64,

    /// Deadline for a single outbound notification.
    #[serde(default = "default_send_timeout")]
    pub send_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (outbound fan-out)
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting of outbound notification sends.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum sends per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_fanout() -> usize {
    3
}

fn default_max_gossip_rounds() -> u32 {
    10
}

fn default_ttl() -> i32 {
    3600
}

fn default_state_max_age() -> String {
    "1h".to_string()
}

fn default_full_data_threshold_bytes() -> usize {
    4096
}

fn default_bloom_expected_items() -> usize {
    10_000
}

fn default_bloom_false_positive_rate() -> f64 {
    0.01
}

fn default_send_timeout() -> String {
    "5s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    1000
}

fn default_rate_limit_burst() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fanout: 3,
            max_gossip_rounds: 10,
            default_ttl: 3600,
            state_max_age: "1h".to_string(),
            full_data_threshold_bytes: 4096,
            bloom_expected_items: 10_000,
            bloom_false_positive_rate: 0.01,
            send_timeout: "5s".to_string(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 1000,
            rate_limit_burst: 100,
        }
    }
}

impl GossipConfig {
    /// Parse `state_max_age`, falling back to one hour.
    pub fn state_max_age_duration(&self) -> Duration {
        parse_duration_or(&self.state_max_age, Duration::from_secs(3600))
    }

    /// Parse `send_timeout`, falling back to five seconds.
    pub fn send_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.send_timeout, Duration::from_secs(5))
    }

    /// Rate limit configuration for outbound sends.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PeerHealthConfig: circuit breaker and heartbeat windows
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-peer failure isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerHealthConfig {
    /// Number of consecutive failures before a peer's circuit opens.
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,

    /// How long an open circuit waits before allowing a trial call (seconds).
    #[serde(default = "default_circuit_reset_timeout_sec")]
    pub circuit_reset_timeout_sec: u64,

    /// Expected heartbeat cadence (seconds).
    #[serde(default = "default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,

    /// Silence longer than this marks a peer as timed out (seconds).
    #[serde(default = "default_heartbeat_timeout_sec")]
    pub heartbeat_timeout_sec: u64,

    /// Consecutive missed heartbeats before failover is recommended.
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_reset_timeout_sec() -> u64 {
    60
}

fn default_heartbeat_interval_sec() -> u64 {
    30
}

fn default_heartbeat_timeout_sec() -> u64 {
    30
}

fn default_max_missed_heartbeats() -> u32 {
    2
}

impl Default for PeerHealthConfig {
    fn default() -> Self {
        Self {
            circuit_failure_threshold: 5,
            circuit_reset_timeout_sec: 60,
            heartbeat_interval_sec: 30,
            heartbeat_timeout_sec: 30,
            max_missed_heartbeats: 2,
        }
    }
}

impl PeerHealthConfig {
    /// Breaker settings applied to every peer.
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_reset_timeout_sec),
        }
    }

    /// Heartbeat validator settings.
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.heartbeat_interval_sec),
            timeout: Duration::from_secs(self.heartbeat_timeout_sec),
            max_missed: self.max_missed_heartbeats,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CacheConfig: bounded per-register cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Register cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum transactions retained per register (highest versions win).
    #[serde(default = "default_max_transactions")]
    pub max_transactions_per_register: usize,

    /// Maximum dockets retained per register.
    #[serde(default = "default_max_dockets")]
    pub max_dockets_per_register: usize,
}

fn default_max_transactions() -> usize {
    1000
}

fn default_max_dockets() -> usize {
    100
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_transactions_per_register: 1000,
            max_dockets_per_register: 100,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CatalogConfig: advertisement write-through
// ═══════════════════════════════════════════════════════════════════════════════

/// Advertisement catalog persistence.
///
/// With `redis_url` unset the catalog runs purely in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Redis URL for the durable advertisement store.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Key prefix (`{prefix}:local:...`, `{prefix}:remote:...`).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Lease applied to index sets (seconds).
    #[serde(default = "default_index_ttl_sec")]
    pub index_ttl_sec: u64,

    /// Deadline for establishing the Redis connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_key_prefix() -> String {
    "advert".to_string()
}

fn default_index_ttl_sec() -> u64 {
    300 // 5 minutes
}

fn default_connect_timeout() -> String {
    "5s".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "advert".to_string(),
            index_ttl_sec: 300,
            connect_timeout: "5s".to_string(),
        }
    }
}

impl CatalogConfig {
    /// Lease applied to index sets.
    pub fn index_ttl(&self) -> Duration {
        Duration::from_secs(self.index_ttl_sec)
    }

    /// Parse `connect_timeout`, falling back to five seconds.
    pub fn connect_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationConfig: per-attempt deadlines
// ═══════════════════════════════════════════════════════════════════════════════

/// Deadlines for network attempts made by the replication service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Deadline for pulling a full register snapshot from one peer.
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: String,

    /// Deadline for opening a live transaction stream.
    #[serde(default = "default_stream_open_timeout")]
    pub stream_open_timeout: String,

    /// Deadline for an advertisement exchange.
    #[serde(default = "default_exchange_timeout")]
    pub exchange_timeout: String,

    /// Visibility of the advertisement created when a register is first
    /// replicated. An existing local advertisement keeps its own flag.
    #[serde(default = "default_true")]
    pub advertise_public: bool,
}

fn default_pull_timeout() -> String {
    "30s".to_string()
}

fn default_stream_open_timeout() -> String {
    "10s".to_string()
}

fn default_exchange_timeout() -> String {
    "10s".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            pull_timeout: "30s".to_string(),
            stream_open_timeout: "10s".to_string(),
            exchange_timeout: "10s".to_string(),
            advertise_public: true,
        }
    }
}

impl ReplicationConfig {
    pub fn pull_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.pull_timeout, Duration::from_secs(30))
    }

    pub fn stream_open_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.stream_open_timeout, Duration::from_secs(10))
    }

    pub fn exchange_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.exchange_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SchedulerConfig: subscription loop
// ═══════════════════════════════════════════════════════════════════════════════

/// Register sync scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the loop visits subscriptions.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,

    /// How often a fully replicated register is re-pulled to catch up.
    #[serde(default = "default_full_replica_refresh")]
    pub full_replica_refresh: String,

    /// Maximum sync attempts running at once.
    #[serde(default = "default_max_concurrent_syncs")]
    pub max_concurrent_syncs: usize,

    /// Consecutive failures after which a subscription reports `Failed`.
    #[serde(default = "default_failed_after_failures")]
    pub failed_after_failures: u32,

    /// First retry delay after a failure (milliseconds).
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Growth factor between retries.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Ceiling on the retry delay (seconds).
    #[serde(default = "default_backoff_max_sec")]
    pub backoff_max_sec: u64,
}

fn default_tick_interval() -> String {
    "5s".to_string()
}

fn default_full_replica_refresh() -> String {
    "5m".to_string()
}

fn default_max_concurrent_syncs() -> usize {
    8
}

fn default_failed_after_failures() -> u32 {
    5
}

fn default_backoff_initial_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_sec() -> u64 {
    60
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: "5s".to_string(),
            full_replica_refresh: "5m".to_string(),
            max_concurrent_syncs: 8,
            failed_after_failures: 5,
            backoff_initial_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_sec: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval_duration(&self) -> Duration {
        parse_duration_or(&self.tick_interval, Duration::from_secs(5))
    }

    pub fn full_replica_refresh_duration(&self) -> Duration {
        parse_duration_or(&self.full_replica_refresh, Duration::from_secs(300))
    }

    /// Retry backoff applied to failing subscriptions.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.backoff_initial_ms),
            multiplier: self.backoff_multiplier,
            max: Duration::from_secs(self.backoff_max_sec),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SubscriptionStoreConfig: SQLite persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Subscription persistence configuration.
///
/// The SQLite database is the source of truth for which registers this
/// node wants after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionStoreConfig {
    /// Path to the SQLite database.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

impl Default for SubscriptionStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "register_subscriptions.db".to_string(),
            wal_mode: true,
        }
    }
}

impl SubscriptionStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MaintenanceConfig: periodic housekeeping
// ═══════════════════════════════════════════════════════════════════════════════

/// Background housekeeping: seen-set GC, lease refresh, heartbeat sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often housekeeping runs (seconds).
    #[serde(default = "default_maintenance_interval_sec")]
    pub interval_sec: u64,
}

fn default_maintenance_interval_sec() -> u64 {
    30
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 30,
        }
    }
}

impl MaintenanceConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
