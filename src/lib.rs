//! # Register Replication
//!
//! Peer replication and dissemination for a permissioned ledger node.
//!
//! ## Architecture
//!
//! The node sits between the daemon's peer layer and the local register
//! store, spreading new transactions by gossip and keeping subscribed
//! registers in sync with the peers that hold them:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           ReplicationNode                                 │
//! │                                                                           │
//! │  ┌──────────────┐   ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ GossipEngine │──►│  PeerHealth  │◄───│ ReplicationService           │  │
//! │  │ (seen-set,   │   │ (breaker +   │    │ (full pull / live feed)      │  │
//! │  │  Bloom/peer) │   │  heartbeat)  │    └──────────────────────────────┘  │
//! │  └──────────────┘   └──────────────┘          ▲               │           │
//! │                                               │               ▼           │
//! │  ┌─────────────────────┐   ┌────────────────────┐   ┌──────────────────┐  │
//! │  │ AdvertisementCatalog│◄──│   SyncScheduler    │   │  RegisterCache   │  │
//! │  │ (Redis, best-effort)│   │ (SQLite, durable)  │   │ (bounded)        │  │
//! │  └─────────────────────┘   └────────────────────┘   └──────────────────┘  │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Two Ways Data Moves
//!
//! 1. **Gossip**: every new transaction is announced to a random fanout of
//!    peers, deduplicated by a seen-set and pruned by per-peer Bloom filters.
//! 2. **Replication**: subscribed registers are either pulled in full from a
//!    peer advertising a full replica, or followed through a live feed.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use register_replication::network::{NoOpTransport, StaticPeerDirectory};
//! use register_replication::{NodeConfig, ReplicationMode, ReplicationNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = NodeConfig::default();
//!     let node = ReplicationNode::new(
//!         config,
//!         Arc::new(StaticPeerDirectory::new()),
//!         Arc::new(NoOpTransport),
//!     );
//!     node.start().await.expect("Failed to start");
//!
//!     node.subscribe_to_register("reg-1", ReplicationMode::FullReplica)
//!         .await
//!         .expect("Failed to subscribe");
//!
//!     // Node runs until shutdown signal
//!     node.shutdown().await;
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod circuit_breaker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gossip;
pub mod metrics;
pub mod network;
pub mod peer;
pub mod replication;
pub mod resilience;
pub mod scheduler;
pub mod subscription_store;
pub mod types;

// Re-exports for convenience
pub use cache::RegisterCache;
pub use catalog::AdvertisementCatalog;
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
pub use config::{CatalogConfig, GossipConfig, NodeConfig, SchedulerConfig};
pub use coordinator::{GossipOutcome, HealthCheck, NodeState, RelayReport, ReplicationNode};
pub use error::{ReplicationError, Result};
pub use gossip::{GossipDecision, GossipEngine};
pub use network::{PeerDirectory, PeerTransport};
pub use replication::{FeedOutcome, PullOutcome, ReplicationService};
pub use scheduler::SyncScheduler;
pub use subscription_store::SubscriptionStore;
pub use types::{
    NetworkRegisterSummary, PeerRegisterInfo, RegisterSubscription, RegisterSyncState, ReplicationMode,
    TransactionNotification,
};
