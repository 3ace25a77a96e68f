//! Node state and report types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ shutdown()                   │ (stores opened, scheduler running)
//!    ↓                              ↓
//! Stopped ←──── ShuttingDown ←── Running
//!
//! Starting ──(subscription store unreadable)──→ Failed
//! ```
//!
//! - **Created**: after `ReplicationNode::new()`. Gossip can already be
//!   handled; subscriptions cannot.
//! - **Starting**: opening the subscription store, attaching the
//!   advertisement store, restoring subscriptions.
//! - **Running**: scheduler and maintenance tasks active.
//! - **ShuttingDown**: background tasks and live feeds are being stopped.
//! - **Stopped**: clean shutdown. Safe to drop.
//! - **Failed**: startup could not restore subscriptions.

use crate::cache::CacheStats;
use crate::catalog::CatalogStats;
use crate::gossip::{GossipDecision, GossipStats};
use crate::peer::PeerHealthSnapshot;
use crate::scheduler::SchedulerStats;

/// Lifecycle state of a [`ReplicationNode`](super::ReplicationNode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "Created"),
            NodeState::Starting => write!(f, "Starting"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
            NodeState::Failed => write!(f, "Failed"),
        }
    }
}

/// Point-in-time health snapshot. Collected without I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub local_node_id: String,
    pub state: NodeState,
    /// Running: subscriptions are being served.
    pub ready: bool,
    /// Ready, and the advertisement store is reachable.
    pub healthy: bool,
    pub peers_known: usize,
    pub peers_available: usize,
    pub peers_circuit_open: usize,
    pub peers: Vec<PeerHealthSnapshot>,
    pub catalog: CatalogStats,
    pub gossip: GossipStats,
    pub cache: CacheStats,
    pub subscriptions: SchedulerStats,
}

/// What happened to the relay of one accepted notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Peers the notification was delivered to.
    pub delivered: Vec<String>,
    /// Peers the send failed for.
    pub failed: Vec<String>,
    /// Candidates skipped because their Bloom filter already holds the hash.
    pub filtered: usize,
    /// Sends dropped by the outbound rate limit.
    pub rate_limited: usize,
}

/// Result of handling one inbound notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GossipOutcome {
    /// Dropped before dedup: banned sender or corrupt payload.
    Rejected { reason: &'static str },
    /// Already seen.
    Duplicate,
    /// First sighting. `relay` is empty unless `decision` is `Forward`.
    Accepted {
        decision: GossipDecision,
        relay: RelayReport,
    },
}

impl GossipOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn relay(&self) -> Option<&RelayReport> {
        match self {
            Self::Accepted { relay, .. } => Some(relay),
            _ => None,
        }
    }
}

/// Result of an advertisement exchange with one peer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeReport {
    pub peer_id: String,
    pub advertisements: usize,
    /// Registers where the peer is ahead of us.
    pub lagging: Vec<String>,
    /// Lagging registers whose subscription was made due.
    pub triggered: Vec<String>,
}

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub gossip_removed: usize,
    pub peers_pruned: Vec<String>,
    pub failovers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_display() {
        assert_eq!(NodeState::Created.to_string(), "Created");
        assert_eq!(NodeState::Starting.to_string(), "Starting");
        assert_eq!(NodeState::Running.to_string(), "Running");
        assert_eq!(NodeState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(NodeState::Stopped.to_string(), "Stopped");
        assert_eq!(NodeState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_gossip_outcome_accessors() {
        let accepted = GossipOutcome::Accepted {
            decision: GossipDecision::Forward,
            relay: RelayReport {
                delivered: vec!["peer-1".into()],
                ..Default::default()
            },
        };
        assert!(accepted.is_accepted());
        assert_eq!(accepted.relay().unwrap().delivered, vec!["peer-1"]);

        assert!(!GossipOutcome::Duplicate.is_accepted());
        assert!(GossipOutcome::Rejected { reason: "banned" }.relay().is_none());
    }
}
