//! Domain types shared across the node.
//!
//! Everything here is plain data: the gossip wire unit, advertisement and
//! subscription records, and the transaction/docket shapes held by the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Hop budget stamped on notifications when none is configured.
pub const DEFAULT_NOTIFICATION_TTL: i32 = 3600;

// ═══════════════════════════════════════════════════════════════════════════════
// Gossip wire unit
// ═══════════════════════════════════════════════════════════════════════════════

/// Announcement of a transaction, forwarded peer to peer.
///
/// Serialized as JSON with PascalCase field names; `TransactionData` travels
/// hex-encoded. `GossipRound`/`HopCount` only grow and `TTL` only shrinks
/// as the notification is re-propagated. The identity fields never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransactionNotification {
    pub transaction_id: String,
    pub origin_peer_id: String,
    pub data_hash: String,
    pub data_size: u64,
    #[serde(default)]
    pub gossip_round: u32,
    #[serde(default)]
    pub hop_count: u32,
    #[serde(rename = "TTL", default = "default_ttl")]
    pub ttl: i32,
    #[serde(default)]
    pub has_full_data: bool,
    #[serde(default, with = "hex_bytes_opt", skip_serializing_if = "Option::is_none")]
    pub transaction_data: Option<Vec<u8>>,
    pub timestamp: DateTime<Utc>,
}

fn default_ttl() -> i32 {
    DEFAULT_NOTIFICATION_TTL
}

impl TransactionNotification {
    /// Build a round-zero notification for a transaction this node originates.
    ///
    /// `DataHash` is the lowercase hex SHA-256 of `data`. The payload is only
    /// carried inline when `include_full_data` is set.
    pub fn new(
        transaction_id: impl Into<String>,
        origin_peer_id: impl Into<String>,
        data: &[u8],
        include_full_data: bool,
        ttl: i32,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            origin_peer_id: origin_peer_id.into(),
            data_hash: content_hash(data),
            data_size: data.len() as u64,
            gossip_round: 0,
            hop_count: 0,
            ttl,
            has_full_data: include_full_data,
            transaction_data: include_full_data.then(|| data.to_vec()),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Lowercase hex SHA-256 of a payload.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

mod hex_bytes_opt {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sync state and replication mode
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a register stands locally, as advertised or subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegisterSyncState {
    /// Subscription recorded, no attempt made yet.
    Subscribing,
    /// A pull or feed is in progress.
    Syncing,
    /// Receiving live transactions.
    Active,
    /// Holds the full history and can serve it.
    FullyReplicated,
    /// Repeated failures; still retried.
    Failed,
}

impl RegisterSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribing => "Subscribing",
            Self::Syncing => "Syncing",
            Self::Active => "Active",
            Self::FullyReplicated => "FullyReplicated",
            Self::Failed => "Failed",
        }
    }

    pub fn can_serve_full_replica(&self) -> bool {
        matches!(self, Self::FullyReplicated)
    }
}

impl fmt::Display for RegisterSyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RegisterSyncState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Subscribing" => Ok(Self::Subscribing),
            "Syncing" => Ok(Self::Syncing),
            "Active" => Ok(Self::Active),
            "FullyReplicated" => Ok(Self::FullyReplicated),
            "Failed" => Ok(Self::Failed),
            other => Err(format!("unknown sync state '{}'", other)),
        }
    }
}

/// How a subscribed register is kept up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Pull the complete history from a peer that holds it.
    FullReplica,
    /// Only follow transactions from now on.
    ForwardOnly,
}

impl ReplicationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullReplica => "FullReplica",
            Self::ForwardOnly => "ForwardOnly",
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FullReplica" => Ok(Self::FullReplica),
            "ForwardOnly" => Ok(Self::ForwardOnly),
            other => Err(format!("unknown replication mode '{}'", other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Advertisements
// ═══════════════════════════════════════════════════════════════════════════════

/// What this node claims about a register it holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocalRegisterAdvertisement {
    pub register_id: String,
    pub sync_state: RegisterSyncState,
    pub latest_version: u64,
    pub latest_docket_version: u64,
    pub is_public: bool,
    pub last_updated: DateTime<Utc>,
}

impl LocalRegisterAdvertisement {
    /// True if applying these values would change the advertisement.
    pub fn differs_from(
        &self,
        sync_state: RegisterSyncState,
        latest_version: u64,
        latest_docket_version: u64,
        is_public: bool,
    ) -> bool {
        self.sync_state != sync_state
            || self.latest_version != latest_version
            || self.latest_docket_version != latest_docket_version
            || self.is_public != is_public
    }
}

/// A register as advertised by a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PeerRegisterInfo {
    pub register_id: String,
    pub sync_state: RegisterSyncState,
    pub latest_version: u64,
    pub latest_docket_version: u64,
    pub is_public: bool,
    pub last_updated: DateTime<Utc>,
    /// Derived from `sync_state`; recomputed on receipt.
    #[serde(default)]
    pub can_serve_full_replica: bool,
}

impl PeerRegisterInfo {
    pub fn new(
        register_id: impl Into<String>,
        sync_state: RegisterSyncState,
        latest_version: u64,
        latest_docket_version: u64,
        is_public: bool,
    ) -> Self {
        Self {
            register_id: register_id.into(),
            sync_state,
            latest_version,
            latest_docket_version,
            is_public,
            last_updated: Utc::now(),
            can_serve_full_replica: sync_state.can_serve_full_replica(),
        }
    }

    /// Re-derive the capability flag from the state, ignoring what the peer sent.
    pub fn normalized(mut self) -> Self {
        self.can_serve_full_replica = self.sync_state.can_serve_full_replica();
        self
    }
}

impl From<&LocalRegisterAdvertisement> for PeerRegisterInfo {
    fn from(ad: &LocalRegisterAdvertisement) -> Self {
        Self {
            register_id: ad.register_id.clone(),
            sync_state: ad.sync_state,
            latest_version: ad.latest_version,
            latest_docket_version: ad.latest_docket_version,
            is_public: ad.is_public,
            last_updated: ad.last_updated,
            can_serve_full_replica: ad.sync_state.can_serve_full_replica(),
        }
    }
}

/// One row of the network-wide register view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkRegisterSummary {
    pub register_id: String,
    pub peer_count: usize,
    pub latest_version: u64,
    pub full_replica_peer_count: usize,
    pub is_public: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subscriptions
// ═══════════════════════════════════════════════════════════════════════════════

/// This node's intent to hold a register, and how that is going.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSubscription {
    pub register_id: String,
    pub mode: ReplicationMode,
    pub sync_state: RegisterSyncState,
    pub consecutive_failures: u32,
    pub error_message: Option<String>,
    pub total_transactions_synced: u64,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl RegisterSubscription {
    pub fn new(register_id: impl Into<String>, mode: ReplicationMode) -> Self {
        Self {
            register_id: register_id.into(),
            mode,
            sync_state: RegisterSyncState::Subscribing,
            consecutive_failures: 0,
            error_message: None,
            total_transactions_synced: 0,
            created_at: Utc::now(),
            last_synced_at: None,
            last_attempt_at: None,
        }
    }

    /// Record a successful sync landing in `state`.
    pub fn mark_synced(&mut self, state: RegisterSyncState, transactions: u64) {
        self.sync_state = state;
        self.consecutive_failures = 0;
        self.error_message = None;
        self.total_transactions_synced = self.total_transactions_synced.saturating_add(transactions);
        self.last_synced_at = Some(Utc::now());
    }

    /// Record a failed attempt.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.error_message = Some(message.into());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Register data
// ═══════════════════════════════════════════════════════════════════════════════

/// A transaction held by the register cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CachedTransaction {
    pub transaction_id: String,
    pub register_id: String,
    pub version: u64,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl CachedTransaction {
    pub fn new(
        transaction_id: impl Into<String>,
        register_id: impl Into<String>,
        version: u64,
        data: Vec<u8>,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            register_id: register_id.into(),
            version,
            data,
        }
    }
}

/// A docket (sealed batch of transactions) held by the register cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CachedDocket {
    pub register_id: String,
    pub version: u64,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub docket_hash: String,
    pub transaction_ids: Vec<String>,
}

/// Everything a peer returns for a full-replica pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterSnapshot {
    pub register_id: String,
    pub transactions: Vec<CachedTransaction>,
    pub dockets: Vec<CachedDocket>,
}

impl RegisterSnapshot {
    pub fn latest_version(&self) -> u64 {
        self.transactions.iter().map(|t| t.version).max().unwrap_or(0)
    }

    pub fn latest_docket_version(&self) -> u64 {
        self.dockets.iter().map(|d| d.version).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_new_hashes_payload() {
        let n = TransactionNotification::new("tx-1", "node-a", b"hello", true, 3600);
        assert_eq!(
            n.data_hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(n.data_size, 5);
        assert_eq!(n.gossip_round, 0);
        assert_eq!(n.hop_count, 0);
        assert!(n.has_full_data);
        assert_eq!(n.transaction_data.as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn test_notification_without_payload() {
        let n = TransactionNotification::new("tx-1", "node-a", b"hello", false, 10);
        assert!(!n.has_full_data);
        assert!(n.transaction_data.is_none());
        assert_eq!(n.data_size, 5);
    }

    #[test]
    fn test_notification_wire_field_names() {
        let n = TransactionNotification::new("tx-1", "node-a", b"\x01\xff", true, 7);
        let json = n.to_json().unwrap();
        for field in [
            "\"TransactionId\"",
            "\"OriginPeerId\"",
            "\"DataHash\"",
            "\"DataSize\"",
            "\"GossipRound\"",
            "\"HopCount\"",
            "\"TTL\":7",
            "\"HasFullData\"",
            "\"TransactionData\":\"01ff\"",
            "\"Timestamp\"",
        ] {
            assert!(json.contains(field), "missing {} in {}", field, json);
        }
        assert_eq!(TransactionNotification::from_json(&json).unwrap(), n);
    }

    #[test]
    fn test_notification_rejects_bad_hex() {
        let raw = r#"{"TransactionId":"t","OriginPeerId":"o","DataHash":"h","DataSize":1,
            "TransactionData":"zz","Timestamp":"2026-01-01T00:00:00Z"}"#;
        assert!(TransactionNotification::from_json(raw).is_err());
    }

    #[test]
    fn test_notification_defaults_when_fields_missing() {
        let raw = r#"{"TransactionId":"t","OriginPeerId":"o","DataHash":"h","DataSize":1,
            "Timestamp":"2026-01-01T00:00:00Z"}"#;
        let n = TransactionNotification::from_json(raw).unwrap();
        assert_eq!(n.ttl, DEFAULT_NOTIFICATION_TTL);
        assert_eq!(n.gossip_round, 0);
        assert!(n.transaction_data.is_none());
    }

    #[test]
    fn test_sync_state_parse_roundtrip() {
        for state in [
            RegisterSyncState::Subscribing,
            RegisterSyncState::Syncing,
            RegisterSyncState::Active,
            RegisterSyncState::FullyReplicated,
            RegisterSyncState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<RegisterSyncState>().unwrap(), state);
        }
        assert!("Bogus".parse::<RegisterSyncState>().is_err());
        assert!(RegisterSyncState::FullyReplicated.can_serve_full_replica());
        assert!(!RegisterSyncState::Active.can_serve_full_replica());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("FullReplica".parse::<ReplicationMode>().unwrap(), ReplicationMode::FullReplica);
        assert_eq!("ForwardOnly".parse::<ReplicationMode>().unwrap(), ReplicationMode::ForwardOnly);
        assert!("fullreplica".parse::<ReplicationMode>().is_err());
    }

    #[test]
    fn test_peer_info_normalized_rederives_capability() {
        let mut info = PeerRegisterInfo::new("reg-1", RegisterSyncState::Active, 1, 0, true);
        info.can_serve_full_replica = true;
        assert!(!info.normalized().can_serve_full_replica);
    }

    #[test]
    fn test_subscription_mark_failed_then_synced() {
        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        assert_eq!(sub.sync_state, RegisterSyncState::Subscribing);

        sub.mark_failed("All source peers failed");
        sub.mark_failed("All source peers failed");
        assert_eq!(sub.consecutive_failures, 2);
        assert!(sub.error_message.is_some());

        sub.mark_synced(RegisterSyncState::FullyReplicated, 12);
        assert_eq!(sub.consecutive_failures, 0);
        assert!(sub.error_message.is_none());
        assert_eq!(sub.total_transactions_synced, 12);
        assert!(sub.last_synced_at.is_some());
    }

    #[test]
    fn test_snapshot_latest_versions() {
        let snapshot = RegisterSnapshot {
            register_id: "reg-1".into(),
            transactions: vec![
                CachedTransaction::new("a", "reg-1", 3, vec![]),
                CachedTransaction::new("b", "reg-1", 9, vec![]),
            ],
            dockets: vec![],
        };
        assert_eq!(snapshot.latest_version(), 9);
        assert_eq!(snapshot.latest_docket_version(), 0);
    }
}
