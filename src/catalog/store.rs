//! Durable backing for the advertisement catalog.
//!
//! # Key layout
//!
//! ```text
//! {prefix}:local:{registerId}              JSON LocalRegisterAdvertisement
//! {prefix}:local:_index                    SET of local register ids      (lease)
//! {prefix}:remote:{peerId}:{registerId}    JSON PeerRegisterInfo
//! {prefix}:remote:{peerId}:_index          SET of that peer's register ids (lease)
//! {prefix}:remote:_peers                   SET of peer ids                 (lease)
//! ```
//!
//! Index sets expire after the lease TTL unless refreshed, so a node that goes
//! away stops being listed without anyone cleaning up after it. Loading always
//! walks the indexes, never scans keys.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::types::{LocalRegisterAdvertisement, PeerRegisterInfo};
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::Client;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// Type alias for boxed store futures.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Everything the catalog needs from its backing store.
pub trait AdvertisementStore: Send + Sync + 'static {
    /// Short label for logs.
    fn name(&self) -> &'static str;

    fn save_local(&self, ad: &LocalRegisterAdvertisement) -> StoreFuture<'_, ()>;

    fn delete_local(&self, register_id: &str) -> StoreFuture<'_, ()>;

    fn load_local(&self) -> StoreFuture<'_, Vec<LocalRegisterAdvertisement>>;

    /// Rewrite every local advertisement and renew the local lease.
    fn refresh_local(&self, ads: &[LocalRegisterAdvertisement]) -> StoreFuture<'_, ()>;

    /// Replace everything stored for `peer_id` with `infos`.
    fn save_remote(&self, peer_id: &str, infos: &[PeerRegisterInfo]) -> StoreFuture<'_, ()>;

    fn delete_remote_peer(&self, peer_id: &str) -> StoreFuture<'_, ()>;

    fn load_remote(&self) -> StoreFuture<'_, HashMap<String, Vec<PeerRegisterInfo>>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Keys
// ═══════════════════════════════════════════════════════════════════════════════

/// Builds keys for the layout above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementKeys {
    prefix: String,
}

impl AdvertisementKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn local(&self, register_id: &str) -> String {
        format!("{}:local:{}", self.prefix, register_id)
    }

    pub fn local_index(&self) -> String {
        format!("{}:local:_index", self.prefix)
    }

    pub fn remote(&self, peer_id: &str, register_id: &str) -> String {
        format!("{}:remote:{}:{}", self.prefix, peer_id, register_id)
    }

    pub fn remote_index(&self, peer_id: &str) -> String {
        format!("{}:remote:{}:_index", self.prefix, peer_id)
    }

    pub fn remote_peers(&self) -> String {
        format!("{}:remote:_peers", self.prefix)
    }
}

impl Default for AdvertisementKeys {
    fn default() -> Self {
        Self::new("advert")
    }
}

fn decode_all<T: DeserializeOwned>(keys: &[String], values: Vec<Option<String>>) -> Vec<T> {
    keys.iter()
        .zip(values)
        .filter_map(|(key, raw)| {
            let raw = raw?;
            match serde_json::from_str(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping malformed advertisement");
                    None
                }
            }
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis-backed store.
///
/// `ConnectionManager` reconnects on its own and is cheap to clone, so every
/// operation works on a clone and never holds a lock across `.await`.
pub struct RedisAdvertisementStore {
    conn: ConnectionManager,
    keys: AdvertisementKeys,
    lease_ttl_secs: u64,
}

impl RedisAdvertisementStore {
    /// Connect with retry, giving up after `retry.max_attempts`.
    pub async fn connect(
        url: &str,
        keys: AdvertisementKeys,
        lease_ttl: Duration,
        retry: &RetryConfig,
    ) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| ReplicationError::Config(format!("Invalid Redis URL: {}", e)))?;

        let mut attempt = 0usize;
        loop {
            attempt += 1;
            match timeout(retry.connection_timeout, client.get_connection_manager()).await {
                Ok(Ok(conn)) => {
                    info!(attempt, "Connected to advertisement store");
                    return Ok(Self::from_connection(conn, keys, lease_ttl));
                }
                Ok(Err(e)) if attempt >= retry.max_attempts => {
                    return Err(ReplicationError::store("connect", e));
                }
                Err(_) if attempt >= retry.max_attempts => {
                    return Err(ReplicationError::Timeout {
                        operation: "advertisement store connect".to_string(),
                        timeout_ms: retry.connection_timeout.as_millis() as u64,
                    });
                }
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "Advertisement store connect failed, retrying");
                }
                Err(_) => {
                    warn!(
                        attempt,
                        timeout_ms = retry.connection_timeout.as_millis() as u64,
                        "Advertisement store connect timed out, retrying"
                    );
                }
            }
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
        }
    }

    pub fn from_connection(conn: ConnectionManager, keys: AdvertisementKeys, lease_ttl: Duration) -> Self {
        Self {
            conn,
            keys,
            lease_ttl_secs: lease_ttl.as_secs().max(1),
        }
    }

    async fn members(&self, conn: &mut ConnectionManager, key: &str) -> Result<Vec<String>> {
        redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(conn)
            .await
            .map_err(|e| ReplicationError::store("SMEMBERS", e))
    }

    async fn values(&self, conn: &mut ConnectionManager, keys: &[String]) -> Result<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        redis::cmd("MGET")
            .arg(keys)
            .query_async(conn)
            .await
            .map_err(|e| ReplicationError::store("MGET", e))
    }

    async fn exec(&self, operation: &'static str, pipe: redis::Pipeline) -> Result<()> {
        let mut conn = self.conn.clone();
        let result: std::result::Result<(), redis::RedisError> = pipe.query_async(&mut conn).await;
        metrics::record_catalog_store_op(operation, result.is_ok());
        result.map_err(|e| ReplicationError::store(operation, e))
    }

    fn push_local(&self, pipe: &mut redis::Pipeline, ad: &LocalRegisterAdvertisement) -> Result<()> {
        let json = serde_json::to_string(ad)?;
        pipe.cmd("SET")
            .arg(self.keys.local(&ad.register_id))
            .arg(json)
            .arg("EX")
            .arg(self.lease_ttl_secs)
            .ignore();
        pipe.cmd("SADD").arg(self.keys.local_index()).arg(&ad.register_id).ignore();
        Ok(())
    }
}

impl AdvertisementStore for RedisAdvertisementStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn save_local(&self, ad: &LocalRegisterAdvertisement) -> StoreFuture<'_, ()> {
        let ad = ad.clone();
        Box::pin(async move {
            let mut pipe = redis::pipe();
            pipe.atomic();
            self.push_local(&mut pipe, &ad)?;
            pipe.cmd("EXPIRE").arg(self.keys.local_index()).arg(self.lease_ttl_secs).ignore();
            self.exec("save_local", pipe).await
        })
    }

    fn delete_local(&self, register_id: &str) -> StoreFuture<'_, ()> {
        let register_id = register_id.to_string();
        Box::pin(async move {
            let mut pipe = redis::pipe();
            pipe.atomic()
                .cmd("DEL")
                .arg(self.keys.local(&register_id))
                .ignore()
                .cmd("SREM")
                .arg(self.keys.local_index())
                .arg(&register_id)
                .ignore();
            self.exec("delete_local", pipe).await
        })
    }

    fn load_local(&self) -> StoreFuture<'_, Vec<LocalRegisterAdvertisement>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let ids = self.members(&mut conn, &self.keys.local_index()).await?;
            let keys: Vec<String> = ids.iter().map(|id| self.keys.local(id)).collect();
            let values = self.values(&mut conn, &keys).await?;
            metrics::record_catalog_store_op("load_local", true);
            Ok(decode_all(&keys, values))
        })
    }

    fn refresh_local(&self, ads: &[LocalRegisterAdvertisement]) -> StoreFuture<'_, ()> {
        let ads = ads.to_vec();
        Box::pin(async move {
            if ads.is_empty() {
                return Ok(());
            }
            let mut pipe = redis::pipe();
            pipe.atomic();
            for ad in &ads {
                self.push_local(&mut pipe, ad)?;
            }
            pipe.cmd("EXPIRE").arg(self.keys.local_index()).arg(self.lease_ttl_secs).ignore();
            self.exec("refresh_local", pipe).await
        })
    }

    fn save_remote(&self, peer_id: &str, infos: &[PeerRegisterInfo]) -> StoreFuture<'_, ()> {
        let peer_id = peer_id.to_string();
        let infos = infos.to_vec();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let index = self.keys.remote_index(&peer_id);
            let previous = self.members(&mut conn, &index).await?;
            let current: HashSet<&str> = infos.iter().map(|i| i.register_id.as_str()).collect();

            let mut pipe = redis::pipe();
            pipe.atomic();
            for stale in previous.iter().filter(|id| !current.contains(id.as_str())) {
                pipe.cmd("DEL").arg(self.keys.remote(&peer_id, stale)).ignore();
            }
            pipe.cmd("DEL").arg(&index).ignore();

            if infos.is_empty() {
                pipe.cmd("SREM").arg(self.keys.remote_peers()).arg(&peer_id).ignore();
            } else {
                for info in &infos {
                    let json = serde_json::to_string(info)?;
                    pipe.cmd("SET")
                        .arg(self.keys.remote(&peer_id, &info.register_id))
                        .arg(json)
                        .arg("EX")
                        .arg(self.lease_ttl_secs)
                        .ignore();
                    pipe.cmd("SADD").arg(&index).arg(&info.register_id).ignore();
                }
                pipe.cmd("EXPIRE").arg(&index).arg(self.lease_ttl_secs).ignore();
                pipe.cmd("SADD").arg(self.keys.remote_peers()).arg(&peer_id).ignore();
                pipe.cmd("EXPIRE").arg(self.keys.remote_peers()).arg(self.lease_ttl_secs).ignore();
            }
            self.exec("save_remote", pipe).await
        })
    }

    fn delete_remote_peer(&self, peer_id: &str) -> StoreFuture<'_, ()> {
        let peer_id = peer_id.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let index = self.keys.remote_index(&peer_id);
            let ids = self.members(&mut conn, &index).await?;

            let mut pipe = redis::pipe();
            pipe.atomic();
            for id in &ids {
                pipe.cmd("DEL").arg(self.keys.remote(&peer_id, id)).ignore();
            }
            pipe.cmd("DEL").arg(&index).ignore();
            pipe.cmd("SREM").arg(self.keys.remote_peers()).arg(&peer_id).ignore();
            self.exec("delete_remote_peer", pipe).await
        })
    }

    fn load_remote(&self) -> StoreFuture<'_, HashMap<String, Vec<PeerRegisterInfo>>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let peers = self.members(&mut conn, &self.keys.remote_peers()).await?;
            let mut out = HashMap::with_capacity(peers.len());
            for peer_id in peers {
                let ids = self.members(&mut conn, &self.keys.remote_index(&peer_id)).await?;
                let keys: Vec<String> = ids.iter().map(|id| self.keys.remote(&peer_id, id)).collect();
                let values = self.values(&mut conn, &keys).await?;
                let infos: Vec<PeerRegisterInfo> = decode_all(&keys, values);
                if !infos.is_empty() {
                    out.insert(peer_id, infos);
                }
            }
            metrics::record_catalog_store_op("load_remote", true);
            Ok(out)
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Memory
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local store, for nodes without Redis and for tests.
///
/// Leases are not modelled: nothing here outlives the process anyway.
#[derive(Debug, Default)]
pub struct MemoryAdvertisementStore {
    local: Mutex<HashMap<String, LocalRegisterAdvertisement>>,
    remote: Mutex<HashMap<String, Vec<PeerRegisterInfo>>>,
}

impl MemoryAdvertisementStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn local_count(&self) -> usize {
        self.local.lock().len()
    }

    pub fn remote_peer_count(&self) -> usize {
        self.remote.lock().len()
    }
}

impl AdvertisementStore for MemoryAdvertisementStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn save_local(&self, ad: &LocalRegisterAdvertisement) -> StoreFuture<'_, ()> {
        self.local.lock().insert(ad.register_id.clone(), ad.clone());
        Box::pin(async { Ok(()) })
    }

    fn delete_local(&self, register_id: &str) -> StoreFuture<'_, ()> {
        self.local.lock().remove(register_id);
        Box::pin(async { Ok(()) })
    }

    fn load_local(&self) -> StoreFuture<'_, Vec<LocalRegisterAdvertisement>> {
        let ads = self.local.lock().values().cloned().collect();
        Box::pin(async move { Ok(ads) })
    }

    fn refresh_local(&self, ads: &[LocalRegisterAdvertisement]) -> StoreFuture<'_, ()> {
        let mut local = self.local.lock();
        for ad in ads {
            local.insert(ad.register_id.clone(), ad.clone());
        }
        Box::pin(async { Ok(()) })
    }

    fn save_remote(&self, peer_id: &str, infos: &[PeerRegisterInfo]) -> StoreFuture<'_, ()> {
        let mut remote = self.remote.lock();
        if infos.is_empty() {
            remote.remove(peer_id);
        } else {
            remote.insert(peer_id.to_string(), infos.to_vec());
        }
        Box::pin(async { Ok(()) })
    }

    fn delete_remote_peer(&self, peer_id: &str) -> StoreFuture<'_, ()> {
        self.remote.lock().remove(peer_id);
        Box::pin(async { Ok(()) })
    }

    fn load_remote(&self) -> StoreFuture<'_, HashMap<String, Vec<PeerRegisterInfo>>> {
        let remote = self.remote.lock().clone();
        Box::pin(async move { Ok(remote) })
    }
}
