// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Subscription persistence.
//!
//! Stores every [`RegisterSubscription`] in SQLite so the node knows which
//! registers it wants after a restart. The scheduler keeps the live copy in
//! memory and writes through on every change.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes retry with exponential backoff (5 attempts, 10ms
//! doubling to 500ms) before surfacing the error.
//!
//! Timestamps are stored as Unix milliseconds.

use crate::config::SubscriptionStoreConfig;
use crate::error::{ReplicationError, Result};
use crate::types::{RegisterSubscription, ReplicationMode, RegisterSyncState};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::subscription_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

type SubscriptionRow = (
    String,
    String,
    String,
    i64,
    Option<String>,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

fn decode_row(row: SubscriptionRow) -> Result<RegisterSubscription> {
    let (register_id, mode, sync_state, failures, error_message, synced, created, last_synced, last_attempt) = row;
    let mode = ReplicationMode::from_str(&mode).map_err(ReplicationError::Internal)?;
    let sync_state = RegisterSyncState::from_str(&sync_state).map_err(ReplicationError::Internal)?;
    Ok(RegisterSubscription {
        register_id,
        mode,
        sync_state,
        consecutive_failures: u32::try_from(failures.max(0)).unwrap_or(u32::MAX),
        error_message,
        total_transactions_synced: u64::try_from(synced.max(0)).unwrap_or(0),
        created_at: from_millis(created).unwrap_or_else(Utc::now),
        last_synced_at: last_synced.and_then(from_millis),
        last_attempt_at: last_attempt.and_then(from_millis),
    })
}

/// SQLite-backed subscription table.
pub struct SubscriptionStore {
    pool: SqlitePool,
    path: String,
}

impl SubscriptionStore {
    /// Open (creating if needed) the store described by `config`.
    pub async fn open(config: &SubscriptionStoreConfig) -> Result<Self> {
        let path = config.sqlite_path.clone();
        info!(path = %path, "Initializing subscription store");

        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };

        let journal = if config.wal_mode && !in_memory {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Memory
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        // An in-memory database lives and dies with its one connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(2)
        };
        let pool = pool_options.connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS register_subscriptions (
                register_id TEXT PRIMARY KEY,
                mode TEXT NOT NULL,
                sync_state TEXT NOT NULL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                total_transactions_synced INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_synced_at INTEGER,
                last_attempt_at INTEGER,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, path })
    }

    /// Every persisted subscription, ordered by register id.
    ///
    /// Rows that no longer decode are skipped with a warning.
    pub async fn load_all(&self) -> Result<Vec<RegisterSubscription>> {
        let pool = &self.pool;
        let rows: Vec<SubscriptionRow> = execute_with_retry("subscription_load", || async {
            sqlx::query_as(
                r#"
                SELECT register_id, mode, sync_state, consecutive_failures, error_message,
                       total_transactions_synced, created_at, last_synced_at, last_attempt_at
                FROM register_subscriptions
                ORDER BY register_id
                "#,
            )
            .fetch_all(pool)
            .await
        })
        .await?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for row in rows {
            let register_id = row.0.clone();
            match decode_row(row) {
                Ok(sub) => subscriptions.push(sub),
                Err(e) => warn!(register_id = %register_id, error = %e, "Skipping unreadable subscription row"),
            }
        }
        if !subscriptions.is_empty() {
            info!(count = subscriptions.len(), "Restored subscriptions from previous run");
        }
        Ok(subscriptions)
    }

    /// Insert or replace a subscription.
    pub async fn upsert(&self, subscription: &RegisterSubscription) -> Result<()> {
        let pool = &self.pool;
        let now = to_millis(Utc::now());
        let failures = i64::from(subscription.consecutive_failures);
        let synced = i64::try_from(subscription.total_transactions_synced).unwrap_or(i64::MAX);

        let result = execute_with_retry("subscription_upsert", || async {
            sqlx::query(
                r#"
                INSERT INTO register_subscriptions (
                    register_id, mode, sync_state, consecutive_failures, error_message,
                    total_transactions_synced, created_at, last_synced_at, last_attempt_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(register_id) DO UPDATE SET
                    mode = excluded.mode,
                    sync_state = excluded.sync_state,
                    consecutive_failures = excluded.consecutive_failures,
                    error_message = excluded.error_message,
                    total_transactions_synced = excluded.total_transactions_synced,
                    last_synced_at = excluded.last_synced_at,
                    last_attempt_at = excluded.last_attempt_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&subscription.register_id)
            .bind(subscription.mode.as_str())
            .bind(subscription.sync_state.as_str())
            .bind(failures)
            .bind(&subscription.error_message)
            .bind(synced)
            .bind(to_millis(subscription.created_at))
            .bind(subscription.last_synced_at.map(to_millis))
            .bind(subscription.last_attempt_at.map(to_millis))
            .bind(now)
            .execute(pool)
            .await
        })
        .await;

        crate::metrics::record_subscription_persist(result.is_ok());
        result?;
        debug!(register_id = %subscription.register_id, state = %subscription.sync_state, "Subscription persisted");
        Ok(())
    }

    /// Delete a subscription. Returns whether a row existed.
    pub async fn delete(&self, register_id: &str) -> Result<bool> {
        let pool = &self.pool;
        let owned = register_id.to_string();
        let result = execute_with_retry("subscription_delete", || async {
            sqlx::query("DELETE FROM register_subscriptions WHERE register_id = ?")
                .bind(&owned)
                .execute(pool)
                .await
        })
        .await;
        crate::metrics::record_subscription_persist(result.is_ok());
        Ok(result?.rows_affected() > 0)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("subscription_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Subscription store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file_config(dir: &tempfile::TempDir, name: &str) -> SubscriptionStoreConfig {
        SubscriptionStoreConfig {
            sqlite_path: dir.path().join(name).to_string_lossy().to_string(),
            wal_mode: true,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let store = SubscriptionStore::open(&SubscriptionStoreConfig::in_memory()).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());

        let mut sub = RegisterSubscription::new("reg-1", ReplicationMode::FullReplica);
        store.upsert(&sub).await.unwrap();

        sub.mark_failed("All source peers failed");
        sub.last_attempt_at = Some(Utc::now());
        store.upsert(&sub).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].register_id, "reg-1");
        assert_eq!(loaded[0].mode, ReplicationMode::FullReplica);
        assert_eq!(loaded[0].consecutive_failures, 1);
        assert_eq!(loaded[0].error_message.as_deref(), Some("All source peers failed"));
        assert!(loaded[0].last_attempt_at.is_some());
        assert!(loaded[0].last_synced_at.is_none());
        store.close().await;
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let config = file_config(&dir, "subs.db");

        {
            let store = SubscriptionStore::open(&config).await.unwrap();
            let mut sub = RegisterSubscription::new("reg-b", ReplicationMode::ForwardOnly);
            sub.mark_synced(RegisterSyncState::Active, 42);
            store.upsert(&sub).await.unwrap();
            store
                .upsert(&RegisterSubscription::new("reg-a", ReplicationMode::FullReplica))
                .await
                .unwrap();
            store.close().await;
        }

        let store = SubscriptionStore::open(&config).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|s| s.register_id.as_str()).collect();
        assert_eq!(ids, vec!["reg-a", "reg-b"]);
        assert_eq!(loaded[1].sync_state, RegisterSyncState::Active);
        assert_eq!(loaded[1].total_transactions_synced, 42);
        assert!(loaded[1].last_synced_at.is_some());
        assert!(store.path().contains("subs.db"));
        store.close().await;
    }

    #[tokio::test]
    async fn test_delete() {
        let store = SubscriptionStore::open(&SubscriptionStoreConfig::in_memory()).await.unwrap();
        store
            .upsert(&RegisterSubscription::new("reg-1", ReplicationMode::ForwardOnly))
            .await
            .unwrap();
        assert!(store.delete("reg-1").await.unwrap());
        assert!(!store.delete("reg-1").await.unwrap());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_rows_are_skipped() {
        let store = SubscriptionStore::open(&SubscriptionStoreConfig::in_memory()).await.unwrap();
        sqlx::query(
            "INSERT INTO register_subscriptions (register_id, mode, sync_state, created_at, updated_at) \
             VALUES ('reg-x', 'Sideways', 'Active', 0, 0)",
        )
        .execute(&store.pool)
        .await
        .unwrap();
        store
            .upsert(&RegisterSubscription::new("reg-y", ReplicationMode::FullReplica))
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].register_id, "reg-y");
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;
        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;
        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_other_errors() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_millis_round_trip_precision() {
        let ts = from_millis(1_700_000_000_123).unwrap();
        assert_eq!(to_millis(ts), 1_700_000_000_123);
    }
}
