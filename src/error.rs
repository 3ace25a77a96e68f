// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the register replication node.
//!
//! Errors are categorized by their source (advertisement store, subscription
//! store, peers) and carry enough context to debug a failure from a log line.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | Yes | Advertisement store (Redis) unreachable or command failed |
//! | `PeerConnection` | Yes | Peer unreachable, stream dropped, bad response |
//! | `CircuitOpen` | Yes | Peer breaker is open, call was not attempted |
//! | `Timeout` | Yes | Per-attempt deadline elapsed |
//! | `SubscriptionStore` | No | Local SQLite errors (needs operator attention) |
//! | `Cancelled` | No | Caller cancelled the operation |
//! | `InvalidArgument` | No | Empty or malformed identifier |
//! | `Config` | No | Configuration invalid |
//! | `Serialization` | No | Malformed JSON in the store or on the wire |
//! | `InvalidState` | No | Node lifecycle violation |
//! | `Shutdown` | No | Node is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! "No source peers" and "all source peers failed" are not errors: they are
//! reported as [`PullOutcome`](crate::replication::PullOutcome) and
//! [`FeedOutcome`](crate::replication::FeedOutcome) variants so the scheduler
//! can apply its own bookkeeping.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur while replicating registers.
///
/// Use [`is_retryable()`](Self::is_retryable) to check whether the operation
/// should be retried with backoff.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Advertisement store (Redis) error.
    ///
    /// The catalog logs and swallows these and keeps serving from memory.
    #[error("Store error ({operation}): {message}")]
    Store {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error during subscription persistence.
    ///
    /// Fatal when restoring subscriptions at startup, logged otherwise.
    #[error("Subscription store error: {0}")]
    SubscriptionStore(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Peer connection failure.
    #[error("Peer connection error ({peer_id}): {message}")]
    PeerConnection { peer_id: String, message: String },

    /// The peer's circuit breaker rejected the call without attempting it.
    #[error("Circuit open for peer {peer_id}")]
    CircuitOpen { peer_id: String },

    /// An attempt against a peer exceeded its deadline.
    #[error("Timed out after {timeout_ms}ms ({operation})")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,

    /// Empty or malformed identifier passed by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Node state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running node).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a store error from a redis::RedisError
    pub fn store(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Store {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a store error without source
    pub fn store_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a peer connection error.
    pub fn peer(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PeerConnection {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }

    /// Reject an empty identifier.
    pub(crate) fn require_id(kind: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(Self::InvalidArgument(format!("{} must not be empty", kind)));
        }
        Ok(())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store { .. } => true,
            Self::PeerConnection { .. } => true,
            Self::CircuitOpen { .. } => true,
            Self::Timeout { .. } => true,
            Self::SubscriptionStore(_) => false, // Local DB issues need attention
            Self::Cancelled => false,
            Self::InvalidArgument(_) => false,
            Self::Config(_) => false,
            Self::Serialization(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::store("unknown", e)
    }
}
