// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up a Redis container backing the advertisement
//! store.

use redis::aio::ConnectionManager;
use register_replication::catalog::store::{AdvertisementKeys, RedisAdvertisementStore};
use register_replication::resilience::RetryConfig;
use std::time::Duration;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container.
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// Helper to get a ConnectionManager from a Redis URL.
pub async fn connection_manager(url: &str) -> ConnectionManager {
    let client = redis::Client::open(url).unwrap();
    client.get_connection_manager().await.unwrap()
}

/// A Redis-backed advertisement store under `prefix`.
pub async fn redis_store(url: &str, prefix: &str, lease_ttl: Duration) -> RedisAdvertisementStore {
    RedisAdvertisementStore::connect(url, AdvertisementKeys::new(prefix), lease_ttl, &RetryConfig::startup(Duration::from_secs(5)))
        .await
        .expect("Failed to connect advertisement store")
}
