//! Process-global connection pool manager.
//!
//! One pool per connection string, created on first use and shared by every
//! repository targeting that database. Teardown happens once at shutdown;
//! nothing else in the workspace holds process-global state.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::error::{redact_connection_url, StoreError};

static POOLS: Lazy<DashMap<String, PgPool>> = Lazy::new(DashMap::new);

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Fetch (or lazily create) the pool for `url`.
pub async fn pool_for(url: &str) -> Result<PgPool, StoreError> {
    if let Some(existing) = POOLS.get(url) {
        return Ok(existing.clone());
    }

    let pool = PgPoolOptions::new()
        .max_connections(DEFAULT_MAX_CONNECTIONS)
        .connect(url)
        .await
        .map_err(|e| StoreError::classify(e, url))?;

    info!(database = %redact_connection_url(url), "connection pool created");

    // Two tasks may race here; the loser's pool is dropped and the first
    // registration wins so every caller shares one pool.
    let entry = POOLS.entry(url.to_string()).or_insert_with(|| pool.clone());
    Ok(entry.clone())
}

/// Close every pool. Call once on process shutdown.
pub async fn shutdown_pools() {
    let urls: Vec<String> = POOLS.iter().map(|entry| entry.key().clone()).collect();
    for url in urls {
        if let Some((_, pool)) = POOLS.remove(&url) {
            pool.close().await;
            info!(database = %redact_connection_url(&url), "connection pool closed");
        }
    }
}
