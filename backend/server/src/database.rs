//! # Stores
//!
//! - SQLite (or the in-process store) holds content items and engagement records
//! - Redis holds login sessions, written by the auth service, read here by [`crate::identity`]
use std::{sync::Arc, time::Duration};

use redis::{
    Client, RedisError,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tracing::info;

use crate::{
    config::Config,
    engagement::{MemoryStore, Persistence, SqliteStore, StoreError},
};

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, RedisError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;

    client.get_connection_manager_with_config(config).await
}

pub async fn init_store(config: &Config) -> Result<Arc<dyn Persistence>, StoreError> {
    if config.uses_memory_store() {
        info!("Using in-process engagement store, nothing is persisted");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = SqliteStore::connect(
        &config.database_url,
        config.database_max_connections,
        config.database_busy_timeout,
    )
    .await?;

    Ok(Arc::new(store))
}
