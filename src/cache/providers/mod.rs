//! Shared-tier providers and the enum that dispatches between them

pub mod memory;
pub mod redis;

pub use memory::MemorySharedStore;
pub use redis::RedisSharedStore;

use super::errors::CacheResult;
use super::traits::{SharedHit, SharedStore};
use std::time::Duration;

/// The configured shared tier.
///
/// An enum rather than a trait object: [`SharedStore`] methods return
/// `impl Future`, which is not object safe.
#[derive(Debug)]
pub enum SharedBackend {
    Redis(Box<RedisSharedStore>),
    Memory(MemorySharedStore),
}

impl SharedBackend {
    /// Lazily connecting Redis tier; fails only on a malformed URL
    pub fn redis(redis_url: &str, key_prefix: &str) -> CacheResult<Self> {
        Ok(Self::Redis(Box::new(RedisSharedStore::new(redis_url, key_prefix)?)))
    }

    pub fn memory(store: MemorySharedStore) -> Self {
        Self::Memory(store)
    }

    pub async fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<SharedHit>> {
        match self {
            Self::Redis(s) => s.get(namespace, key).await,
            Self::Memory(s) => s.get(namespace, key).await,
        }
    }

    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl: Duration,
        max_entries: usize,
    ) -> CacheResult<u64> {
        match self {
            Self::Redis(s) => s.set(namespace, key, value, ttl, max_entries).await,
            Self::Memory(s) => s.set(namespace, key, value, ttl, max_entries).await,
        }
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> CacheResult<bool> {
        match self {
            Self::Redis(s) => s.delete(namespace, key).await,
            Self::Memory(s) => s.delete(namespace, key).await,
        }
    }

    pub async fn clear_namespace(&self, namespace: &str, batch_size: usize) -> CacheResult<u64> {
        match self {
            Self::Redis(s) => s.clear_namespace(namespace, batch_size).await,
            Self::Memory(s) => s.clear_namespace(namespace, batch_size).await,
        }
    }

    pub async fn increment(&self, namespace: &str, key: &str, ttl: Duration) -> CacheResult<i64> {
        match self {
            Self::Redis(s) => s.increment(namespace, key, ttl).await,
            Self::Memory(s) => s.increment(namespace, key, ttl).await,
        }
    }

    pub async fn health_check(&self) -> CacheResult<bool> {
        match self {
            Self::Redis(s) => s.health_check().await,
            Self::Memory(s) => s.health_check().await,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::Redis(s) => s.provider_name(),
            Self::Memory(s) => s.provider_name(),
        }
    }
}
