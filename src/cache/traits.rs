//! Shared cache tier trait

use super::errors::CacheResult;
use std::future::Future;
use std::time::Duration;

/// A value read from the shared tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedHit {
    pub value: String,
    /// Time left before the shared copy expires; `None` when it has no expiry
    pub remaining_ttl: Option<Duration>,
}

impl SharedHit {
    pub fn new(value: impl Into<String>, remaining_ttl: Option<Duration>) -> Self {
        Self {
            value: value.into(),
            remaining_ttl,
        }
    }

    /// TTL for a local copy: never outlives the shared entry or `cap`
    pub fn local_ttl(&self, cap: Duration) -> Duration {
        self.remaining_ttl.map_or(cap, |remaining| remaining.min(cap))
    }
}

/// Operations of the tier shared by every shard.
///
/// Keys are addressed by `(namespace, key)`; the store owns the key layout.
/// Recency is kept per namespace so eviction removes the least recently
/// accessed entry.
pub trait SharedStore: Send + Sync {
    /// Returns the value with its remaining TTL and refreshes its recency
    fn get(&self, namespace: &str, key: &str) -> impl Future<Output = CacheResult<Option<SharedHit>>> + Send;

    /// Stores with a TTL, then evicts least recently used entries while the
    /// namespace holds more than `max_entries`. Returns the eviction count.
    fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl: Duration,
        max_entries: usize,
    ) -> impl Future<Output = CacheResult<u64>> + Send;

    fn delete(&self, namespace: &str, key: &str) -> impl Future<Output = CacheResult<bool>> + Send;

    /// Removes every entry of the namespace, `batch_size` keys at a time
    fn clear_namespace(&self, namespace: &str, batch_size: usize) -> impl Future<Output = CacheResult<u64>> + Send;

    /// Atomic increment; the TTL is applied when the counter is created
    fn increment(&self, namespace: &str, key: &str, ttl: Duration) -> impl Future<Output = CacheResult<i64>> + Send;

    fn health_check(&self) -> impl Future<Output = CacheResult<bool>> + Send;

    fn provider_name(&self) -> &'static str;
}
