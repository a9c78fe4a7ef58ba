//! In-process stand-in for the shared tier.
//!
//! Clones share storage, so several caches built over clones of one store
//! behave like shards sharing a Redis instance. [`MemorySharedStore::set_available`]
//! simulates an outage.

use crate::cache::errors::{CacheError, CacheResult};
use crate::cache::local::LocalLruStore;
use crate::cache::traits::{SharedHit, SharedStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct MemorySharedStore {
    store: Arc<LocalLruStore>,
    available: Arc<AtomicBool>,
}

impl Default for MemorySharedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySharedStore {
    pub fn new() -> Self {
        Self {
            store: Arc::new(LocalLruStore::new()),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Entry count of a namespace, ignoring availability
    pub fn len(&self, namespace: &str) -> usize {
        self.store.len(namespace)
    }

    /// Read that ignores availability; refreshes recency like `get`
    pub fn peek(&self, namespace: &str, key: &str) -> Option<String> {
        self.store.get(namespace, key)
    }

    fn check(&self) -> CacheResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CacheError::ConnectionError(
                "shared store unavailable".to_string(),
            ))
        }
    }
}

impl SharedStore for MemorySharedStore {
    async fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<SharedHit>> {
        self.check()?;
        let now = Instant::now();
        Ok(self.store.get_entry(namespace, key).map(|entry| {
            let remaining = entry.remaining_ttl(now);
            SharedHit::new(entry.value, Some(remaining))
        }))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl: Duration,
        max_entries: usize,
    ) -> CacheResult<u64> {
        self.check()?;
        Ok(self.store.set(namespace, key, value, ttl, max_entries).len() as u64)
    }

    async fn delete(&self, namespace: &str, key: &str) -> CacheResult<bool> {
        self.check()?;
        Ok(self.store.delete(namespace, key))
    }

    async fn clear_namespace(&self, namespace: &str, _batch_size: usize) -> CacheResult<u64> {
        self.check()?;
        Ok(self.store.clear_namespace(namespace))
    }

    async fn increment(&self, namespace: &str, key: &str, ttl: Duration) -> CacheResult<i64> {
        self.check()?;
        Ok(self.store.increment(namespace, key, ttl, usize::MAX))
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(self.is_available())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
