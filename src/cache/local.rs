//! In-process LRU tier.
//!
//! Each namespace keeps its entries plus a recency index ordered by a
//! store-wide access tick, so the least recently accessed entry is always the
//! first key of the index. Expired entries are dropped on access and by
//! [`LocalLruStore::purge_expired`].

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// One cached value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub namespace: String,
    pub key: String,
    pub value: String,
    pub last_access_at: Instant,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Default)]
struct NamespaceLru {
    entries: HashMap<String, (CacheEntry, u64)>,
    recency: BTreeMap<u64, String>,
}

impl NamespaceLru {
    fn touch(&mut self, key: &str, tick: u64, now: Instant) {
        if let Some((entry, old_tick)) = self.entries.get_mut(key) {
            self.recency.remove(old_tick);
            *old_tick = tick;
            entry.last_access_at = now;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let (entry, tick) = self.entries.remove(key)?;
        self.recency.remove(&tick);
        Some(entry)
    }

    /// Expired entries are dropped, not counted as evictions
    fn remove_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (entry, _))| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_oldest(&mut self) -> Option<CacheEntry> {
        let (_, key) = self.recency.pop_first()?;
        self.entries.remove(&key).map(|(entry, _)| entry)
    }
}

#[derive(Debug, Default)]
struct Inner {
    namespaces: HashMap<String, NamespaceLru>,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(
        &mut self,
        namespace: &str,
        key: &str,
        value: &str,
        expires_at: Instant,
        max_entries: usize,
    ) -> Vec<String> {
        let now = Instant::now();
        let tick = self.next_tick();
        let lru = self.namespaces.entry(namespace.to_string()).or_default();

        lru.remove(key);
        lru.entries.insert(
            key.to_string(),
            (
                CacheEntry {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    value: value.to_string(),
                    last_access_at: now,
                    expires_at,
                },
                tick,
            ),
        );
        lru.recency.insert(tick, key.to_string());

        let max_entries = max_entries.max(1);
        if lru.entries.len() > max_entries {
            lru.remove_expired(now);
        }

        let mut evicted = Vec::new();
        while lru.entries.len() > max_entries {
            match lru.evict_oldest() {
                Some(entry) => evicted.push(entry.key),
                None => break,
            }
        }
        evicted
    }
}

#[derive(Debug, Default)]
pub struct LocalLruStore {
    inner: Mutex<Inner>,
}

impl LocalLruStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<String> {
        self.get_entry(namespace, key).map(|entry| entry.value)
    }

    /// Live entry after refreshing its recency
    pub fn get_entry(&self, namespace: &str, key: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let lru = inner.namespaces.get_mut(namespace)?;

        let expired = lru.entries.get(key)?.0.is_expired(now);
        if expired {
            lru.remove(key);
            return None;
        }
        lru.touch(key, tick, now);
        lru.entries.get(key).map(|(entry, _)| entry.clone())
    }

    /// Insert or replace, then evict down to `max_entries`; returns evicted keys
    pub fn set(&self, namespace: &str, key: &str, value: &str, ttl: Duration, max_entries: usize) -> Vec<String> {
        self.inner
            .lock()
            .insert(namespace, key, value, Instant::now() + ttl, max_entries)
    }

    pub fn delete(&self, namespace: &str, key: &str) -> bool {
        self.inner
            .lock()
            .namespaces
            .get_mut(namespace)
            .and_then(|lru| lru.remove(key))
            .is_some()
    }

    pub fn clear_namespace(&self, namespace: &str) -> u64 {
        self.inner
            .lock()
            .namespaces
            .remove(namespace)
            .map_or(0, |lru| lru.entries.len() as u64)
    }

    /// Counter stored as a decimal string. A missing, expired or non-numeric
    /// entry restarts at 1 with a fresh TTL; otherwise the expiry is kept.
    pub fn increment(&self, namespace: &str, key: &str, ttl: Duration, max_entries: usize) -> i64 {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();

        if let Some(lru) = inner.namespaces.get_mut(namespace) {
            let next = match lru.entries.get_mut(key) {
                Some((entry, _)) if !entry.is_expired(now) => {
                    entry.value.parse::<i64>().ok().map(|count| {
                        let next = count.saturating_add(1);
                        entry.value = next.to_string();
                        next
                    })
                }
                _ => None,
            };
            if let Some(next) = next {
                lru.touch(key, tick, now);
                return next;
            }
        }

        inner.insert(namespace, key, "1", now + ttl, max_entries);
        1
    }

    /// Drops expired entries everywhere; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for lru in inner.namespaces.values_mut() {
            removed += lru.remove_expired(now);
        }
        inner.namespaces.retain(|_, lru| !lru.entries.is_empty());
        removed
    }

    pub fn len(&self, namespace: &str) -> usize {
        self.inner
            .lock()
            .namespaces
            .get(namespace)
            .map_or(0, |lru| lru.entries.len())
    }

    pub fn total_len(&self) -> usize {
        self.inner
            .lock()
            .namespaces
            .values()
            .map(|lru| lru.entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}
