//! # Unified Cache
//!
//! Two tiers behind one namespaced API. The shared tier (Redis, or the
//! in-memory stand-in) is visible to every shard; the local LRU tier is
//! written through on every set and shared hit, and serves alone while the
//! shared tier is unreachable.
//!
//! Health of the shared tier is tracked with the [`DegradationCoordinator`]
//! as `"cache"`. Each failed shared call counts toward `failure_threshold`:
//! below it the service is degraded, at it unavailable and the shared tier is
//! skipped until a probe heals it. Sets, deletes and clears made while the
//! shared tier could not take them are kept in order (last write per key wins)
//! and replayed before the service is marked healthy again. While such writes
//! are queued or being replayed, new writes join the queue behind them, so a
//! replay never lands after a newer write. Counters are not replayed; a local
//! counter only covers the outage window.

use crate::cache::local::LocalLruStore;
use crate::cache::namespace::{NamespacePolicy, NamespaceRegistry};
use crate::cache::providers::{MemorySharedStore, SharedBackend};
use crate::config::CacheConfig;
use crate::constants::services;
use crate::degradation::{DegradationCoordinator, HealthState};
use crate::error::{WardenError, WardenResult};
use crate::metrics::{names, MetricKind, MetricsRecorder, TracingMetricsRecorder};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMPONENT: &str = "Unified cache";

/// A shared-tier mutation that could not be applied when it was made
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingOp {
    Set {
        namespace: String,
        key: String,
        value: String,
        expires_at: Instant,
    },
    Delete {
        namespace: String,
        key: String,
    },
    Clear {
        namespace: String,
    },
}

impl PendingOp {
    fn namespace(&self) -> &str {
        match self {
            Self::Set { namespace, .. } | Self::Delete { namespace, .. } | Self::Clear { namespace } => {
                namespace
            }
        }
    }

    fn address(&self) -> Option<(String, String)> {
        match self {
            Self::Set { namespace, key, .. } | Self::Delete { namespace, key } => {
                Some((namespace.clone(), key.clone()))
            }
            Self::Clear { .. } => None,
        }
    }
}

/// Ordered outage log. Keyed ops keep only their latest entry; a clear drops
/// every earlier op of its namespace.
#[derive(Debug, Default)]
struct PendingResync {
    ops: BTreeMap<u64, PendingOp>,
    by_address: HashMap<(String, String), u64>,
    clears: HashMap<String, u64>,
    next_seq: u64,
}

impl PendingResync {
    fn record(&mut self, op: PendingOp) {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.insert(seq, op);
    }

    fn insert(&mut self, seq: u64, op: PendingOp) {
        match op.address() {
            Some(address) => {
                if let Some(previous) = self.by_address.insert(address, seq) {
                    self.ops.remove(&previous);
                }
            }
            None => {
                let namespace = op.namespace().to_string();
                let stale: Vec<u64> = self
                    .ops
                    .iter()
                    .filter(|(s, o)| **s < seq && o.namespace() == namespace)
                    .map(|(s, _)| *s)
                    .collect();
                for s in stale {
                    if let Some(removed) = self.ops.remove(&s) {
                        if let Some(address) = removed.address() {
                            self.by_address.remove(&address);
                        }
                    }
                }
                self.clears.insert(namespace, seq);
            }
        }
        self.ops.insert(seq, op);
    }

    fn take(&mut self) -> Vec<(u64, PendingOp)> {
        self.by_address.clear();
        self.clears.clear();
        std::mem::take(&mut self.ops).into_iter().collect()
    }

    /// Puts back ops a failed replay did not apply, unless something newer
    /// already supersedes them
    fn restore(&mut self, ops: Vec<(u64, PendingOp)>) {
        for (seq, op) in ops {
            let cleared_after = self
                .clears
                .get(op.namespace())
                .is_some_and(|clear_seq| *clear_seq > seq);
            if cleared_after {
                continue;
            }
            if let Some(address) = op.address() {
                if self.by_address.contains_key(&address) {
                    continue;
                }
                self.by_address.insert(address, seq);
                self.ops.insert(seq, op);
            } else if !self.clears.contains_key(op.namespace()) {
                self.clears.insert(op.namespace().to_string(), seq);
                self.ops.insert(seq, op);
            }
        }
    }

    fn shadows(&self, namespace: &str, key: &str) -> bool {
        self.clears.contains_key(namespace)
            || self
                .by_address
                .contains_key(&(namespace.to_string(), key.to_string()))
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Cache counters since construction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    pub local_entries: usize,
    pub pending_resync: usize,
    pub shared_healthy: bool,
}

/// Outcome of one [`UnifiedCache::run_sweep`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSweepReport {
    pub purged: usize,
    pub resynced: usize,
    pub healed: bool,
}

#[derive(Debug)]
pub struct UnifiedCacheBuilder {
    config: CacheConfig,
    coordinator: Arc<DegradationCoordinator>,
    shared: Option<SharedBackend>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl UnifiedCacheBuilder {
    pub fn shared(mut self, backend: SharedBackend) -> Self {
        self.shared = Some(backend);
        self
    }

    pub fn memory_shared(self, store: MemorySharedStore) -> Self {
        self.shared(SharedBackend::memory(store))
    }

    pub fn metrics_recorder(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> WardenResult<Arc<UnifiedCache>> {
        self.config
            .validate()
            .map_err(|e| WardenError::ConfigurationError(e.to_string()))?;
        let registry = NamespaceRegistry::from_config(&self.config)?;
        let coordinator = self.coordinator;
        coordinator.register_service(services::CACHE);

        let cache = Arc::new_cyclic(|weak: &Weak<UnifiedCache>| {
            let weak = weak.clone();
            coordinator.register_probe(services::CACHE, move || {
                let weak = weak.clone();
                async move {
                    let cache = weak
                        .upgrade()
                        .ok_or_else(|| WardenError::NotInitialized(COMPONENT.to_string()))?;
                    cache.probe().await
                }
            });

            UnifiedCache {
                config: self.config,
                registry,
                shared: self.shared,
                local: LocalLruStore::new(),
                coordinator: Arc::clone(&coordinator),
                consecutive_failures: AtomicU32::new(0),
                pending: Mutex::new(PendingResync::default()),
                resync_lock: tokio::sync::Mutex::new(()),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                metrics: self.metrics,
            }
        });

        info!(
            shared = cache.shared.as_ref().map_or("none", SharedBackend::provider_name),
            namespaces = cache.registry.names().len(),
            "Unified cache ready"
        );
        Ok(cache)
    }
}

#[derive(Debug)]
pub struct UnifiedCache {
    config: CacheConfig,
    registry: NamespaceRegistry,
    shared: Option<SharedBackend>,
    local: LocalLruStore,
    coordinator: Arc<DegradationCoordinator>,
    consecutive_failures: AtomicU32,
    pending: Mutex<PendingResync>,
    resync_lock: tokio::sync::Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    metrics: Arc<dyn MetricsRecorder>,
}

impl UnifiedCache {
    pub fn builder(config: CacheConfig, coordinator: Arc<DegradationCoordinator>) -> UnifiedCacheBuilder {
        UnifiedCacheBuilder {
            config,
            coordinator,
            shared: None,
            metrics: Arc::new(TracingMetricsRecorder),
        }
    }

    pub fn new(
        config: CacheConfig,
        coordinator: Arc<DegradationCoordinator>,
        shared: Option<SharedBackend>,
    ) -> WardenResult<Arc<Self>> {
        let mut builder = Self::builder(config, coordinator);
        builder.shared = shared;
        builder.build()
    }

    /// Builds from configuration: Redis when `redis_url` is set, local-only
    /// otherwise. An unreachable Redis marks the cache unavailable instead of
    /// failing startup; the maintenance sweep heals it.
    pub async fn connect(
        config: CacheConfig,
        coordinator: Arc<DegradationCoordinator>,
    ) -> WardenResult<Arc<Self>> {
        let shared = match config.redis_url.as_deref() {
            Some(url) => Some(SharedBackend::redis(url, &config.key_prefix)?),
            None => None,
        };
        let cache = Self::new(config, coordinator, shared)?;

        if let Some(shared) = &cache.shared {
            match shared.health_check().await {
                Ok(true) => debug!("Shared cache tier reachable"),
                Ok(false) => cache.mark_shared_unavailable("PING returned an unexpected reply"),
                Err(e) => cache.mark_shared_unavailable(&e.to_string()),
            }
        }
        Ok(cache)
    }

    fn mark_shared_unavailable(&self, reason: &str) {
        crate::log_cache!(warn, "SHARED_UNAVAILABLE", namespace: "*", reason: reason);
        self.consecutive_failures
            .store(self.config.failure_threshold, Ordering::SeqCst);
        self.coordinator.mark_unavailable(services::CACHE, reason);
    }

    pub fn registry(&self) -> &NamespaceRegistry {
        &self.registry
    }

    pub fn has_shared_tier(&self) -> bool {
        self.shared.is_some()
    }

    /// The shared tier, unless it is absent or marked unavailable
    fn shared_tier(&self) -> Option<&SharedBackend> {
        let shared = self.shared.as_ref()?;
        match self.coordinator.state(services::CACHE) {
            Some(HealthState::Unavailable) => None,
            _ => Some(shared),
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub async fn get(&self, namespace: &str, key: &str) -> WardenResult<Option<String>> {
        let policy = self.registry.check(namespace, key)?;

        let shadowed = self.pending.lock().shadows(namespace, key);
        if !shadowed {
            if let Some(shared) = self.shared_tier() {
                match shared.get(namespace, key).await {
                    Ok(Some(hit)) => {
                        self.record_shared_success().await;
                        let ttl = hit.local_ttl(policy.ttl);
                        if ttl.is_zero() {
                            self.local.delete(namespace, key);
                        } else {
                            self.store_local(namespace, key, &hit.value, ttl, policy);
                        }
                        self.record_lookup(namespace, "shared", true);
                        return Ok(Some(hit.value));
                    }
                    Ok(None) => {
                        self.record_shared_success().await;
                        self.local.delete(namespace, key);
                        self.record_lookup(namespace, "shared", false);
                        return Ok(None);
                    }
                    Err(e) => self.record_shared_failure("get", namespace, &e.to_string()),
                }
            }
        }

        let value = self.local.get(namespace, key);
        self.record_lookup(namespace, "local", value.is_some());
        Ok(value)
    }

    /// Stores with the namespace TTL, or `ttl` when given
    pub async fn set(&self, namespace: &str, key: &str, value: &str, ttl: Option<Duration>) -> WardenResult<()> {
        let policy = self.registry.check(namespace, key)?;
        let ttl = ttl.unwrap_or(policy.ttl);
        if ttl.is_zero() {
            return Err(WardenError::validation("Cache TTL must be greater than zero"));
        }

        self.store_local(namespace, key, value, ttl, policy);

        let Some(shared) = self.shared.as_ref() else {
            return Ok(());
        };
        let op = PendingOp::Set {
            namespace: namespace.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            expires_at: Instant::now() + ttl,
        };
        if self.shared_tier().is_none() {
            self.pending.lock().record(op);
            return Ok(());
        }
        if self.resync_outstanding() {
            self.apply_in_order("set", op).await;
            return Ok(());
        }

        match shared.set(namespace, key, value, ttl, policy.max_entries).await {
            Ok(evicted) => {
                self.record_evictions(namespace, evicted);
                self.record_shared_success().await;
            }
            Err(e) => {
                self.record_shared_failure("set", namespace, &e.to_string());
                self.pending.lock().record(op);
            }
        }
        Ok(())
    }

    /// Removes from both tiers; `true` when either held the key. A delete
    /// queued behind outage writes reports the local result only.
    pub async fn delete(&self, namespace: &str, key: &str) -> WardenResult<bool> {
        self.registry.check(namespace, key)?;
        let local = self.local.delete(namespace, key);

        let Some(shared) = self.shared.as_ref() else {
            return Ok(local);
        };
        let op = PendingOp::Delete {
            namespace: namespace.to_string(),
            key: key.to_string(),
        };
        if self.shared_tier().is_none() {
            self.pending.lock().record(op);
            return Ok(local);
        }
        if self.resync_outstanding() {
            self.apply_in_order("delete", op).await;
            return Ok(local);
        }

        match shared.delete(namespace, key).await {
            Ok(removed) => {
                self.record_shared_success().await;
                Ok(local || removed)
            }
            Err(e) => {
                self.record_shared_failure("delete", namespace, &e.to_string());
                self.pending.lock().record(op);
                Ok(local)
            }
        }
    }

    /// Invalidates the whole namespace. Returns the shared-tier count when the
    /// shared tier took the clear, the local count otherwise.
    pub async fn clear_namespace(&self, namespace: &str) -> WardenResult<u64> {
        self.registry.policy(namespace)?;
        let local = self.local.clear_namespace(namespace);

        let Some(shared) = self.shared.as_ref() else {
            return Ok(local);
        };
        let op = PendingOp::Clear {
            namespace: namespace.to_string(),
        };
        if self.shared_tier().is_none() {
            self.pending.lock().record(op);
            return Ok(local);
        }
        if self.resync_outstanding() {
            self.apply_in_order("clear_namespace", op).await;
            return Ok(local);
        }

        match shared
            .clear_namespace(namespace, self.config.scan_batch_size)
            .await
        {
            Ok(removed) => {
                crate::log_cache!(info, "CLEARED", namespace: namespace, removed: removed);
                self.record_shared_success().await;
                Ok(removed)
            }
            Err(e) => {
                self.record_shared_failure("clear_namespace", namespace, &e.to_string());
                self.pending.lock().record(op);
                Ok(local)
            }
        }
    }

    /// Atomic increment; `ttl` (default: the namespace TTL) applies when the
    /// counter is created
    pub async fn increment(&self, namespace: &str, key: &str, ttl: Option<Duration>) -> WardenResult<i64> {
        let policy = self.registry.check(namespace, key)?;
        let ttl = ttl.unwrap_or(policy.ttl);
        if ttl.is_zero() {
            return Err(WardenError::validation("Counter TTL must be greater than zero"));
        }

        if let Some(shared) = self.shared_tier() {
            match shared.increment(namespace, key, ttl).await {
                Ok(value) => {
                    self.record_shared_success().await;
                    return Ok(value);
                }
                Err(e) => self.record_shared_failure("increment", namespace, &e.to_string()),
            }
        }
        Ok(self.local.increment(namespace, key, ttl, policy.max_entries))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> WardenResult<Option<T>> {
        match self.get(namespace, key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> WardenResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set(namespace, key, &raw, ttl).await
    }

    // ------------------------------------------------------------------
    // Health and resync
    // ------------------------------------------------------------------

    /// Health check of the shared tier. On success pending outage writes are
    /// replayed before returning, so the coordinator only marks the cache
    /// healthy once the shared tier has caught up.
    pub async fn probe(&self) -> WardenResult<()> {
        let Some(shared) = self.shared.as_ref() else {
            return Ok(());
        };
        match shared.health_check().await {
            Ok(true) => {}
            Ok(false) => return Err(self.unavailable("PING returned an unexpected reply")),
            Err(e) => return Err(self.unavailable(&e.to_string())),
        }
        self.resync().await?;
        self.consecutive_failures.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn unavailable(&self, reason: &str) -> WardenError {
        WardenError::ServiceUnavailable {
            service: services::CACHE.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Replays pending outage writes in order. Returns how many were applied;
    /// 0 when another resync is already running.
    pub async fn resync(&self) -> WardenResult<usize> {
        let Some(shared) = self.shared.as_ref() else {
            return Ok(0);
        };
        let Ok(_guard) = self.resync_lock.try_lock() else {
            debug!("Cache resync already running");
            return Ok(0);
        };
        self.replay_pending(shared).await
    }

    /// Outage writes are still queued or a replay is running
    fn resync_outstanding(&self) -> bool {
        !self.pending.lock().is_empty() || self.resync_lock.try_lock().is_err()
    }

    /// Queues `op` behind earlier outage writes, then waits for any running
    /// replay and replays the queue itself. A failure leaves `op` queued.
    async fn apply_in_order(&self, operation: &str, op: PendingOp) {
        let Some(shared) = self.shared.as_ref() else {
            return;
        };
        let namespace = op.namespace().to_string();
        self.pending.lock().record(op);

        let replayed = {
            let _guard = self.resync_lock.lock().await;
            self.replay_pending(shared).await
        };
        match replayed {
            Ok(_) => self.record_shared_success().await,
            Err(e) => self.record_shared_failure(operation, &namespace, &e.to_string()),
        }
    }

    /// Caller holds `resync_lock`
    async fn replay_pending(&self, shared: &SharedBackend) -> WardenResult<usize> {
        let ops = self.pending.lock().take();
        if ops.is_empty() {
            return Ok(0);
        }
        let total = ops.len();
        let mut applied = 0;
        let mut remaining = ops.into_iter();

        while let Some((seq, op)) = remaining.next() {
            let result = match &op {
                PendingOp::Set {
                    namespace,
                    key,
                    value,
                    expires_at,
                } => {
                    let ttl = expires_at.saturating_duration_since(Instant::now());
                    if ttl.is_zero() {
                        continue;
                    }
                    let max_entries = self
                        .registry
                        .policy(namespace)
                        .map_or(usize::MAX, |p| p.max_entries);
                    shared
                        .set(namespace, key, value, ttl, max_entries)
                        .await
                        .map(|evicted| self.record_evictions(namespace, evicted))
                }
                PendingOp::Delete { namespace, key } => shared.delete(namespace, key).await.map(|_| ()),
                PendingOp::Clear { namespace } => shared
                    .clear_namespace(namespace, self.config.scan_batch_size)
                    .await
                    .map(|_| ()),
            };

            if let Err(e) = result {
                warn!(error = %e, applied = applied, "Cache resync interrupted");
                let mut unapplied = vec![(seq, op)];
                unapplied.extend(remaining);
                self.pending.lock().restore(unapplied);
                return Err(self.unavailable(&format!("resync failed: {e}")));
            }
            applied += 1;
        }

        info!(applied = applied, total = total, "Cache resync complete");
        Ok(applied)
    }

    async fn record_shared_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.coordinator.is_healthy(services::CACHE) {
            return;
        }
        match self.resync().await {
            Ok(_) => {
                self.coordinator.mark_healthy(services::CACHE).await;
            }
            Err(e) => debug!(error = %e, "Cache stays degraded until resync completes"),
        }
    }

    fn record_shared_failure(&self, operation: &str, namespace: &str, reason: &str) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        crate::log_cache!(
            warn,
            "SHARED_FAILURE",
            namespace: namespace,
            operation_name: operation,
            consecutive_failures: failures,
            error: reason
        );
        if failures >= self.config.failure_threshold {
            self.coordinator.mark_unavailable(services::CACHE, reason);
        } else {
            self.coordinator.mark_degraded(services::CACHE, reason);
        }
    }

    // ------------------------------------------------------------------
    // Stats and maintenance
    // ------------------------------------------------------------------

    fn store_local(&self, namespace: &str, key: &str, value: &str, ttl: Duration, policy: NamespacePolicy) {
        let evicted = self.local.set(namespace, key, value, ttl, policy.max_entries);
        self.record_evictions(namespace, evicted.len() as u64);
    }

    fn record_lookup(&self, namespace: &str, tier: &str, hit: bool) {
        let labels = [("namespace", namespace), ("tier", tier)];
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(names::CACHE_HITS, &labels);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment(names::CACHE_MISSES, &labels);
        }
    }

    fn record_evictions(&self, namespace: &str, evicted: u64) {
        if evicted == 0 {
            return;
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        self.metrics.record(
            names::CACHE_EVICTIONS,
            MetricKind::Counter,
            evicted as f64,
            &[("namespace", namespace)],
        );
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_ratio = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };
        self.metrics.gauge(names::CACHE_HIT_RATIO, hit_ratio, &[]);

        CacheStats {
            hits,
            misses,
            hit_ratio,
            evictions: self.evictions.load(Ordering::Relaxed),
            local_entries: self.local.total_len(),
            pending_resync: self.pending.lock().len(),
            shared_healthy: self.shared.is_some() && self.coordinator.is_healthy(services::CACHE),
        }
    }

    /// Drops expired local entries, then heals or resyncs the shared tier
    pub async fn run_sweep(&self) -> WardenResult<CacheSweepReport> {
        let mut report = CacheSweepReport {
            purged: self.local.purge_expired(),
            ..CacheSweepReport::default()
        };
        if self.shared.is_none() {
            return Ok(report);
        }

        if self.coordinator.is_healthy(services::CACHE) {
            report.resynced = self.resync().await?;
            return Ok(report);
        }

        let before = self.pending.lock().len();
        match self.probe().await {
            Ok(()) => {
                self.coordinator.mark_healthy(services::CACHE).await;
                report.resynced = before;
                report.healed = true;
                info!("Shared cache tier healed");
            }
            Err(e) => debug!(error = %e, "Shared cache tier still unreachable"),
        }
        Ok(report)
    }

    /// Periodic [`run_sweep`](Self::run_sweep); stops once the cache is dropped
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    debug!("Cache dropped, stopping maintenance task");
                    break;
                };
                if let Err(e) = cache.run_sweep().await {
                    warn!(error = %e, "Cache sweep failed");
                }
            }
        })
    }
}
