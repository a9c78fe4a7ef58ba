//! # Degradation Coordinator
//!
//! Owns the health record of every registered service, resolves values through
//! a fallback chain while a service is unhealthy, and keeps deferred writes in
//! the write-ahead queue until the service recovers.
//!
//! ## Fallback chain
//!
//! `primary` (only while HEALTHY) → call-site fallback → registered handler →
//! last-known-good value → static default → `ServiceUnavailable`.
//!
//! ## Recovery
//!
//! A `mark_healthy` that changes state drains this shard's queue in enqueue
//! order. Entries are removed only after their replay succeeds; a failing or
//! unhealthy service holds back its later entries. Concurrent recoveries are
//! coalesced into the running pass.

use crate::config::DegradationConfig;
use crate::degradation::health::{HealthState, ServiceHealthRecord};
use crate::degradation::write_queue::{QueuedWrite, WriteQueue};
use crate::error::{WardenError, WardenResult};
use crate::metrics::{names, MetricsRecorder, TracingMetricsRecorder};
use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type FallbackHandler = Arc<dyn Fn(String) -> BoxFuture<'static, WardenResult<Value>> + Send + Sync>;
pub type ReplayHandler = Arc<dyn Fn(QueuedWrite) -> BoxFuture<'static, WardenResult<()>> + Send + Sync>;
pub type ProbeHandler = Arc<dyn Fn() -> BoxFuture<'static, WardenResult<()>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Primary,
    CallSiteFallback,
    RegisteredFallback,
    LastKnownGood,
    StaticDefault,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub source: ResolutionSource,
}

impl<T> Resolved<T> {
    pub fn is_degraded(&self) -> bool {
        self.source != ResolutionSource::Primary
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub replayed: usize,
    pub retained: usize,
    pub expired: usize,
    /// Another recovery was already running and picked this request up
    pub coalesced: bool,
}

impl RecoveryReport {
    fn merge(&mut self, pass: RecoveryReport) {
        self.replayed += pass.replayed;
        self.expired += pass.expired;
        // retained reflects the latest pass only
        self.retained = pass.retained;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub healed: Vec<String>,
    pub recovery: RecoveryReport,
}

enum PrimaryAttempt<T> {
    Resolved(T),
    Skipped(String),
    Failed(String),
}

pub struct DegradationCoordinator {
    shard_id: u32,
    queue: WriteQueue,
    queue_max_age: Duration,
    sweep_interval: Duration,
    services: DashMap<String, ServiceHealthRecord>,
    fallbacks: DashMap<String, FallbackHandler>,
    defaults: DashMap<String, Value>,
    replay_handlers: DashMap<String, ReplayHandler>,
    probes: DashMap<String, ProbeHandler>,
    last_known_good: DashMap<(String, String), Value>,
    recovery_lock: tokio::sync::Mutex<()>,
    recovery_requested: AtomicBool,
    metrics: Arc<dyn MetricsRecorder>,
}

impl fmt::Debug for DegradationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DegradationCoordinator")
            .field("shard_id", &self.shard_id)
            .field("queue", &self.queue.backend_name())
            .field("services", &self.services.len())
            .field("queue_max_age", &self.queue_max_age)
            .finish()
    }
}

impl DegradationCoordinator {
    pub fn new(config: &DegradationConfig, shard_id: u32, queue: WriteQueue) -> Self {
        if queue.shard_id() != shard_id {
            warn!(
                shard_id = shard_id,
                queue_shard_id = queue.shard_id(),
                "Write queue shard differs from coordinator shard"
            );
        }
        Self {
            shard_id,
            queue,
            queue_max_age: config.queue_max_age(),
            sweep_interval: config.sweep_interval(),
            services: DashMap::new(),
            fallbacks: DashMap::new(),
            defaults: DashMap::new(),
            replay_handlers: DashMap::new(),
            probes: DashMap::new(),
            last_known_good: DashMap::new(),
            recovery_lock: tokio::sync::Mutex::new(()),
            recovery_requested: AtomicBool::new(false),
            metrics: Arc::new(TracingMetricsRecorder),
        }
    }

    /// Default configuration over an in-memory queue
    pub fn in_memory(shard_id: u32) -> Self {
        Self::new(
            &DegradationConfig::default(),
            shard_id,
            WriteQueue::in_memory(shard_id),
        )
    }

    pub fn with_metrics_recorder(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    /// Registers `name` as HEALTHY; an existing record is left untouched
    pub fn register_service(&self, name: &str) {
        self.services
            .entry(name.to_string())
            .or_insert_with(|| ServiceHealthRecord::new(name));
    }

    pub fn state(&self, name: &str) -> Option<HealthState> {
        self.services.get(name).map(|r| r.state)
    }

    pub fn record(&self, name: &str) -> Option<ServiceHealthRecord> {
        self.services.get(name).map(|r| r.clone())
    }

    pub fn is_healthy(&self, name: &str) -> bool {
        self.state(name) == Some(HealthState::Healthy)
    }

    /// All health records, sorted by service name
    pub fn snapshot(&self) -> Vec<ServiceHealthRecord> {
        let mut records: Vec<_> = self.services.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    fn transition(&self, name: &str, state: HealthState, reason: Option<String>) -> Option<HealthState> {
        let mut existed = true;
        let previous = {
            let mut record = self.services.entry(name.to_string()).or_insert_with(|| {
                existed = false;
                ServiceHealthRecord::new(name)
            });
            record.transition(state, reason.clone())
        };
        if !existed || previous != state {
            crate::log_degradation!(
                info,
                "STATE_CHANGE",
                service: name,
                from: previous.to_string(),
                to: state.to_string(),
                reason: reason
            );
        }
        existed.then_some(previous)
    }

    pub fn mark_degraded(&self, name: &str, reason: impl Into<String>) {
        self.transition(name, HealthState::Degraded, Some(reason.into()));
    }

    pub fn mark_unavailable(&self, name: &str, reason: impl Into<String>) {
        self.transition(name, HealthState::Unavailable, Some(reason.into()));
    }

    /// Marks `name` HEALTHY. When it was not already healthy the write queue is
    /// drained before returning; the report of that pass is returned.
    pub async fn mark_healthy(&self, name: &str) -> Option<RecoveryReport> {
        let previous = self.transition(name, HealthState::Healthy, None);
        if previous == Some(HealthState::Healthy) {
            return None;
        }
        match self.recover_write_queue().await {
            Ok(report) => Some(report),
            Err(e) => {
                crate::log_degradation!(
                    error,
                    "RECOVERY_FAILED",
                    service: name,
                    error: e.to_string()
                );
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    /// Handler consulted with the resolution key when the primary is skipped or fails
    pub fn register_fallback<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WardenResult<Value>> + Send + 'static,
    {
        let handler: FallbackHandler = Arc::new(move |key| Box::pin(handler(key)));
        self.fallbacks.insert(name.to_string(), handler);
    }

    pub fn register_default(&self, name: &str, value: Value) {
        self.defaults.insert(name.to_string(), value);
    }

    /// Handler that re-applies one queued write of `name`
    pub fn register_replay_handler<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(QueuedWrite) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WardenResult<()>> + Send + 'static,
    {
        let handler: ReplayHandler = Arc::new(move |entry| Box::pin(handler(entry)));
        self.replay_handlers.insert(name.to_string(), handler);
    }

    /// Health check the sweep runs for a non-healthy `name`
    pub fn register_probe<F, Fut>(&self, name: &str, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WardenResult<()>> + Send + 'static,
    {
        let probe: ProbeHandler = Arc::new(move || Box::pin(probe()));
        self.probes.insert(name.to_string(), probe);
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    pub async fn resolve<T, F, Fut>(&self, name: &str, key: &str, primary: F) -> WardenResult<Resolved<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        match self.try_primary(name, key, primary).await? {
            PrimaryAttempt::Resolved(value) => Ok(Resolved {
                value,
                source: ResolutionSource::Primary,
            }),
            PrimaryAttempt::Skipped(reason) | PrimaryAttempt::Failed(reason) => {
                self.resolve_degraded(name, key, reason).await
            }
        }
    }

    pub async fn resolve_with<T, F, Fut, G, GFut>(
        &self,
        name: &str,
        key: &str,
        primary: F,
        fallback: G,
    ) -> WardenResult<Resolved<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = WardenResult<T>>,
    {
        let reason = match self.try_primary(name, key, primary).await? {
            PrimaryAttempt::Resolved(value) => {
                return Ok(Resolved {
                    value,
                    source: ResolutionSource::Primary,
                })
            }
            PrimaryAttempt::Skipped(reason) | PrimaryAttempt::Failed(reason) => reason,
        };

        match fallback().await {
            Ok(value) => {
                crate::log_degradation!(debug, "FALLBACK", service: name, key: key, source: "call_site");
                Ok(Resolved {
                    value,
                    source: ResolutionSource::CallSiteFallback,
                })
            }
            Err(e) => {
                warn!(service = name, key = key, error = %e, "Call-site fallback failed");
                self.resolve_degraded(name, key, reason).await
            }
        }
    }

    async fn try_primary<T, F, Fut>(&self, name: &str, key: &str, primary: F) -> WardenResult<PrimaryAttempt<T>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
    {
        let state = self.state(name);
        if state != Some(HealthState::Healthy) {
            let reason = match state {
                Some(state) => format!("service is {state}"),
                None => "service is not registered".to_string(),
            };
            return Ok(PrimaryAttempt::Skipped(reason));
        }

        match primary().await {
            Ok(value) => {
                match serde_json::to_value(&value) {
                    Ok(snapshot) => {
                        self.last_known_good
                            .insert((name.to_string(), key.to_string()), snapshot);
                    }
                    Err(e) => debug!(service = name, key = key, error = %e, "Value not cacheable as last-known-good"),
                }
                Ok(PrimaryAttempt::Resolved(value))
            }
            Err(e @ WardenError::ValidationError(_)) => Err(e),
            Err(e) => {
                warn!(service = name, key = key, error = %e, "Primary failed, falling back");
                Ok(PrimaryAttempt::Failed(e.to_string()))
            }
        }
    }

    async fn resolve_degraded<T>(&self, name: &str, key: &str, reason: String) -> WardenResult<Resolved<T>>
    where
        T: DeserializeOwned,
    {
        let handler = self.fallbacks.get(name).map(|h| Arc::clone(h.value()));
        if let Some(handler) = handler {
            match handler(key.to_string()).await {
                Ok(value) => match serde_json::from_value(value) {
                    Ok(value) => {
                        crate::log_degradation!(debug, "FALLBACK", service: name, key: key, source: "registered");
                        return Ok(Resolved {
                            value,
                            source: ResolutionSource::RegisteredFallback,
                        });
                    }
                    Err(e) => warn!(service = name, key = key, error = %e, "Registered fallback returned an incompatible value"),
                },
                Err(e) => warn!(service = name, key = key, error = %e, "Registered fallback failed"),
            }
        }

        let cached = self
            .last_known_good
            .get(&(name.to_string(), key.to_string()))
            .map(|v| v.value().clone());
        if let Some(value) = cached {
            match serde_json::from_value(value) {
                Ok(value) => {
                    crate::log_degradation!(debug, "FALLBACK", service: name, key: key, source: "last_known_good");
                    return Ok(Resolved {
                        value,
                        source: ResolutionSource::LastKnownGood,
                    });
                }
                Err(e) => warn!(service = name, key = key, error = %e, "Last-known-good value has a different shape"),
            }
        }

        let default = self.defaults.get(name).map(|v| v.value().clone());
        if let Some(value) = default {
            match serde_json::from_value(value) {
                Ok(value) => {
                    crate::log_degradation!(debug, "FALLBACK", service: name, key: key, source: "static_default");
                    return Ok(Resolved {
                        value,
                        source: ResolutionSource::StaticDefault,
                    });
                }
                Err(e) => warn!(service = name, key = key, error = %e, "Static default has a different shape"),
            }
        }

        Err(WardenError::ServiceUnavailable {
            service: name.to_string(),
            reason,
        })
    }

    // ------------------------------------------------------------------
    // Write-ahead queue
    // ------------------------------------------------------------------

    /// Append a deferred write for `name` to this shard's queue
    pub async fn queue_write(&self, name: &str, operation_type: &str, payload: Value) -> WardenResult<QueuedWrite> {
        let entry = QueuedWrite::new(self.shard_id, name, operation_type, payload);
        if self.queue.push(&entry).await? {
            crate::log_degradation!(
                info,
                "WRITE_QUEUED",
                service: name,
                operation_type: operation_type,
                write_id: entry.id.to_string(),
                shard_id: self.shard_id
            );
        } else {
            crate::log_degradation!(
                debug,
                "WRITE_DEDUPLICATED",
                service: name,
                dedup_key: entry.dedup_key()
            );
        }
        self.record_depth().await;
        Ok(entry)
    }

    pub async fn queue_depth(&self) -> WardenResult<usize> {
        self.queue.len().await
    }

    /// Drain this shard's queue; coalesces with a recovery already in progress
    pub async fn recover_write_queue(&self) -> WardenResult<RecoveryReport> {
        self.recovery_requested.store(true, Ordering::SeqCst);
        let mut report = RecoveryReport::default();
        let mut ran = false;

        loop {
            let Ok(guard) = self.recovery_lock.try_lock() else {
                break;
            };
            while self.recovery_requested.swap(false, Ordering::SeqCst) {
                ran = true;
                report.merge(self.drain_queue().await?);
            }
            drop(guard);
            // a request that raced the unlock still needs a pass
            if !self.recovery_requested.load(Ordering::SeqCst) {
                break;
            }
        }

        report.coalesced = !ran;
        Ok(report)
    }

    async fn drain_queue(&self) -> WardenResult<RecoveryReport> {
        let entries = self.queue.list().await?;
        let now = Utc::now();
        let mut blocked: HashSet<String> = HashSet::new();
        let mut report = RecoveryReport::default();
        let shard_label = self.shard_id.to_string();

        for entry in entries {
            if entry.age(now) > self.queue_max_age {
                self.queue.remove(&entry).await?;
                warn!(
                    service = %entry.service_name,
                    write_id = %entry.id,
                    operation_type = %entry.operation_type,
                    enqueued_at = %entry.enqueued_at,
                    "Expired queued write past its max age"
                );
                self.metrics.increment(
                    names::WRITE_QUEUE_EXPIRED,
                    &[("service", entry.service_name.as_str()), ("shard", shard_label.as_str())],
                );
                report.expired += 1;
                continue;
            }

            if blocked.contains(&entry.service_name) {
                report.retained += 1;
                continue;
            }

            if !self.is_healthy(&entry.service_name) {
                blocked.insert(entry.service_name.clone());
                report.retained += 1;
                continue;
            }

            let handler = self
                .replay_handlers
                .get(&entry.service_name)
                .map(|h| Arc::clone(h.value()));
            let Some(handler) = handler else {
                warn!(service = %entry.service_name, "No replay handler registered, retaining queued writes");
                blocked.insert(entry.service_name.clone());
                report.retained += 1;
                continue;
            };

            match handler(entry.clone()).await {
                Ok(()) => {
                    self.queue.remove(&entry).await?;
                    self.metrics.increment(
                        names::WRITE_QUEUE_REPLAYED,
                        &[("service", entry.service_name.as_str()), ("shard", shard_label.as_str())],
                    );
                    report.replayed += 1;
                }
                Err(e) => {
                    error!(
                        service = %entry.service_name,
                        write_id = %entry.id,
                        operation_type = %entry.operation_type,
                        error = %e,
                        "Replay failed, holding back later writes for this service"
                    );
                    blocked.insert(entry.service_name.clone());
                    report.retained += 1;
                }
            }
        }

        if report.replayed > 0 || report.expired > 0 {
            crate::log_degradation!(
                info,
                "QUEUE_RECOVERED",
                replayed: report.replayed,
                retained: report.retained,
                expired: report.expired,
                shard_id: self.shard_id
            );
        }
        self.record_depth().await;
        Ok(report)
    }

    async fn record_depth(&self) {
        if let Ok(depth) = self.queue.len().await {
            self.metrics.gauge(
                names::WRITE_QUEUE_DEPTH,
                depth as f64,
                &[("shard", self.shard_id.to_string().as_str())],
            );
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Probe every non-healthy service that has a probe, then drain the queue.
    /// Healing a service drains as part of its `mark_healthy`; the trailing
    /// drain also expires stale entries.
    pub async fn run_sweep(&self) -> WardenResult<SweepReport> {
        let unhealthy: Vec<(String, ProbeHandler)> = self
            .services
            .iter()
            .filter(|r| !r.is_healthy())
            .filter_map(|r| {
                self.probes
                    .get(r.key())
                    .map(|p| (r.key().clone(), Arc::clone(p.value())))
            })
            .collect();

        let mut report = SweepReport::default();
        for (name, probe) in unhealthy {
            match probe().await {
                Ok(()) => {
                    info!(service = %name, "Probe succeeded, marking healthy");
                    if let Some(pass) = self.mark_healthy(&name).await {
                        report.recovery.merge(pass);
                    }
                    report.healed.push(name);
                }
                Err(e) => debug!(service = %name, error = %e, "Probe failed"),
            }
        }

        let pass = self.recover_write_queue().await?;
        report.recovery.merge(pass);
        report.recovery.coalesced = pass.coalesced;
        Ok(report)
    }

    /// Periodic [`run_sweep`](Self::run_sweep); stops once the coordinator is dropped
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(coordinator) = weak.upgrade() else {
                    debug!("Coordinator dropped, stopping maintenance task");
                    break;
                };
                if let Err(e) = coordinator.run_sweep().await {
                    warn!(error = %e, "Degradation sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::CapturingRecorder;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn coordinator() -> DegradationCoordinator {
        let coordinator = DegradationCoordinator::in_memory(0);
        coordinator.register_service("api");
        coordinator
    }

    #[tokio::test]
    async fn test_primary_success_records_last_known_good() {
        let coordinator = coordinator();
        let resolved = coordinator
            .resolve("api", "guild:1", || async { Ok::<_, WardenError>(json!({"prefix": "!"})) })
            .await
            .unwrap();
        assert_eq!(resolved.source, ResolutionSource::Primary);

        coordinator.mark_degraded("api", "timeouts");
        let called = AtomicBool::new(false);
        let resolved: Resolved<Value> = coordinator
            .resolve("api", "guild:1", || async {
                called.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            })
            .await
            .unwrap();
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(resolved.source, ResolutionSource::LastKnownGood);
        assert_eq!(resolved.value, json!({"prefix": "!"}));
    }

    #[tokio::test]
    async fn test_fallback_chain_order() {
        let coordinator = coordinator();
        coordinator.register_default("api", json!("default"));
        coordinator.register_fallback("api", |key| async move { Ok(json!(format!("handler:{key}"))) });

        let failing = || async { Err::<String, _>(WardenError::Timeout("slow".to_string())) };

        let resolved = coordinator
            .resolve_with("api", "k", failing, || async { Ok("call_site".to_string()) })
            .await
            .unwrap();
        assert_eq!(resolved.source, ResolutionSource::CallSiteFallback);

        let resolved = coordinator
            .resolve_with("api", "k", failing, || async {
                Err(WardenError::Internal("nope".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(resolved.source, ResolutionSource::RegisteredFallback);
        assert_eq!(resolved.value, "handler:k");

        coordinator.register_fallback("api", |_| async { Err(WardenError::Internal("down".to_string())) });
        let resolved: Resolved<String> = coordinator.resolve("api", "k", failing).await.unwrap();
        assert_eq!(resolved.source, ResolutionSource::StaticDefault);
        assert_eq!(resolved.value, "default");
    }

    #[tokio::test]
    async fn test_exhausted_chain_is_service_unavailable() {
        let coordinator = coordinator();
        coordinator.mark_unavailable("api", "down");
        let err = coordinator
            .resolve::<String, _, _>("api", "k", || async { Ok("x".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WardenError::ServiceUnavailable { ref service, ref reason }
                if service == "api" && reason.contains("unavailable")
        ));
    }

    #[tokio::test]
    async fn test_validation_error_propagates() {
        let coordinator = coordinator();
        coordinator.register_default("api", json!("default"));
        let err = coordinator
            .resolve::<String, _, _>("api", "k", || async {
                Err(WardenError::validation("bad table"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WardenError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_mark_healthy_replays_in_order_and_removes() {
        let coordinator = coordinator();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        coordinator.register_replay_handler("api", move |entry| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(entry.payload["n"].as_i64().unwrap_or_default());
                Ok(())
            }
        });

        coordinator.mark_unavailable("api", "outage");
        for n in 0..3 {
            coordinator.queue_write("api", "insert", json!({"n": n})).await.unwrap();
        }
        assert_eq!(coordinator.queue_depth().await.unwrap(), 3);

        let report = coordinator.mark_healthy("api").await.unwrap();
        assert_eq!(report.replayed, 3);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
        assert_eq!(coordinator.queue_depth().await.unwrap(), 0);

        // already healthy: no recovery pass
        assert!(coordinator.mark_healthy("api").await.is_none());
    }

    #[tokio::test]
    async fn test_failed_replay_holds_back_later_entries() {
        let coordinator = coordinator();
        coordinator.register_service("other");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        coordinator.register_replay_handler("api", move |entry| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if entry.payload["poison"] == json!(true) {
                    Err(WardenError::Internal("still failing".to_string()))
                } else {
                    Ok(())
                }
            }
        });
        coordinator.register_replay_handler("other", |_| async { Ok(()) });

        coordinator.mark_degraded("api", "flaky");
        coordinator.queue_write("api", "insert", json!({"poison": true})).await.unwrap();
        coordinator.queue_write("api", "insert", json!({"n": 1})).await.unwrap();
        coordinator.queue_write("other", "insert", json!({"n": 2})).await.unwrap();

        let report = coordinator.mark_healthy("api").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.replayed, 1);
        assert_eq!(report.retained, 2);

        let remaining = coordinator.queue().list().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e.service_name == "api"));
    }

    #[tokio::test]
    async fn test_unhealthy_service_entries_are_retained() {
        let coordinator = coordinator();
        coordinator.register_service("database");
        coordinator.register_replay_handler("database", |_| async { Ok(()) });
        coordinator.mark_unavailable("database", "down");
        coordinator.queue_write("database", "update", json!({"n": 1})).await.unwrap();

        let report = coordinator.recover_write_queue().await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(report.replayed, 0);
        assert!(!report.coalesced);
    }

    #[tokio::test]
    async fn test_expired_entries_are_removed() {
        let recorder = Arc::new(CapturingRecorder::default());
        let config = DegradationConfig {
            queue_max_age_seconds: 60,
            ..DegradationConfig::default()
        };
        let queue = WriteQueue::in_memory(0);
        let coordinator = DegradationCoordinator::new(&config, 0, queue.clone())
            .with_metrics_recorder(recorder.clone());
        coordinator.register_service("api");

        let mut stale = QueuedWrite::new(0, "api", "insert", json!({"n": 1}));
        stale.enqueued_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(queue.push(&stale).await.unwrap());

        let report = coordinator.recover_write_queue().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(coordinator.queue_depth().await.unwrap(), 0);
        assert_eq!(recorder.count(names::WRITE_QUEUE_EXPIRED), 1);
        assert_eq!(recorder.last_value(names::WRITE_QUEUE_DEPTH), Some(0.0));
    }

    #[tokio::test]
    async fn test_concurrent_recoveries_are_coalesced() {
        let coordinator = Arc::new(coordinator());
        let replays = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&replays);
        coordinator.register_replay_handler("api", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        for n in 0..3 {
            coordinator.queue_write("api", "insert", json!({"n": n})).await.unwrap();
        }

        let a = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.recover_write_queue().await.unwrap() }
        });
        let b = tokio::spawn({
            let c = Arc::clone(&coordinator);
            async move { c.recover_write_queue().await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(replays.load(Ordering::SeqCst), 3);
        assert_eq!(a.replayed + b.replayed, 3);
        assert_eq!(coordinator.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_heals_through_health_check() {
        let coordinator = coordinator();
        coordinator.register_replay_handler("api", |_| async { Ok(()) });
        coordinator.register_probe("api", || async { Ok(()) });
        coordinator.mark_unavailable("api", "down");
        coordinator.queue_write("api", "delete", json!({"n": 1})).await.unwrap();

        let report = coordinator.run_sweep().await.unwrap();
        assert_eq!(report.healed, vec!["api".to_string()]);
        assert_eq!(report.recovery.replayed, 1);
        assert!(coordinator.is_healthy("api"));
    }

    #[tokio::test]
    async fn test_snapshot_is_sorted() {
        let coordinator = coordinator();
        coordinator.register_service("cache");
        coordinator.mark_degraded("database", "slow");
        let names: Vec<_> = coordinator.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["api", "cache", "database"]);
        assert_eq!(coordinator.state("database"), Some(HealthState::Degraded));
    }
}
