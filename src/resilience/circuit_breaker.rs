//! # Circuit Breaker Implementation
//!
//! Classic three-state breaker: Closed (calls pass through), Open (calls fail
//! fast or get a fallback), HalfOpen (exactly one trial call decides whether to
//! close again). Every call runs under a hard timeout; only errors accepted by
//! the failure predicate move the breaker.

use crate::error::{WardenError, WardenResult};
use crate::metrics::{names, MetricsRecorder, TracingMetricsRecorder};
use crate::resilience::config::{count_all_errors, FailurePredicate, FallbackFn};
use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lock-free counters updated on every call
#[derive(Debug)]
struct AtomicCircuitBreakerMetrics {
    total_calls: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    ignored_errors: AtomicU64,
    timeouts: AtomicU64,
    rejected_calls: AtomicU64,
    total_duration_nanos: AtomicU64,
}

impl AtomicCircuitBreakerMetrics {
    fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            ignored_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            total_duration_nanos: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record_call(&self, outcome: &AtomicU64, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        outcome.fetch_add(1, Ordering::Relaxed);
        self.total_duration_nanos
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self, state: CircuitState, consecutive_failures: u32) -> CircuitBreakerMetrics {
        let total_calls = self.total_calls.load(Ordering::Relaxed);
        let success_count = self.success_count.load(Ordering::Relaxed);
        let failure_count = self.failure_count.load(Ordering::Relaxed);
        let total_duration_nanos = self.total_duration_nanos.load(Ordering::Relaxed);

        let (failure_rate, success_rate, average_duration) = if total_calls > 0 {
            (
                failure_count as f64 / total_calls as f64,
                success_count as f64 / total_calls as f64,
                Duration::from_nanos(total_duration_nanos / total_calls),
            )
        } else {
            (0.0, 0.0, Duration::ZERO)
        };

        CircuitBreakerMetrics {
            total_calls,
            success_count,
            failure_count,
            ignored_errors: self.ignored_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            consecutive_failures: u64::from(consecutive_failures),
            current_state: state,
            failure_rate,
            success_rate,
            average_duration,
        }
    }
}

/// Breaker state, stored as a `u8` in an atomic
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    #[default]
    Closed = 0,
    /// Calls fail fast until the open timeout elapses
    Open = 1,
    /// One trial call decides between closed and open
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Open,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or a trial is already in flight); the operation was not called
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation exceeded the hard per-call timeout
    #[error("{component} timed out after {timeout:?}")]
    Timeout { component: String, timeout: Duration },

    /// Operation returned an error
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

enum Admission {
    Normal,
    Trial(TrialPermit),
}

/// Holds the single half-open slot; the slot is released on drop so a
/// cancelled trial cannot wedge the breaker in HalfOpen.
struct TrialPermit {
    slot: Arc<AtomicBool>,
}

impl Drop for TrialPermit {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// Core circuit breaker implementation with atomic state management
pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    config: CircuitBreakerConfig,
    metrics: AtomicCircuitBreakerMetrics,
    consecutive_failures: AtomicU32,
    /// Nanos since `clock_origin` when the circuit opened (0 = not open)
    opened_at_nanos: AtomicU64,
    clock_origin: Instant,
    trial_in_flight: Arc<AtomicBool>,
    failure_predicate: FailurePredicate,
    fallback: Option<FallbackFn>,
    enabled: bool,
    recorder: Arc<dyn MetricsRecorder>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &CircuitState::from(self.state.load(Ordering::Acquire)))
            .field("config", &self.config)
            .field("has_fallback", &self.fallback.is_some())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: String, config: CircuitBreakerConfig) -> Self {
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            reset_timeout_ms = config.reset_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );

        Self {
            name,
            state: AtomicU8::new(CircuitState::Closed as u8),
            config,
            metrics: AtomicCircuitBreakerMetrics::new(),
            consecutive_failures: AtomicU32::new(0),
            opened_at_nanos: AtomicU64::new(0),
            clock_origin: Instant::now(),
            trial_in_flight: Arc::new(AtomicBool::new(false)),
            failure_predicate: count_all_errors(),
            fallback: None,
            enabled: true,
            recorder: Arc::new(TracingMetricsRecorder),
        }
    }

    /// Only errors this predicate accepts count toward opening the circuit
    pub fn with_failure_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.failure_predicate = Arc::new(predicate);
        self
    }

    /// Fallback used by [`CircuitBreaker::execute`] while open
    pub fn with_fallback<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WardenResult<serde_json::Value>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move || Box::pin(fallback())));
        self
    }

    /// Static fallback value
    pub fn with_fallback_value(self, value: serde_json::Value) -> Self {
        self.with_fallback(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    pub fn with_metrics_recorder(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// A disabled breaker still enforces the timeout but never opens
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Current state. Open becomes HalfOpen here once `reset_timeout` has elapsed.
    pub fn state(&self) -> CircuitState {
        let current = CircuitState::from(self.state.load(Ordering::Acquire));
        if current == CircuitState::Open && self.reset_timeout_elapsed() {
            if self
                .state
                .compare_exchange(
                    CircuitState::Open as u8,
                    CircuitState::HalfOpen as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                info!(component = %self.name, "Circuit breaker half-open (admitting trial call)");
                self.record_state_gauge(CircuitState::HalfOpen);
            }
            return CircuitState::from(self.state.load(Ordering::Acquire));
        }
        current
    }

    /// Execute an operation with circuit breaker protection
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let Some(admission) = self.admit() else {
            self.metrics.rejected_calls.fetch_add(1, Ordering::Relaxed);
            self.recorder
                .increment(names::CIRCUIT_REJECTIONS, &[("component", self.name.as_str())]);
            return Err(CircuitBreakerError::CircuitOpen {
                component: self.name.clone(),
            });
        };

        let start = Instant::now();
        let outcome = tokio::time::timeout(self.config.timeout, operation()).await;
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(value)) => {
                self.record_success(admission, duration);
                Ok(value)
            }
            Ok(Err(err)) => {
                if (self.failure_predicate)(&err) {
                    self.record_failure(admission, duration);
                } else {
                    self.metrics
                        .record_call(&self.metrics.ignored_errors, duration);
                    debug!(
                        component = %self.name,
                        error = %err,
                        "Error not counted against circuit"
                    );
                }
                Err(CircuitBreakerError::OperationFailed(err))
            }
            Err(_) => {
                self.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                self.record_failure(admission, duration);
                Err(CircuitBreakerError::Timeout {
                    component: self.name.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    /// Like [`CircuitBreaker::call`], but while open the configured fallback (if
    /// any) supplies the value.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> WardenResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
        T: DeserializeOwned,
    {
        match self.call(operation).await {
            Err(CircuitBreakerError::CircuitOpen { component }) => match &self.fallback {
                Some(fallback) => {
                    debug!(component = %component, "Circuit open, using configured fallback");
                    let value = fallback().await?;
                    Ok(serde_json::from_value(value)?)
                }
                None => Err(WardenError::CircuitOpen { component }),
            },
            other => other.map_err(WardenError::from),
        }
    }

    /// Call-site fallback used only when the circuit rejects the call
    pub async fn execute_with_fallback<F, Fut, T, FB, FbFut>(
        &self,
        operation: F,
        fallback: FB,
    ) -> WardenResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = WardenResult<T>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = WardenResult<T>>,
    {
        match self.call(operation).await {
            Err(CircuitBreakerError::CircuitOpen { component }) => {
                debug!(component = %component, "Circuit open, using call-site fallback");
                fallback().await
            }
            other => other.map_err(WardenError::from),
        }
    }

    fn admit(&self) -> Option<Admission> {
        if !self.enabled {
            return Some(Admission::Normal);
        }

        match self.state() {
            CircuitState::Closed => Some(Admission::Normal),
            CircuitState::HalfOpen => self
                .trial_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| {
                    Admission::Trial(TrialPermit {
                        slot: Arc::clone(&self.trial_in_flight),
                    })
                }),
            CircuitState::Open => None,
        }
    }

    fn record_success(&self, admission: Admission, duration: Duration) {
        self.metrics
            .record_call(&self.metrics.success_count, duration);

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "Operation succeeded"
        );

        if !self.enabled {
            return;
        }

        match admission {
            Admission::Trial(_permit) => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    self.consecutive_failures.store(0, Ordering::Release);
                    self.opened_at_nanos.store(0, Ordering::Release);
                    info!(component = %self.name, "Circuit breaker closed (recovered)");
                }
            }
            Admission::Normal => {
                if self.state() == CircuitState::Closed {
                    self.consecutive_failures.store(0, Ordering::Release);
                }
            }
        }
    }

    fn record_failure(&self, admission: Admission, duration: Duration) {
        self.metrics
            .record_call(&self.metrics.failure_count, duration);

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            consecutive_failures = failures,
            "Operation failed"
        );

        if !self.enabled {
            return;
        }

        match admission {
            Admission::Trial(_permit) => {
                self.opened_at_nanos.store(self.now_nanos(), Ordering::Release);
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    error!(
                        component = %self.name,
                        reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                        "Trial call failed, circuit breaker re-opened"
                    );
                }
            }
            Admission::Normal => {
                if failures >= self.config.failure_threshold {
                    self.opened_at_nanos.store(self.now_nanos(), Ordering::Release);
                    if self.transition(CircuitState::Closed, CircuitState::Open) {
                        error!(
                            component = %self.name,
                            consecutive_failures = failures,
                            failure_threshold = self.config.failure_threshold,
                            reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                            "Circuit breaker opened (failing fast)"
                        );
                    }
                }
            }
        }
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let moved = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if moved {
            self.record_state_gauge(to);
        }
        moved
    }

    fn record_state_gauge(&self, state: CircuitState) {
        self.recorder.gauge(
            names::CIRCUIT_STATE,
            f64::from(state as u8),
            &[("component", self.name.as_str())],
        );
    }

    fn now_nanos(&self) -> u64 {
        self.clock_origin.elapsed().as_nanos() as u64 + 1
    }

    fn reset_timeout_elapsed(&self) -> bool {
        let opened = self.opened_at_nanos.load(Ordering::Acquire);
        if opened == 0 {
            return true;
        }
        self.now_nanos().saturating_sub(opened) >= self.config.reset_timeout.as_nanos() as u64
    }

    /// Force circuit to open state
    pub fn force_open(&self) {
        warn!(component = %self.name, "Circuit breaker forced open");
        self.opened_at_nanos.store(self.now_nanos(), Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.record_state_gauge(CircuitState::Open);
    }

    /// Force circuit to closed state
    pub fn force_closed(&self) {
        warn!(component = %self.name, "Circuit breaker forced closed");
        self.consecutive_failures.store(0, Ordering::Release);
        self.opened_at_nanos.store(0, Ordering::Release);
        self.state.store(CircuitState::Closed as u8, Ordering::Release);
        self.record_state_gauge(CircuitState::Closed);
    }

    /// Consecutive qualifying failures since the last success or close
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.metrics.snapshot(self.state(), self.failure_count())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Closed with a failure rate under 10% (or too few calls to judge)
    pub fn is_healthy(&self) -> bool {
        if self.state() != CircuitState::Closed {
            return false;
        }

        let total_calls = self.metrics.total_calls.load(Ordering::Relaxed);
        if total_calls < 10 {
            return true;
        }

        let failure_count = self.metrics.failure_count.load(Ordering::Relaxed);
        (failure_count as f64 / total_calls as f64) < 0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    fn config(failure_threshold: u32, reset_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            timeout: Duration::from_millis(200),
            reset_timeout: Duration::from_millis(reset_ms),
        }
    }

    fn io_err(kind: io::ErrorKind) -> io::Error {
        io::Error::new(kind, "boom")
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("test".to_string(), config(3, 100));
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, io::Error>("success") }).await;
        assert_eq!(result.unwrap(), "success");

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_on_failures() {
        let circuit = CircuitBreaker::new("test".to_string(), config(2, 100));

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::ConnectionReset)) })
            .await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.failure_count(), 1);

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::ConnectionReset)) })
            .await;
        assert_eq!(circuit.state(), CircuitState::Open);

        let mut invoked = false;
        let result = circuit
            .call(|| {
                invoked = true;
                async { Ok::<_, io::Error>("should not execute") }
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert!(!invoked);
        assert_eq!(circuit.metrics().rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let circuit = CircuitBreaker::new("test".to_string(), config(2, 100));

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::Other)) })
            .await;
        let _ = circuit.call(|| async { Ok::<_, io::Error>(()) }).await;
        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::Other)) })
            .await;

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_non_qualifying_errors_leave_state_untouched() {
        let circuit = CircuitBreaker::new("test".to_string(), config(1, 100)).with_failure_predicate(
            |err| {
                err.downcast_ref::<io::Error>()
                    .is_some_and(|e| e.kind() != io::ErrorKind::NotFound)
            },
        );

        for _ in 0..5 {
            let result = circuit
                .call(|| async { Err::<(), _>(io_err(io::ErrorKind::NotFound)) })
                .await;
            assert!(matches!(result, Err(CircuitBreakerError::OperationFailed(_))));
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.failure_count(), 0);
        assert_eq!(circuit.metrics().ignored_errors, 5);

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::TimedOut)) })
            .await;
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let circuit = CircuitBreaker::new(
            "slow".to_string(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout: Duration::from_millis(20),
                reset_timeout: Duration::from_secs(60),
            },
        )
        .with_failure_predicate(|_| false);

        let result = circuit
            .call(|| async {
                sleep(Duration::from_millis(200)).await;
                Ok::<_, io::Error>(())
            })
            .await;

        assert!(matches!(result, Err(CircuitBreakerError::Timeout { .. })));
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_recovery() {
        let circuit = CircuitBreaker::new("test".to_string(), config(1, 50));

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::Other)) })
            .await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(80)).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        let result = circuit.call(|| async { Ok::<_, io::Error>("recovered") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_trial_restarts_open_timer() {
        let circuit = CircuitBreaker::new("test".to_string(), config(1, 50));

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::Other)) })
            .await;
        sleep(Duration::from_millis(80)).await;

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::Other)) })
            .await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_admits_exactly_one_trial() {
        let circuit = Arc::new(CircuitBreaker::new("test".to_string(), config(1, 30)));

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::Other)) })
            .await;
        sleep(Duration::from_millis(50)).await;

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let trial_breaker = Arc::clone(&circuit);
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, io::Error>("trial")
                })
                .await
        });

        started_rx.await.unwrap();
        let concurrent = circuit.call(|| async { Ok::<_, io::Error>("second") }).await;
        assert!(matches!(concurrent, Err(CircuitBreakerError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert_eq!(trial.await.unwrap().unwrap(), "trial");
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_cancelled_trial_releases_slot() {
        let circuit = CircuitBreaker::new("test".to_string(), config(1, 20));

        let _ = circuit
            .call(|| async { Err::<(), _>(io_err(io::ErrorKind::Other)) })
            .await;
        sleep(Duration::from_millis(40)).await;

        let pending = circuit.call(|| async {
            sleep(Duration::from_secs(10)).await;
            Ok::<_, io::Error>(())
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), pending).await;

        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        let result = circuit.call(|| async { Ok::<_, io::Error>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execute_uses_configured_fallback() {
        let circuit = CircuitBreaker::new("media_backend".to_string(), config(1, 60_000))
            .with_fallback_value(serde_json::json!(["cached-track"]));
        circuit.force_open();

        let tracks: Vec<String> = circuit
            .execute(|| async { Ok(vec!["live-track".to_string()]) })
            .await
            .unwrap();
        assert_eq!(tracks, vec!["cached-track".to_string()]);
    }

    #[tokio::test]
    async fn test_execute_without_fallback_reports_open() {
        let circuit = CircuitBreaker::new("chat_api".to_string(), config(1, 60_000));
        circuit.force_open();

        let result: WardenResult<u32> = circuit.execute(|| async { Ok(1) }).await;
        assert_eq!(
            result,
            Err(WardenError::CircuitOpen {
                component: "chat_api".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_execute_with_fallback_only_when_open() {
        let circuit = CircuitBreaker::new("chat_api".to_string(), config(5, 60_000));

        let result = circuit
            .execute_with_fallback(
                || async { Err::<u32, _>(WardenError::validation("bad input")) },
                || async { Ok(0) },
            )
            .await;
        assert_eq!(result, Err(WardenError::validation("bad input")));

        circuit.force_open();
        let result = circuit
            .execute_with_fallback(|| async { Ok(1) }, || async { Ok(0) })
            .await;
        assert_eq!(result, Ok(0));

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_disabled_breaker_never_opens() {
        let circuit = CircuitBreaker::new("test".to_string(), config(1, 60_000)).with_enabled(false);

        for _ in 0..3 {
            let _ = circuit
                .call(|| async { Err::<(), _>(io_err(io::ErrorKind::Other)) })
                .await;
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(circuit.call(|| async { Ok::<_, io::Error>(()) }).await.is_ok());
    }
}
