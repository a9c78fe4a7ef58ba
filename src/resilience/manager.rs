//! # Circuit Breaker Manager
//!
//! Registry of breakers keyed by component name. Breakers are created lazily
//! from the per-component config, or registered pre-built when they need a
//! custom failure predicate or fallback.

use crate::config::CircuitBreakerSettings;
use crate::metrics::{MetricsRecorder, TracingMetricsRecorder};
use crate::resilience::{CircuitBreaker, CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct CircuitBreakerManager {
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
    recorder: Arc<dyn MetricsRecorder>,
}

impl CircuitBreakerManager {
    pub fn from_settings(settings: &CircuitBreakerSettings) -> Self {
        Self::with_recorder(settings, Arc::new(TracingMetricsRecorder))
    }

    pub fn with_recorder(
        settings: &CircuitBreakerSettings,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> Self {
        info!(
            enabled = settings.enabled,
            component_overrides = settings.component_configs.len(),
            "Initializing circuit breaker manager"
        );

        Self {
            circuit_breakers: DashMap::new(),
            settings: settings.clone(),
            recorder,
        }
    }

    /// Get or create circuit breaker for a component
    pub fn get_circuit_breaker(&self, component_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.get(component_name) {
            return Arc::clone(breaker.value());
        }

        let entry = self
            .circuit_breakers
            .entry(component_name.to_string())
            .or_insert_with(|| {
                let config = self
                    .settings
                    .config_for_component(component_name)
                    .to_resilience_config();
                info!(component = component_name, "Created new circuit breaker");
                Arc::new(
                    CircuitBreaker::new(component_name.to_string(), config)
                        .with_enabled(self.settings.enabled)
                        .with_metrics_recorder(Arc::clone(&self.recorder)),
                )
            });
        Arc::clone(entry.value())
    }

    /// Register a pre-configured breaker built from this manager's settings.
    /// `customize` receives a breaker already carrying the component's
    /// thresholds and may attach a predicate or fallback.
    pub fn register_with<F>(&self, component_name: &str, customize: F) -> Arc<CircuitBreaker>
    where
        F: FnOnce(CircuitBreaker) -> CircuitBreaker,
    {
        let config = self
            .settings
            .config_for_component(component_name)
            .to_resilience_config();
        let base = CircuitBreaker::new(component_name.to_string(), config)
            .with_enabled(self.settings.enabled)
            .with_metrics_recorder(Arc::clone(&self.recorder));
        let breaker = Arc::new(customize(base));

        if self
            .circuit_breakers
            .insert(component_name.to_string(), Arc::clone(&breaker))
            .is_some()
        {
            warn!(component = component_name, "Replaced existing circuit breaker");
        }
        breaker
    }

    pub fn list_components(&self) -> Vec<String> {
        self.circuit_breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn get_component_metrics(&self, component_name: &str) -> Option<CircuitBreakerMetrics> {
        self.circuit_breakers
            .get(component_name)
            .map(|breaker| breaker.metrics())
    }

    pub fn get_system_metrics(&self) -> SystemCircuitBreakerMetrics {
        self.circuit_breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    /// Emergency stop
    pub fn force_open_all(&self) {
        warn!("Forcing all circuit breakers open");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_open();
        }
    }

    pub fn force_close_all(&self) {
        warn!("Forcing all circuit breakers closed");
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }

    pub fn remove_circuit_breaker(&self, component_name: &str) -> bool {
        self.circuit_breakers.remove(component_name).is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;
    use std::io;

    #[tokio::test]
    async fn test_breakers_are_shared_per_component() {
        let manager = CircuitBreakerManager::from_settings(&CircuitBreakerSettings::default());

        let first = manager.get_circuit_breaker("media_backend");
        let second = manager.get_circuit_breaker("media_backend");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.config().failure_threshold, 3);

        let other = manager.get_circuit_breaker("lyrics_api");
        assert_eq!(other.config().failure_threshold, 5);
        assert_eq!(manager.list_components().len(), 2);
    }

    #[tokio::test]
    async fn test_registered_breaker_keeps_customization() {
        let manager = CircuitBreakerManager::from_settings(&CircuitBreakerSettings::default());
        let breaker = manager.register_with("chat_api", |b| {
            b.with_failure_predicate(|err| {
                err.downcast_ref::<io::Error>()
                    .is_some_and(|e| e.kind() == io::ErrorKind::TimedOut)
            })
        });

        for _ in 0..10 {
            let _ = breaker
                .call(|| async { Err::<(), _>(io::Error::new(io::ErrorKind::NotFound, "404")) })
                .await;
        }
        assert_eq!(
            manager.get_circuit_breaker("chat_api").state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_system_metrics_and_force_all() {
        let manager = CircuitBreakerManager::from_settings(&CircuitBreakerSettings::default());
        manager.get_circuit_breaker("chat_api");
        manager.get_circuit_breaker("media_backend");

        manager.force_open_all();
        let metrics = manager.get_system_metrics();
        assert_eq!(metrics.count_by_state().get(&CircuitState::Open), Some(&2));

        manager.force_close_all();
        assert_eq!(manager.get_system_metrics().health_score(), 1.0);
        assert!(manager.remove_circuit_breaker("chat_api"));
        assert!(manager.get_component_metrics("chat_api").is_none());
    }
}
