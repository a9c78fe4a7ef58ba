//! Point-in-time breaker metrics, per component and for the whole registry

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// Closed breakers failing more often than this are reported unhealthy
const UNHEALTHY_FAILURE_RATE: f64 = 0.1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that reached the operation
    pub total_calls: u64,
    pub success_count: u64,
    /// Failures accepted by the failure predicate, timeouts included
    pub failure_count: u64,
    /// Errors the predicate rejected; these never move the breaker
    pub ignored_errors: u64,
    pub timeouts: u64,
    /// Calls refused while open or while a trial was in flight
    pub rejected_calls: u64,
    pub consecutive_failures: u64,
    pub current_state: CircuitState,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    /// Half-open counts as healthy: the trial call decides
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failure_rate < UNHEALTHY_FAILURE_RATE,
        }
    }
}

impl fmt::Display for CircuitBreakerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} calls={} ok={:.1}% failed={} timeouts={} rejected={} avg={}ms",
            self.current_state,
            self.total_calls,
            self.success_rate * 100.0,
            self.failure_count,
            self.timeouts,
            self.rejected_calls,
            self.average_duration.as_millis()
        )
    }
}

/// Metrics of every registered breaker, keyed by component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    pub components: BTreeMap<String, CircuitBreakerMetrics>,
    pub collected_at: DateTime<Utc>,
}

impl FromIterator<(String, CircuitBreakerMetrics)> for SystemCircuitBreakerMetrics {
    fn from_iter<I: IntoIterator<Item = (String, CircuitBreakerMetrics)>>(iter: I) -> Self {
        Self {
            components: iter.into_iter().collect(),
            collected_at: Utc::now(),
        }
    }
}

impl SystemCircuitBreakerMetrics {
    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        let mut counts = HashMap::new();
        for metrics in self.components.values() {
            *counts.entry(metrics.current_state).or_insert(0) += 1;
        }
        counts
    }

    /// Components whose breaker is open, in name order
    pub fn open_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, m)| m.current_state == CircuitState::Open)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn unhealthy_components(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|(_, m)| !m.is_healthy())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Fraction of healthy breakers; 1.0 with none registered
    pub fn health_score(&self) -> f64 {
        if self.components.is_empty() {
            return 1.0;
        }
        let healthy = self.components.values().filter(|m| m.is_healthy()).count();
        healthy as f64 / self.components.len() as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.components.values().map(|m| m.total_calls).sum()
    }
}

impl fmt::Display for SystemCircuitBreakerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.count_by_state();
        let count = |state| counts.get(&state).copied().unwrap_or(0);
        write!(
            f,
            "{} breakers: {} closed, {} open, {} half-open (health {:.0}%)",
            self.components.len(),
            count(CircuitState::Closed),
            count(CircuitState::Open),
            count(CircuitState::HalfOpen),
            self.health_score() * 100.0
        )
    }
}
