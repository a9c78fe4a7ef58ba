//! # Metrics Surface
//!
//! The core emits named counters and gauges through [`MetricsRecorder`]; the
//! transport (Prometheus, OTLP, statsd) belongs to the embedding process.

use std::fmt;

/// Metric names emitted by the resilience core
pub mod names {
    pub const DB_POOL_SIZE: &str = "warden.db.pool_size";
    pub const DB_POOL_IDLE: &str = "warden.db.pool_idle";
    pub const DB_RETRIES: &str = "warden.db.retries";
    pub const DB_FAILURES: &str = "warden.db.failures";
    pub const CIRCUIT_STATE: &str = "warden.circuit.state";
    pub const CIRCUIT_REJECTIONS: &str = "warden.circuit.rejections";
    pub const WRITE_QUEUE_DEPTH: &str = "warden.write_queue.depth";
    pub const WRITE_QUEUE_REPLAYED: &str = "warden.write_queue.replayed";
    pub const WRITE_QUEUE_EXPIRED: &str = "warden.write_queue.expired";
    pub const CACHE_HITS: &str = "warden.cache.hits";
    pub const CACHE_MISSES: &str = "warden.cache.misses";
    pub const CACHE_HIT_RATIO: &str = "warden.cache.hit_ratio";
    pub const CACHE_EVICTIONS: &str = "warden.cache.evictions";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Counter => write!(f, "counter"),
            Self::Gauge => write!(f, "gauge"),
        }
    }
}

/// Generic "record metric" sink
pub trait MetricsRecorder: Send + Sync + fmt::Debug {
    fn record(&self, metric: &str, kind: MetricKind, value: f64, labels: &[(&str, &str)]);

    fn increment(&self, metric: &str, labels: &[(&str, &str)]) {
        self.record(metric, MetricKind::Counter, 1.0, labels);
    }

    fn gauge(&self, metric: &str, value: f64, labels: &[(&str, &str)]) {
        self.record(metric, MetricKind::Gauge, value, labels);
    }
}

/// Emits each metric as a `tracing` event on the `warden::metrics` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsRecorder;

impl MetricsRecorder for TracingMetricsRecorder {
    fn record(&self, metric: &str, kind: MetricKind, value: f64, labels: &[(&str, &str)]) {
        let labels = labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        tracing::trace!(
            target: "warden::metrics",
            metric = metric,
            kind = %kind,
            value = value,
            labels = %labels,
            "metric"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsRecorder;

impl MetricsRecorder for NoopMetricsRecorder {
    fn record(&self, _metric: &str, _kind: MetricKind, _value: f64, _labels: &[(&str, &str)]) {}
}
