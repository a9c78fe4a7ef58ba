//! # Resilience Module
//!
//! Per-dependency circuit breakers for any outbound call: the relational store,
//! the chat platform API, the media backend.
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: fail fast on a dependency that keeps failing, with an
//!   optional fallback value while open
//! - **Failure predicates**: only errors the predicate accepts move the breaker
//! - **Manager**: registry keyed by component name with per-component overrides
//!
//! ## Usage
//!
//! ```rust,no_run
//! use warden_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 3,
//!     timeout: Duration::from_secs(15),
//!     reset_timeout: Duration::from_secs(60),
//! };
//!
//! let breaker = CircuitBreaker::new("media_backend".to_string(), config);
//!
//! let track = breaker.call(|| async {
//!     Ok::<_, std::io::Error>("resolved track url")
//! }).await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::{CircuitBreakerConfig, FailurePredicate, FallbackFn};
pub use manager::CircuitBreakerManager;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
