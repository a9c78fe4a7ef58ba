//! # Circuit Breaker Configuration
//!
//! Thresholds for a single breaker plus the callable pieces (failure predicate,
//! fallback) that cannot live in a config file.

use crate::error::WardenResult;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Decides whether an error counts against the breaker
pub type FailurePredicate =
    Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> bool + Send + Sync>;

/// Produces a substitute value while the breaker is open
pub type FallbackFn =
    Arc<dyn Fn() -> BoxFuture<'static, WardenResult<serde_json::Value>> + Send + Sync>;

const MAX_FAILURE_THRESHOLD: u32 = 100;
const MAX_RESET_TIMEOUT: Duration = Duration::from_secs(3600);

/// Thresholds of one breaker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive qualifying failures that open the breaker
    pub failure_threshold: u32,

    /// Hard limit on each call; exceeding it is a failure
    pub timeout: Duration,

    /// How long the breaker stays open before one trial call
    pub reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Relational store calls
    pub fn for_database() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
        }
    }

    /// Chat platform REST calls
    pub fn for_external_api() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(30),
        }
    }

    /// Media extraction and streaming backend
    pub fn for_media_backend() -> Self {
        Self {
            failure_threshold: 3,
            timeout: Duration::from_secs(15),
            reset_timeout: Duration::from_secs(60),
        }
    }

    /// Rejects zero values, more than 100 failures and an open period over an hour
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self { failure_threshold: 0, .. } => Err("failure_threshold must be at least 1".to_string()),
            Self { failure_threshold: n, .. } if *n > MAX_FAILURE_THRESHOLD => {
                Err(format!("failure_threshold {n} exceeds {MAX_FAILURE_THRESHOLD}"))
            }
            Self { timeout, .. } if timeout.is_zero() => Err("timeout must be non-zero".to_string()),
            Self { reset_timeout, .. } if reset_timeout.is_zero() || *reset_timeout > MAX_RESET_TIMEOUT => {
                Err(format!(
                    "reset_timeout {reset_timeout:?} must be within (0, {MAX_RESET_TIMEOUT:?}]"
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Accepts every error
pub fn count_all_errors() -> FailurePredicate {
    Arc::new(|_| true)
}
