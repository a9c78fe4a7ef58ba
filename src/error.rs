//! Error types for the Warden resilience core.
//!
//! Every fallible public operation returns [`WardenResult`]. Deferred writes are
//! not errors: they surface as [`crate::database::WriteOutcome::Queued`].

use crate::resilience::CircuitBreakerError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum WardenError {
    /// Retryable storage failure that survived the configured retry budget
    #[error("Transient storage error after {attempts} attempt(s){}: {message}", code_suffix(.code))]
    TransientStorage {
        code: Option<String>,
        message: String,
        attempts: u32,
    },
    /// Syntax, constraint or schema failure; never retried
    #[error("Fatal query error{}: {message}", code_suffix(.code))]
    FatalQuery {
        code: Option<String>,
        message: String,
    },
    /// Disallowed table or identifier, rejected before any network call
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("{0} not initialized")]
    NotInitialized(String),
    #[error("Circuit breaker open: {component}")]
    CircuitOpen { component: String },
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Service {service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },
    #[error("Cache error: {0}")]
    CacheError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref()
        .map(|c| format!(" [{c}]"))
        .unwrap_or_default()
}

impl WardenError {
    /// Whether the caller should present this as "temporarily unavailable"
    /// rather than as a bug
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Self::TransientStorage { .. }
                | Self::CircuitOpen { .. }
                | Self::Timeout(_)
                | Self::ServiceUnavailable { .. }
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(error: serde_json::Error) -> Self {
        WardenError::SerializationError(format!("JSON serialization error: {error}"))
    }
}

impl From<crate::cache::CacheError> for WardenError {
    fn from(error: crate::cache::CacheError) -> Self {
        WardenError::CacheError(error.to_string())
    }
}

impl From<crate::config::ConfigurationError> for WardenError {
    fn from(error: crate::config::ConfigurationError) -> Self {
        WardenError::ConfigurationError(error.to_string())
    }
}

impl From<CircuitBreakerError<WardenError>> for WardenError {
    fn from(error: CircuitBreakerError<WardenError>) -> Self {
        match error {
            CircuitBreakerError::CircuitOpen { component } => WardenError::CircuitOpen { component },
            CircuitBreakerError::Timeout { component, timeout } => WardenError::Timeout(format!(
                "{component} exceeded {}ms",
                timeout.as_millis()
            )),
            CircuitBreakerError::OperationFailed(inner) => inner,
        }
    }
}

pub type WardenResult<T> = Result<T, WardenError>;
