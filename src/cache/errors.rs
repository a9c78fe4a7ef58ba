//! Cache error types

use thiserror::Error;

/// Failures of a cache tier; [`crate::cache::UnifiedCache`] turns shared-tier
/// failures into degradation instead of propagating them
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// Failed to connect to the shared backend
    #[error("Cache connection error: {0}")]
    ConnectionError(String),

    #[error("Cache serialization error: {0}")]
    SerializationError(String),

    #[error("Cache operation timed out: {0}")]
    Timeout(String),

    /// The backend answered with an error
    #[error("Cache backend error: {0}")]
    BackendError(String),
}

pub type CacheResult<T> = Result<T, CacheError>;
