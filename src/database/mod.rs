//! # Database Operations
//!
//! PostgreSQL access for the bot: pooled connections with retry and replica
//! routing, allow-listed statement builders, transactions and atomic
//! per-scope sequences.
//!
//! ## Key Components
//!
//! - [`connection_manager`] - [`ConnectionManager`], the entry point
//! - [`backend`] - the [`SqlBackend`] seam and its sqlx implementation
//! - [`error_codes`] - SQLSTATE constants and transient/fatal classification
//! - [`statement`] - identifier validation, builders and read-only detection
//! - [`sequence`] - locked sequence claims
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use warden_core::config::DatabaseConfig;
//! use warden_core::database::{ConnectionManager, Fields};
//! use warden_core::degradation::DegradationCoordinator;
//!
//! # async fn example() -> warden_core::WardenResult<()> {
//! let coordinator = Arc::new(DegradationCoordinator::in_memory(0));
//! let db = Arc::new(ConnectionManager::new(DatabaseConfig::default(), coordinator)?);
//! db.initialize().await?;
//!
//! let row = db
//!     .insert("guild_settings", &Fields::new().with("guild_id", "123").with("prefix", "!"))
//!     .await?;
//! # let _ = row;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod connection_manager;
pub mod error_codes;
pub mod retry;
pub mod sequence;
pub mod statement;
pub mod types;

pub use backend::{
    DbError, DbErrorKind, PgBackend, PgConnector, SqlBackend, SqlConnector, TransactionConnection,
};
pub use connection_manager::{ConnectionManager, TransactionScope};
pub use error_codes::{classify, ErrorClass, PgErrorCode};
pub use retry::RetryPolicy;
pub use sequence::SequenceRequest;
pub use statement::{
    is_read_only, is_valid_identifier, returns_rows, validate_identifier, Statement,
    TableAllowList,
};
pub use types::{
    ConnectionPoolStatus, Fields, PoolSizes, PoolTarget, QueryOptions, QueryResult,
    ReplicaStatus, Row, WriteOperation, WriteOutcome,
};
