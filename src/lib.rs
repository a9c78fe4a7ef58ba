#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Warden Core
//!
//! Resilience and data-access core of the Warden moderation and media-queue
//! bot. Every shard of the bot embeds one instance; shards coordinate only
//! through PostgreSQL and Redis.
//!
//! ## Module Organization
//!
//! - [`database`] - pooled PostgreSQL access with retry, replica routing,
//!   allow-listed statement builders, transactions and atomic sequences
//! - [`resilience`] - per-dependency circuit breakers
//! - [`degradation`] - service health, fallback resolution and the write-ahead
//!   queue replayed on recovery
//! - [`cache`] - namespaced two-tier cache with rate limits, cooldowns and
//!   moderation counters
//! - [`system_context`] - bootstraps all of the above from one configuration
//! - [`config`] - layered TOML and environment configuration
//! - [`error`] - the crate error type
//! - [`metrics`] - metric names and the recorder seam
//! - [`logging`] - subscriber setup and domain log macros
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use warden_core::system_context::WardenContext;
//!
//! # async fn example() -> warden_core::WardenResult<()> {
//! let context = WardenContext::new().await?;
//! let _maintenance = context.spawn_maintenance();
//!
//! let prefix = context.cache.get("guild_settings", "1234").await?;
//! # let _ = prefix;
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod constants;
pub mod database;
pub mod degradation;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod resilience;
pub mod system_context;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use cache::{CooldownTracker, ModerationCounters, RateLimiter, UnifiedCache};
pub use config::{ConfigLoader, WardenConfig};
pub use database::{ConnectionManager, Fields, WriteOutcome};
pub use degradation::{DegradationCoordinator, HealthState};
pub use error::{WardenError, WardenResult};
pub use resilience::{CircuitBreaker, CircuitBreakerManager};
pub use system_context::WardenContext;
