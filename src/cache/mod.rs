//! # Cache
//!
//! Namespaced two-tier cache. [`UnifiedCache`] fronts a shared tier
//! ([`SharedBackend`]: Redis or the in-memory stand-in) and a private
//! [`LocalLruStore`]. [`RateLimiter`], [`CooldownTracker`] and
//! [`ModerationCounters`] are built on its atomic increment.

pub mod errors;
pub mod facilities;
pub mod local;
pub mod namespace;
pub mod providers;
pub mod traits;
pub mod unified;

pub use errors::{CacheError, CacheResult};
pub use facilities::{CooldownTracker, ModerationCounters, RateLimitDecision, RateLimiter};
pub use local::{CacheEntry, LocalLruStore};
pub use namespace::{NamespacePolicy, NamespaceRegistry};
pub use providers::{MemorySharedStore, RedisSharedStore, SharedBackend};
pub use traits::{SharedHit, SharedStore};
pub use unified::{CacheStats, CacheSweepReport, UnifiedCache, UnifiedCacheBuilder};
