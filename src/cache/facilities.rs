//! Rate limits, cooldowns and moderation counters built on
//! [`UnifiedCache::increment`]
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use warden_core::cache::{CooldownTracker, UnifiedCache};
//! use warden_core::config::CacheConfig;
//! use warden_core::degradation::DegradationCoordinator;
//!
//! # tokio_test::block_on(async {
//! let coordinator = Arc::new(DegradationCoordinator::in_memory(0));
//! let cache = UnifiedCache::new(CacheConfig::default(), coordinator, None)?;
//! let cooldowns = CooldownTracker::new(cache, "cooldowns", Duration::from_secs(30))?;
//!
//! assert!(cooldowns.acquire("ban:42").await?);
//! assert!(!cooldowns.acquire("ban:42").await?);
//! # Ok::<(), warden_core::WardenError>(())
//! # }).unwrap();
//! ```

use crate::cache::UnifiedCache;
use crate::error::{WardenError, WardenResult};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one [`RateLimiter::check`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Hits in the current window, this one included
    pub count: i64,
    pub remaining: i64,
    /// Time until the current window closes
    pub reset_after: Duration,
}

/// Fixed-window limiter: `limit` hits per `window` and key
#[derive(Debug, Clone)]
pub struct RateLimiter {
    cache: Arc<UnifiedCache>,
    namespace: String,
    limit: i64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(
        cache: Arc<UnifiedCache>,
        namespace: impl Into<String>,
        limit: u32,
        window: Duration,
    ) -> WardenResult<Self> {
        let namespace = namespace.into();
        cache.registry().policy(&namespace)?;
        if limit == 0 || window.as_millis() == 0 {
            return Err(WardenError::validation(
                "Rate limit and window must both be greater than zero",
            ));
        }
        Ok(Self {
            cache,
            namespace,
            limit: i64::from(limit),
            window,
        })
    }

    /// Counts a hit against `key` and decides whether it is allowed
    pub async fn check(&self, key: &str) -> WardenResult<RateLimitDecision> {
        let now_ms = u128::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let window_ms = self.window.as_millis();
        let window_index = now_ms / window_ms;
        let reset_after = Duration::from_millis((window_ms - now_ms % window_ms) as u64);

        let count = self
            .cache
            .increment(&self.namespace, &format!("{key}:{window_index}"), Some(self.window))
            .await?;

        Ok(RateLimitDecision {
            allowed: count <= self.limit,
            count,
            remaining: (self.limit - count).max(0),
            reset_after,
        })
    }
}

/// Per-key cooldowns; the first acquire starts the cooldown
#[derive(Debug, Clone)]
pub struct CooldownTracker {
    cache: Arc<UnifiedCache>,
    namespace: String,
    duration: Duration,
}

impl CooldownTracker {
    pub fn new(cache: Arc<UnifiedCache>, namespace: impl Into<String>, duration: Duration) -> WardenResult<Self> {
        let namespace = namespace.into();
        cache.registry().policy(&namespace)?;
        if duration.is_zero() {
            return Err(WardenError::validation("Cooldown must be greater than zero"));
        }
        Ok(Self {
            cache,
            namespace,
            duration,
        })
    }

    /// `true` when no cooldown was running for `key`; starts one
    pub async fn acquire(&self, key: &str) -> WardenResult<bool> {
        let count = self
            .cache
            .increment(&self.namespace, key, Some(self.duration))
            .await?;
        Ok(count == 1)
    }

    pub async fn is_active(&self, key: &str) -> WardenResult<bool> {
        Ok(self.cache.get(&self.namespace, key).await?.is_some())
    }

    pub async fn reset(&self, key: &str) -> WardenResult<bool> {
        self.cache.delete(&self.namespace, key).await
    }
}

/// Per guild, user and kind counters (warnings, automod hits) that expire
/// `window` after the first event
#[derive(Debug, Clone)]
pub struct ModerationCounters {
    cache: Arc<UnifiedCache>,
    namespace: String,
    window: Duration,
}

impl ModerationCounters {
    pub fn new(cache: Arc<UnifiedCache>, namespace: impl Into<String>, window: Duration) -> WardenResult<Self> {
        let namespace = namespace.into();
        cache.registry().policy(&namespace)?;
        Ok(Self {
            cache,
            namespace,
            window,
        })
    }

    fn key(guild_id: &str, user_id: &str, kind: &str) -> String {
        format!("{guild_id}:{user_id}:{kind}")
    }

    /// Records one event; returns the count including it
    pub async fn record(&self, guild_id: &str, user_id: &str, kind: &str) -> WardenResult<i64> {
        self.cache
            .increment(&self.namespace, &Self::key(guild_id, user_id, kind), Some(self.window))
            .await
    }

    pub async fn count(&self, guild_id: &str, user_id: &str, kind: &str) -> WardenResult<i64> {
        let raw = self
            .cache
            .get(&self.namespace, &Self::key(guild_id, user_id, kind))
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub async fn reset(&self, guild_id: &str, user_id: &str, kind: &str) -> WardenResult<bool> {
        self.cache
            .delete(&self.namespace, &Self::key(guild_id, user_id, kind))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemorySharedStore;
    use crate::config::CacheConfig;
    use crate::degradation::DegradationCoordinator;

    fn cache() -> Arc<UnifiedCache> {
        let coordinator = Arc::new(DegradationCoordinator::in_memory(0));
        UnifiedCache::builder(CacheConfig::default(), coordinator)
            .memory_shared(MemorySharedStore::new())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rate_limiter_blocks_after_limit() {
        let window = Duration::from_secs(86_400);
        let limiter = RateLimiter::new(cache(), "rate_limits", 2, window).unwrap();

        let first = limiter.check("user:1").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);
        assert!(first.reset_after <= window);

        assert!(limiter.check("user:1").await.unwrap().allowed);
        let third = limiter.check("user:1").await.unwrap();
        assert_eq!(third.count, 3);
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);

        assert!(limiter.check("user:2").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_rate_limiter_rejects_unknown_namespace() {
        assert!(RateLimiter::new(cache(), "nope", 1, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_cooldown_acquire_once() {
        let cooldowns = CooldownTracker::new(cache(), "cooldowns", Duration::from_secs(30)).unwrap();
        assert!(cooldowns.acquire("ban:42").await.unwrap());
        assert!(!cooldowns.acquire("ban:42").await.unwrap());
        assert!(cooldowns.is_active("ban:42").await.unwrap());

        assert!(cooldowns.reset("ban:42").await.unwrap());
        assert!(!cooldowns.is_active("ban:42").await.unwrap());
        assert!(cooldowns.acquire("ban:42").await.unwrap());
    }

    #[tokio::test]
    async fn test_moderation_counters() {
        let counters = ModerationCounters::new(cache(), "moderation", Duration::from_secs(3600)).unwrap();
        assert_eq!(counters.count("g", "u", "warn").await.unwrap(), 0);
        counters.record("g", "u", "warn").await.unwrap();
        assert_eq!(counters.record("g", "u", "warn").await.unwrap(), 2);
        assert_eq!(counters.record("g", "u", "automod").await.unwrap(), 1);
        assert_eq!(counters.count("g", "u", "warn").await.unwrap(), 2);

        counters.reset("g", "u", "warn").await.unwrap();
        assert_eq!(counters.count("g", "u", "warn").await.unwrap(), 0);
    }
}
