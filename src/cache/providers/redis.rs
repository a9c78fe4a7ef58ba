//! Redis shared tier.
//!
//! Values live at `{prefix}:{{namespace}}:{key}` with a native PX expiry. Each
//! namespace also keeps a recency set scored by a per-namespace access tick
//! and an expiry set scored by the Redis clock in milliseconds. The
//! `{namespace}` hash tag puts all of them in one cluster slot, and every
//! script touches only keys passed in `KEYS`.
//!
//! Eviction takes two steps. `SET_SCRIPT` stores the value, drops members whose
//! value already expired and reports how far the namespace is over capacity.
//! The client then reads the oldest members and hands their keys to
//! `EVICT_SCRIPT`, which deletes each one only while it is still the least
//! recently used member. A reader that touches a candidate in between makes
//! the script stop, and the next round picks fresh candidates.
//!
//! The connection is opened lazily and retried on the next call, so a shard
//! that starts during an outage heals without a restart.

use crate::cache::errors::{CacheError, CacheResult};
use crate::cache::traits::{SharedHit, SharedStore};
use crate::constants::keys;
use std::fmt;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

/// Candidates handed to one `EVICT_SCRIPT` call
const EVICTION_BATCH: i64 = 64;

/// Rounds before a `set` leaves the remaining overflow to the next write
const MAX_EVICTION_ROUNDS: usize = 4;

/// Expired members dropped per `SET_SCRIPT` call
const EXPIRED_PRUNE_LIMIT: u32 = 256;

/// Value plus PTTL, refreshing recency; forget the member on a miss
const GET_SCRIPT: &str = r"
local value = redis.call('GET', KEYS[1])
if not value then
  redis.call('ZREM', KEYS[2], ARGV[1])
  redis.call('ZREM', KEYS[3], ARGV[1])
  return false
end
redis.call('ZADD', KEYS[2], redis.call('INCR', KEYS[4]), ARGV[1])
return {value, redis.call('PTTL', KEYS[1])}
";

/// Store and bump recency, record the expiry, prune members that already
/// expired. Returns live members minus capacity.
const SET_SCRIPT: &str = r"
local clock = redis.call('TIME')
local now = tonumber(clock[1]) * 1000 + math.floor(tonumber(clock[2]) / 1000)
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
redis.call('ZADD', KEYS[2], redis.call('INCR', KEYS[4]), ARGV[1])
redis.call('ZADD', KEYS[3], now + tonumber(ARGV[3]), ARGV[1])
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', '(' .. now, 'LIMIT', 0, tonumber(ARGV[5]))
for _, member in ipairs(expired) do
  redis.call('ZREM', KEYS[2], member)
  redis.call('ZREM', KEYS[3], member)
end
return redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[4])
";

/// KEYS: recency, expiry, then one value key per candidate.
/// ARGV: capacity, then the candidate members, oldest first.
/// Returns `{evicted, overflow}`.
const EVICT_SCRIPT: &str = r"
local max = tonumber(ARGV[1])
local evicted = 0
for i = 2, #ARGV do
  if redis.call('ZCARD', KEYS[1]) <= max then break end
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0)[1]
  if oldest ~= ARGV[i] then break end
  redis.call('ZREM', KEYS[1], oldest)
  redis.call('ZREM', KEYS[2], oldest)
  evicted = evicted + redis.call('DEL', KEYS[i + 1])
end
return {evicted, redis.call('ZCARD', KEYS[1]) - max}
";

/// Increment; set the TTL when the counter is new or has lost its expiry
const INCR_SCRIPT: &str = r"
local value = redis.call('INCR', KEYS[1])
if value == 1 or redis.call('PTTL', KEYS[1]) == -1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
";

pub struct RedisSharedStore {
    client: redis::Client,
    connection: OnceCell<redis::aio::ConnectionManager>,
    key_prefix: String,
    get_script: redis::Script,
    set_script: redis::Script,
    evict_script: redis::Script,
    incr_script: redis::Script,
}

impl fmt::Debug for RedisSharedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisSharedStore")
            .field("connected", &self.connection.initialized())
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

fn backend_error(operation: &str, error: impl fmt::Display) -> CacheError {
    CacheError::BackendError(format!("Redis {operation} failed: {error}"))
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

impl RedisSharedStore {
    /// Validates the URL; the connection is opened on first use
    pub fn new(redis_url: &str, key_prefix: &str) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            CacheError::ConnectionError(format!("Failed to create Redis client: {e}"))
        })?;
        debug!(url = %redact_url(redis_url), "Redis shared cache configured");
        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: key_prefix.to_string(),
            get_script: redis::Script::new(GET_SCRIPT),
            set_script: redis::Script::new(SET_SCRIPT),
            evict_script: redis::Script::new(EVICT_SCRIPT),
            incr_script: redis::Script::new(INCR_SCRIPT),
        })
    }

    /// Opens the connection now instead of on first use
    pub async fn connect(redis_url: &str, key_prefix: &str) -> CacheResult<Self> {
        let store = Self::new(redis_url, key_prefix)?;
        store.connection().await?;
        Ok(store)
    }

    async fn connection(&self) -> CacheResult<redis::aio::ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                redis::aio::ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| {
                        CacheError::ConnectionError(format!("Failed to connect to Redis: {e}"))
                    })
            })
            .await?;
        Ok(manager.clone())
    }

    fn entry_key(&self, namespace: &str, key: &str) -> String {
        keys::cache_entry(&self.key_prefix, namespace, key)
    }

    fn recency_key(&self, namespace: &str) -> String {
        keys::cache_recency(&self.key_prefix, namespace)
    }

    fn expiry_key(&self, namespace: &str) -> String {
        keys::cache_expiry(&self.key_prefix, namespace)
    }

    fn tick_key(&self, namespace: &str) -> String {
        keys::cache_tick(&self.key_prefix, namespace)
    }

    /// Evicts least recently used members while the namespace is over
    /// `max_entries`; returns how many live values were deleted
    async fn evict_overflow(
        &self,
        conn: &mut redis::aio::ConnectionManager,
        namespace: &str,
        max_entries: usize,
        mut overflow: i64,
    ) -> CacheResult<u64> {
        let recency_key = self.recency_key(namespace);
        let expiry_key = self.expiry_key(namespace);
        let mut evicted: u64 = 0;

        for _ in 0..MAX_EVICTION_ROUNDS {
            if overflow <= 0 {
                break;
            }
            let candidates: Vec<String> = redis::cmd("ZRANGE")
                .arg(&recency_key)
                .arg(0)
                .arg(overflow.min(EVICTION_BATCH) - 1)
                .query_async(conn)
                .await
                .map_err(|e| backend_error("ZRANGE", e))?;
            if candidates.is_empty() {
                break;
            }

            let mut invocation = self.evict_script.prepare_invoke();
            invocation.key(&recency_key).key(&expiry_key);
            for member in &candidates {
                invocation.key(self.entry_key(namespace, member));
            }
            invocation.arg(max_entries);
            for member in &candidates {
                invocation.arg(member);
            }
            let (count, remaining): (u64, i64) = invocation
                .invoke_async(conn)
                .await
                .map_err(|e| backend_error("EVICT", e))?;
            evicted += count;
            overflow = remaining;
        }

        if overflow > 0 {
            debug!(namespace = %namespace, overflow = overflow, "Shared eviction deferred to the next write");
        }
        Ok(evicted)
    }
}

/// PTTL reply to a remaining TTL; `-1` means the key has no expiry
fn remaining_ttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl).ok().map(Duration::from_millis)
}

impl SharedStore for RedisSharedStore {
    async fn get(&self, namespace: &str, key: &str) -> CacheResult<Option<SharedHit>> {
        let mut conn = self.connection().await?;
        let reply: Option<(String, i64)> = self
            .get_script
            .key(self.entry_key(namespace, key))
            .key(self.recency_key(namespace))
            .key(self.expiry_key(namespace))
            .key(self.tick_key(namespace))
            .arg(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_error("GET", e))?;
        Ok(reply.map(|(value, pttl)| SharedHit::new(value, remaining_ttl(pttl))))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl: Duration,
        max_entries: usize,
    ) -> CacheResult<u64> {
        let mut conn = self.connection().await?;
        let max_entries = max_entries.max(1);
        let overflow: i64 = self
            .set_script
            .key(self.entry_key(namespace, key))
            .key(self.recency_key(namespace))
            .key(self.expiry_key(namespace))
            .key(self.tick_key(namespace))
            .arg(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .arg(max_entries)
            .arg(EXPIRED_PRUNE_LIMIT)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_error("SET", e))?;
        self.evict_overflow(&mut conn, namespace, max_entries, overflow)
            .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection().await?;
        let (deleted, _, _): (u64, u64, u64) = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(self.entry_key(namespace, key))
            .cmd("ZREM")
            .arg(self.recency_key(namespace))
            .arg(key)
            .cmd("ZREM")
            .arg(self.expiry_key(namespace))
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("DEL", e))?;
        Ok(deleted > 0)
    }

    async fn clear_namespace(&self, namespace: &str, batch_size: usize) -> CacheResult<u64> {
        let mut conn = self.connection().await?;
        let pattern = keys::namespace_pattern(&self.key_prefix, namespace);
        let mut deleted: u64 = 0;
        let mut cursor: u64 = 0;

        loop {
            let (next_cursor, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(batch_size.max(1))
                .query_async(&mut conn)
                .await
                .map_err(|e| backend_error("SCAN", e))?;

            if !batch.is_empty() {
                let count: u64 = redis::cmd("DEL")
                    .arg(&batch)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| backend_error("DEL (batch)", e))?;
                deleted += count;
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }

        redis::cmd("DEL")
            .arg(self.recency_key(namespace))
            .arg(self.expiry_key(namespace))
            .arg(self.tick_key(namespace))
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| backend_error("DEL (recency)", e))?;

        debug!(pattern = %pattern, deleted = deleted, "Shared namespace cleared");
        Ok(deleted)
    }

    async fn increment(&self, namespace: &str, key: &str, ttl: Duration) -> CacheResult<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = self
            .incr_script
            .key(self.entry_key(namespace, key))
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| backend_error("INCR", e))?;
        Ok(value)
    }

    async fn health_check(&self) -> CacheResult<bool> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("PING", e))?;
        Ok(pong == "PONG")
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

/// Redact credentials from a Redis URL for logging
pub(crate) fn redact_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let prefix = &url[..=colon_pos];
            let suffix = &url[at_pos..];
            return format!("{prefix}***{suffix}");
        }
    }
    url.to_string()
}
