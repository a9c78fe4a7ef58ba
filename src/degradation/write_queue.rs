//! Durable write-ahead queue.
//!
//! Deferred writes are partitioned by shard. The shared backend keeps one Redis
//! list per shard plus a dedup set; the in-memory store mirrors that layout for
//! single-instance runs and tests.

use crate::constants::keys;
use crate::error::{WardenError, WardenResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error};
use uuid::Uuid;

const LIST_PAGE_SIZE: isize = 100;

/// SADD the dedup key; append only when it was not already present
const PUSH_SCRIPT: &str = r"
if redis.call('SADD', KEYS[2], ARGV[1]) == 1 then
  redis.call('RPUSH', KEYS[1], ARGV[2])
  return 1
end
return 0
";

/// Remove the first entry whose id matches, then release its dedup key
const REMOVE_SCRIPT: &str = r"
local items = redis.call('LRANGE', KEYS[1], 0, -1)
for _, raw in ipairs(items) do
  local ok, entry = pcall(cjson.decode, raw)
  if ok and entry['id'] == ARGV[1] then
    redis.call('LREM', KEYS[1], 1, raw)
    redis.call('SREM', KEYS[2], ARGV[2])
    return 1
  end
end
return 0
";

/// A write deferred while its target service was unhealthy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedWrite {
    pub id: Uuid,
    pub service_name: String,
    pub operation_type: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub shard_id: u32,
    /// Hex SHA-256 of the serialized payload
    pub payload_hash: String,
}

impl QueuedWrite {
    pub fn new(
        shard_id: u32,
        service_name: impl Into<String>,
        operation_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        let payload_hash = hash_payload(&payload);
        Self {
            id: Uuid::new_v4(),
            service_name: service_name.into(),
            operation_type: operation_type.into(),
            payload,
            enqueued_at: Utc::now(),
            shard_id,
            payload_hash,
        }
    }

    /// `{shard}:{enqueued_at_ms}:{operation}:{payload_hash}`
    pub fn dedup_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.shard_id,
            self.enqueued_at.timestamp_millis(),
            self.operation_type,
            self.payload_hash
        )
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.enqueued_at).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Object keys serialize in sorted order, so equal payloads hash equally
pub fn hash_payload(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Write queue backend, dispatched by enum like the cache providers
#[derive(Debug, Clone)]
pub enum WriteQueue {
    Redis(Box<RedisWriteQueue>),
    Memory(MemoryWriteQueue),
}

impl WriteQueue {
    pub fn in_memory(shard_id: u32) -> Self {
        Self::Memory(MemoryWriteQueue::new(shard_id))
    }

    pub async fn redis(redis_url: &str, key_prefix: &str, shard_id: u32) -> WardenResult<Self> {
        Ok(Self::Redis(Box::new(
            RedisWriteQueue::connect(redis_url, key_prefix, shard_id).await?,
        )))
    }

    /// Redis queue that connects on first use; fails only on a malformed URL
    pub fn redis_lazy(redis_url: &str, key_prefix: &str, shard_id: u32) -> WardenResult<Self> {
        Ok(Self::Redis(Box::new(RedisWriteQueue::new(
            redis_url, key_prefix, shard_id,
        )?)))
    }

    pub fn shard_id(&self) -> u32 {
        match self {
            Self::Redis(q) => q.shard_id,
            Self::Memory(q) => q.shard_id,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Redis(_) => "redis",
            Self::Memory(_) => "memory",
        }
    }

    /// Append an entry; `false` when its dedup key was already queued
    pub async fn push(&self, entry: &QueuedWrite) -> WardenResult<bool> {
        match self {
            Self::Redis(q) => q.push(entry).await,
            Self::Memory(q) => Ok(q.push(entry)),
        }
    }

    /// This shard's entries in enqueue order
    pub async fn list(&self) -> WardenResult<Vec<QueuedWrite>> {
        match self {
            Self::Redis(q) => q.list().await,
            Self::Memory(q) => Ok(q.list()),
        }
    }

    pub async fn remove(&self, entry: &QueuedWrite) -> WardenResult<bool> {
        match self {
            Self::Redis(q) => q.remove(entry).await,
            Self::Memory(q) => Ok(q.remove(entry)),
        }
    }

    pub async fn len(&self) -> WardenResult<usize> {
        match self {
            Self::Redis(q) => q.len().await,
            Self::Memory(q) => Ok(q.len()),
        }
    }

    pub async fn is_empty(&self) -> WardenResult<bool> {
        Ok(self.len().await? == 0)
    }
}

#[derive(Debug, Default)]
struct ShardQueue {
    entries: VecDeque<QueuedWrite>,
    dedup: HashSet<String>,
}

/// Process-local queue. Handles created with [`MemoryWriteQueue::for_shard`]
/// share storage, standing in for several shards on one shared backend.
#[derive(Debug, Clone)]
pub struct MemoryWriteQueue {
    shard_id: u32,
    shards: Arc<Mutex<HashMap<u32, ShardQueue>>>,
}

impl MemoryWriteQueue {
    pub fn new(shard_id: u32) -> Self {
        Self {
            shard_id,
            shards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn for_shard(&self, shard_id: u32) -> Self {
        Self {
            shard_id,
            shards: Arc::clone(&self.shards),
        }
    }

    fn push(&self, entry: &QueuedWrite) -> bool {
        let mut shards = self.shards.lock();
        let queue = shards.entry(self.shard_id).or_default();
        if !queue.dedup.insert(entry.dedup_key()) {
            return false;
        }
        queue.entries.push_back(entry.clone());
        true
    }

    fn list(&self) -> Vec<QueuedWrite> {
        self.shards
            .lock()
            .get(&self.shard_id)
            .map(|q| q.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove(&self, entry: &QueuedWrite) -> bool {
        let mut shards = self.shards.lock();
        let Some(queue) = shards.get_mut(&self.shard_id) else {
            return false;
        };
        let Some(pos) = queue.entries.iter().position(|e| e.id == entry.id) else {
            return false;
        };
        if let Some(removed) = queue.entries.remove(pos) {
            queue.dedup.remove(&removed.dedup_key());
        }
        true
    }

    fn len(&self) -> usize {
        self.shards
            .lock()
            .get(&self.shard_id)
            .map_or(0, |q| q.entries.len())
    }
}

/// Redis list per shard plus a dedup set. The connection is opened on first
/// use and retried by every later call until it succeeds.
#[derive(Clone)]
pub struct RedisWriteQueue {
    client: redis::Client,
    connection: Arc<OnceCell<redis::aio::ConnectionManager>>,
    shard_id: u32,
    list_key: String,
    dedup_key: String,
}

impl fmt::Debug for RedisWriteQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisWriteQueue")
            .field("connected", &self.connection.initialized())
            .field("shard_id", &self.shard_id)
            .field("list_key", &self.list_key)
            .finish()
    }
}

fn queue_error(operation: &str, error: impl fmt::Display) -> WardenError {
    WardenError::ServiceUnavailable {
        service: "write_queue".to_string(),
        reason: format!("Redis {operation} failed: {error}"),
    }
}

impl RedisWriteQueue {
    pub fn new(redis_url: &str, key_prefix: &str, shard_id: u32) -> WardenResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| {
            WardenError::ConfigurationError(format!("Invalid Redis URL for write queue: {e}"))
        })?;
        Ok(Self {
            client,
            connection: Arc::new(OnceCell::new()),
            shard_id,
            list_key: keys::write_queue(key_prefix, shard_id),
            dedup_key: keys::write_queue_dedup(key_prefix, shard_id),
        })
    }

    /// Opens the connection now instead of on first use
    pub async fn connect(redis_url: &str, key_prefix: &str, shard_id: u32) -> WardenResult<Self> {
        let queue = Self::new(redis_url, key_prefix, shard_id)?;
        queue.connection().await?;
        Ok(queue)
    }

    async fn connection(&self) -> WardenResult<redis::aio::ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                redis::aio::ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(|e| queue_error("connect", e))
            })
            .await?;
        Ok(manager.clone())
    }

    async fn push(&self, entry: &QueuedWrite) -> WardenResult<bool> {
        let mut conn = self.connection().await?;
        let raw = serde_json::to_string(entry)?;
        let added: i64 = redis::Script::new(PUSH_SCRIPT)
            .key(&self.list_key)
            .key(&self.dedup_key)
            .arg(entry.dedup_key())
            .arg(raw)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| queue_error("RPUSH", e))?;
        Ok(added == 1)
    }

    async fn list(&self) -> WardenResult<Vec<QueuedWrite>> {
        let mut conn = self.connection().await?;
        let mut entries = Vec::new();
        let mut start: isize = 0;
        loop {
            let page: Vec<String> = redis::cmd("LRANGE")
                .arg(&self.list_key)
                .arg(start)
                .arg(start + LIST_PAGE_SIZE - 1)
                .query_async(&mut conn)
                .await
                .map_err(|e| queue_error("LRANGE", e))?;
            let fetched = page.len();

            for raw in page {
                match serde_json::from_str::<QueuedWrite>(&raw) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        // undecodable entries can never replay; drop them
                        error!(
                            list_key = %self.list_key,
                            error = %e,
                            "Discarding undecodable write-queue entry"
                        );
                        redis::cmd("LREM")
                            .arg(&self.list_key)
                            .arg(1)
                            .arg(&raw)
                            .query_async::<()>(&mut conn)
                            .await
                            .map_err(|e| queue_error("LREM", e))?;
                        start -= 1;
                    }
                }
            }

            if fetched < LIST_PAGE_SIZE as usize {
                break;
            }
            start += LIST_PAGE_SIZE;
        }
        debug!(list_key = %self.list_key, entries = entries.len(), "Write queue listed");
        Ok(entries)
    }

    async fn remove(&self, entry: &QueuedWrite) -> WardenResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(REMOVE_SCRIPT)
            .key(&self.list_key)
            .key(&self.dedup_key)
            .arg(entry.id.to_string())
            .arg(entry.dedup_key())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| queue_error("LREM", e))?;
        Ok(removed == 1)
    }

    async fn len(&self) -> WardenResult<usize> {
        let mut conn = self.connection().await?;
        let len: usize = redis::cmd("LLEN")
            .arg(&self.list_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| queue_error("LLEN", e))?;
        Ok(len)
    }
}
