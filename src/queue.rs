// ============================================================================
// Broadcast Queue Store (Redis)
// ============================================================================
//
// Key layout:
//   broadcast:queue  ZSET, member = serialized QueueMessage, score = priority
//   broadcast:stats  HASH  {totalSent, totalFailed, lastProcessedAt}
//   broadcast:lock   STRING owner token, TTL = LOCK_TTL_SECONDS
//
// The lock stores a random owner token at acquisition; extend and release run
// a GET-compare Lua script so a worker whose lock already expired can never
// clobber the lock of the worker that re-acquired it.

use crate::config::RedisKeys;
use crate::message::QueueMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use uuid::Uuid;

/// Running counters kept alongside the queue, never reset by the drainer
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub total_sent: i64,
    pub total_failed: i64,
    /// Epoch milliseconds of the last drain that processed anything
    pub last_processed_at: i64,
}

/// Storage operations the drainer needs. Kept narrow so tests can drive the
/// drain loop against an in-memory implementation.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Number of pending entries in the queue
    async fn len(&self) -> Result<u64>;

    /// Read up to `limit` raw entries from the front of the queue, in
    /// ascending priority order, without removing them
    async fn peek_batch(&self, limit: usize) -> Result<Vec<String>>;

    /// Remove one raw entry from the queue
    async fn remove(&self, raw: &str) -> Result<()>;

    /// Atomically create the lock key if absent. Returns the owner token on
    /// success, None when another worker holds the lock.
    async fn try_acquire_lock(&self, ttl_seconds: u64) -> Result<Option<String>>;

    /// Refresh the lock TTL if we still own it. Returns false when the stored
    /// token no longer matches (lock expired and was taken over).
    async fn extend_lock(&self, token: &str, ttl_seconds: u64) -> Result<bool>;

    /// Delete the lock if we still own it
    async fn release_lock(&self, token: &str) -> Result<bool>;

    /// Whether the lock key currently exists
    async fn is_locked(&self) -> Result<bool>;

    /// Bump the running counters and stamp lastProcessedAt
    async fn record_stats(&self, sent: u64, failed: u64, now_ms: i64) -> Result<()>;

    async fn fetch_stats(&self) -> Result<QueueStats>;
}

const EXTEND_LOCK_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('EXPIRE', KEYS[1], ARGV[2])
    else
        return 0
    end
";

const RELEASE_LOCK_SCRIPT: &str = r"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    else
        return 0
    end
";

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    keys: RedisKeys,
}

impl RedisQueue {
    /// Connect to Redis. Supports both redis:// and rediss:// (TLS) URLs.
    pub async fn connect(url: &str, keys: RedisKeys) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to parse Redis URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { conn, keys })
    }

    /// Add a message to the queue, scored by its priority
    pub async fn enqueue(&self, message: &QueueMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(message).context("Failed to serialize queue message")?;
        let _: i64 = conn.zadd(&self.keys.queue, raw, message.priority).await?;
        tracing::debug!(
            message_id = %message.id,
            priority = message.priority,
            "Enqueued broadcast message"
        );
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for RedisQueue {
    async fn len(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.zcard(&self.keys.queue).await?;
        Ok(count)
    }

    async fn peek_batch(&self, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn
            .zrange(&self.keys.queue, 0, limit as isize - 1)
            .await
            .context("Failed to read queue batch")?;
        Ok(entries)
    }

    async fn remove(&self, raw: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(&self.keys.queue, raw).await?;
        Ok(())
    }

    async fn try_acquire_lock(&self, ttl_seconds: u64) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let token = Uuid::new_v4().to_string();

        // SET key token NX EX ttl, a single atomic create-if-absent
        let created: Option<String> = redis::cmd("SET")
            .arg(&self.keys.lock)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .context("Failed to acquire drain lock")?;

        if created.is_some() {
            tracing::debug!(token = %token, ttl_seconds = ttl_seconds, "Acquired drain lock");
            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    async fn extend_lock(&self, token: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = redis::Script::new(EXTEND_LOCK_SCRIPT)
            .key(&self.keys.lock)
            .arg(token)
            .arg(ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .context("Failed to extend drain lock")?;

        if extended == 0 {
            tracing::warn!("Drain lock expired and was taken over; extend refused");
        }
        Ok(extended == 1)
    }

    async fn release_lock(&self, token: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(&self.keys.lock)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .context("Failed to release drain lock")?;
        Ok(deleted == 1)
    }

    async fn is_locked(&self) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(&self.keys.lock).await?;
        Ok(exists)
    }

    async fn record_stats(&self, sent: u64, failed: u64, now_ms: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hincr(&self.keys.stats, "totalSent", sent as i64)
            .ignore()
            .hincr(&self.keys.stats, "totalFailed", failed as i64)
            .ignore()
            .hset(&self.keys.stats, "lastProcessedAt", now_ms)
            .ignore()
            .query_async(&mut conn)
            .await
            .context("Failed to record queue stats")?;
        Ok(())
    }

    async fn fetch_stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(&self.keys.stats).await?;

        let read = |name: &str| -> i64 {
            fields
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or_default()
        };

        Ok(QueueStats {
            total_sent: read("totalSent"),
            total_failed: read("totalFailed"),
            last_processed_at: read("lastProcessedAt"),
        })
    }
}
