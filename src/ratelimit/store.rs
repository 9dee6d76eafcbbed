//! Sliding-window log stores.
//!
//! A window is an ordered set of request timestamps. `record` performs the
//! whole admission step as one unit: prune entries older than the window,
//! count what is left, add the new entry, refresh the key expiry.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::redis::{PoolError, RedisPool};

/// Idle keys outlive their window by this much before self-expiring
pub const KEY_EXPIRY_GRACE_MS: i64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("rate limit store error: {0}")]
    Pool(#[from] PoolError),
    #[error("rate limit store error: {0}")]
    Backend(String),
}

/// State of a window observed by `record`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSample {
    /// Entries inside the window before this request was added
    pub count_before: u64,
    /// Oldest timestamp still in the window (including the new entry)
    pub oldest_ms: i64,
}

#[async_trait]
pub trait SlidingWindowStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Prune, count, add `member` at `now_ms` and refresh expiry atomically
    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        member: &str,
    ) -> Result<WindowSample, StoreError>;

    /// Remove a previously recorded entry (used to undo a rejected request)
    async fn remove(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Drop keys whose expiry has passed. Returns the number removed.
    /// Backends with native key expiry have nothing to do.
    fn purge_expired(&self, _now_ms: i64) -> usize {
        0
    }
}

/// Sorted-set store shared by every hub instance
pub struct RedisSlidingWindowStore {
    pool: Arc<RedisPool>,
}

impl RedisSlidingWindowStore {
    pub fn new(pool: Arc<RedisPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SlidingWindowStore for RedisSlidingWindowStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        member: &str,
    ) -> Result<WindowSample, StoreError> {
        let key = key.to_string();
        let member = member.to_string();
        // exclusive bound: an entry exactly `window` old is still inside
        let cutoff = format!("({}", now_ms - window_ms);

        let reply: redis::Value = self
            .pool
            .execute(|mut conn| async move {
                redis::pipe()
                    .atomic()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(&key)
                    .arg("-inf")
                    .arg(&cutoff)
                    .ignore()
                    .zcard(&key)
                    .zadd(&key, &member, now_ms)
                    .ignore()
                    .pexpire(&key, window_ms + KEY_EXPIRY_GRACE_MS)
                    .ignore()
                    .zrange_withscores(&key, 0, 0)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        decode_sample(&reply, now_ms)
    }

    async fn remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        let member = member.to_string();
        self.pool
            .execute(|mut conn| async move {
                let _: () = redis::cmd("ZREM")
                    .arg(&key)
                    .arg(&member)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Decode the admission pipeline reply: `[ZCARD, ZRANGE 0 0 WITHSCORES]`.
/// An empty range means the new entry is the oldest.
fn decode_sample(reply: &redis::Value, now_ms: i64) -> Result<WindowSample, StoreError> {
    let (count_before, oldest): (u64, Vec<(String, f64)>) =
        redis::FromRedisValue::from_redis_value(reply)
            .map_err(|e| StoreError::Backend(format!("unexpected pipeline reply: {}", e)))?;

    let oldest_ms = oldest
        .first()
        .map(|(_, score)| *score as i64)
        .unwrap_or(now_ms);

    Ok(WindowSample {
        count_before,
        oldest_ms,
    })
}

struct MemoryWindow {
    /// (timestamp_ms, member), ordered by timestamp
    entries: VecDeque<(i64, String)>,
    expires_at: i64,
}

/// In-process store with the same semantics, for single-instance deployments
/// and tests. Each key is updated under its shard lock.
pub struct MemorySlidingWindowStore {
    windows: DashMap<String, MemoryWindow>,
}

impl MemorySlidingWindowStore {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Default for MemorySlidingWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlidingWindowStore for MemorySlidingWindowStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn purge_expired(&self, now_ms: i64) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.expires_at > now_ms);
        before - self.windows.len()
    }

    async fn record(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        member: &str,
    ) -> Result<WindowSample, StoreError> {
        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| MemoryWindow {
                entries: VecDeque::new(),
                expires_at: 0,
            });

        if window.expires_at <= now_ms {
            window.entries.clear();
        }

        let cutoff = now_ms - window_ms;
        while window.entries.front().is_some_and(|(ts, _)| *ts < cutoff) {
            window.entries.pop_front();
        }

        let count_before = window.entries.len() as u64;
        let idx = window.entries.partition_point(|(ts, _)| *ts <= now_ms);
        window.entries.insert(idx, (now_ms, member.to_string()));
        window.expires_at = now_ms + window_ms + KEY_EXPIRY_GRACE_MS;

        let oldest_ms = window.entries.front().map(|(ts, _)| *ts).unwrap_or(now_ms);
        Ok(WindowSample {
            count_before,
            oldest_ms,
        })
    }

    async fn remove(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(mut window) = self.windows.get_mut(key) {
            window.entries.retain(|(_, m)| m != member);
        }
        Ok(())
    }
}
