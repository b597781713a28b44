//! Redis/Dragonfly-backed counter store.
//!
//! Sliding windows are sorted sets scored by millisecond timestamp; attempt
//! counters and lockouts are plain keys with `PX` expiries. Multi-step
//! updates run as `MULTI/EXEC` pipelines or a Lua script. The connection is
//! a multiplexed `ConnectionManager` that reconnects on its own, so one
//! handle is created at startup and cloned per call.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::{debug, warn};

use super::{CounterStore, StoreError, StoreResult, WindowSnapshot};
use crate::clock::{duration_ms, sub_span};

/// Keys deleted per `DEL` when clearing a prefix.
const DELETE_BATCH: usize = 500;
/// `COUNT` hint passed to `SCAN`.
const SCAN_COUNT: usize = 500;

/// `INCR` that gives the counter a `PEXPIRE` when it has no TTL yet.
const INCREMENT_WITH_EXPIRY: &str = r"
local value = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
";

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            StoreError::Connection(e.to_string())
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Escape glob metacharacters so a key prefix can be used in `SCAN MATCH`.
fn glob_escape(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('*');
    escaped
}

fn first_score(range: Vec<(String, f64)>) -> Option<i64> {
    range.into_iter().next().map(|(_, score)| score as i64)
}

/// Counter store talking to Redis or any protocol-compatible server.
#[derive(Clone)]
pub struct RedisStore {
    connection_manager: ConnectionManager,
    increment_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`) and verify the
    /// connection with a `PING`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| {
            warn!(error = %e, "Failed to create Redis client");
            StoreError::Connection(format!("invalid store url: {}", e))
        })?;

        let connection_manager = ConnectionManager::new(client).await.map_err(|e| {
            warn!(error = %e, "Failed to create Redis connection manager");
            StoreError::from(e)
        })?;

        let store = Self {
            connection_manager,
            increment_script: Script::new(INCREMENT_WITH_EXPIRY),
        };
        store.ping().await?;

        debug!("Connected to counter store");
        Ok(store)
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn insert(&self, key: &str, timestamp_ms: i64, token: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::cmd("ZADD")
            .arg(key)
            .arg(timestamp_ms)
            .arg(token)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn purge_before(&self, key: &str, cutoff_ms: i64) -> StoreResult<u64> {
        let mut conn = self.conn();
        let removed = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff_ms)
            .query_async::<u64>(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn count(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        let count = redis::cmd("ZCARD")
            .arg(key)
            .query_async::<u64>(&mut conn)
            .await?;
        Ok(count)
    }

    async fn oldest(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.conn();
        let range = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async::<Vec<(String, f64)>>(&mut conn)
            .await?;
        Ok(first_score(range))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(duration_ms(ttl))
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value = redis::cmd("INCR")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let value = redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(duration_ms(ttl))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        let pattern = glob_escape(prefix);

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut removed = 0;
        for chunk in keys.chunks(DELETE_BATCH) {
            removed += redis::cmd("DEL")
                .arg(chunk)
                .query_async::<u64>(&mut conn)
                .await?;
        }

        debug!(prefix = %prefix, removed = removed, "Deleted keys by prefix");
        Ok(removed)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn record_entry(
        &self,
        key: &str,
        now_ms: i64,
        token: &str,
        window: Duration,
    ) -> StoreResult<WindowSnapshot> {
        let mut conn = self.conn();
        let window_ms = duration_ms(window);
        let cutoff = sub_span(now_ms, window_ms);

        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now_ms)
            .arg(token)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(window_ms)
            .ignore()
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        Ok(WindowSnapshot {
            count,
            oldest_ms: first_score(oldest),
        })
    }

    async fn increment_with_expiry(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value = self
            .increment_script
            .key(key)
            .arg(duration_ms(ttl))
            .invoke_async::<i64>(&mut conn)
            .await?;
        Ok(value)
    }

    async fn window_snapshot(
        &self,
        key: &str,
        now_ms: i64,
        window: Duration,
    ) -> StoreResult<WindowSnapshot> {
        let mut conn = self.conn();
        let cutoff = sub_span(now_ms, duration_ms(window));

        let (count, oldest): (u64, Vec<(String, f64)>) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;

        Ok(WindowSnapshot {
            count,
            oldest_ms: first_score(oldest),
        })
    }
}
