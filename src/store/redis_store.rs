//! Redis-backed sliding-window counter store.
//!
//! Each counter key maps to one sorted set whose members are events scored by
//! their timestamp in microseconds:
//!
//! - `record` adds a uniquely named member and refreshes the key's expiry to
//!   the key retention, so idle keys clean themselves up
//! - `count` removes members older than the retention and counts the rest of
//!   the window in the same `MULTI` block
//! - `acquire` runs one Lua script that checks every key before adding to
//!   any, so concurrent instances cannot all slip under a limit together
//! - every round-trip is bounded by [`RedisStoreConfig::timeout`]
//!
//! There is no periodic sweep; Redis TTLs do that work.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Acquisition, Allowance, CounterKey, CounterStore};
use crate::error::{RampartError, Result};

/// Configuration for the Redis backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    #[serde(default = "default_url")]
    pub url: String,
    /// Prefix for every key written by this engine
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Per-operation timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_key_prefix() -> String {
    "rampart:".to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

impl RedisStoreConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Check-then-add over every key.
///
/// KEYS are the counter sets. ARGV[1] is the score of now and ARGV[2] the new
/// member, then four arguments per key: prune cutoff, window cutoff, limit and
/// TTL. Returns `{0, 0}` when granted, else `{i, count}` for the first full key.
const ACQUIRE_SCRIPT: &str = r#"
for i = 1, #KEYS do
  local base = 2 + (i - 1) * 4
  redis.call('ZREMRANGEBYSCORE', KEYS[i], '-inf', ARGV[base + 1])
  local count = redis.call('ZCOUNT', KEYS[i], '(' .. ARGV[base + 2], '+inf')
  if count >= tonumber(ARGV[base + 3]) then
    return {i, count}
  end
end
for i = 1, #KEYS do
  local base = 2 + (i - 1) * 4
  redis.call('ZADD', KEYS[i], ARGV[1], ARGV[2])
  redis.call('EXPIRE', KEYS[i], ARGV[base + 4])
end
return {0, 0}
"#;

/// Sliding-window counters shared through Redis sorted sets.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    acquire_script: Script,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns `BackendUnavailable` if the server cannot be reached within the
    /// configured timeout.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let connection = tokio::time::timeout(config.timeout() * 20, ConnectionManager::new(client))
            .await
            .map_err(|_| RampartError::BackendUnavailable(format!("connect to {} timed out", config.url)))??;

        info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis counter store");
        Ok(Self {
            connection,
            config,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
        })
    }

    fn redis_key(&self, key: &CounterKey) -> String {
        format!("{}{}", self.config.key_prefix, key.storage_key())
    }

    /// Run one Redis round-trip under the configured timeout.
    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, redis::RedisError>>,
    {
        bounded(self.config.timeout(), op).await
    }
}

async fn bounded<T, F>(timeout: std::time::Duration, op: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, redis::RedisError>>,
{
    match tokio::time::timeout(timeout, op).await {
        Ok(result) => result.map_err(RampartError::from),
        Err(_) => Err(RampartError::BackendUnavailable(format!(
            "operation exceeded {}ms",
            timeout.as_millis()
        ))),
    }
}

fn member(at: DateTime<Utc>) -> String {
    format!("{}-{}", at.timestamp_micros(), Uuid::new_v4().simple())
}

fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64
}

/// Escape glob metacharacters for `SCAN MATCH`.
fn escape_pattern(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn acquire(&self, allowances: &[Allowance], now: DateTime<Utc>) -> Result<Acquisition> {
        if allowances.is_empty() {
            return Ok(Acquisition::Granted);
        }

        let mut invocation = self.acquire_script.prepare_invoke();
        invocation.arg(score(now)).arg(member(now));
        for allowance in allowances {
            invocation
                .key(self.redis_key(&allowance.key))
                .arg(score(now - allowance.key.retention))
                .arg(score(now - allowance.window))
                .arg(allowance.max_requests)
                .arg(allowance.key.retention.num_seconds().max(1));
        }
        let mut conn = self.connection.clone();

        let (index, count): (usize, u64) = self
            .bounded(async move { invocation.invoke_async(&mut conn).await })
            .await?;

        Ok(match index {
            0 => Acquisition::Granted,
            i => Acquisition::Exhausted {
                index: i - 1,
                count,
            },
        })
    }

    async fn record(&self, key: &CounterKey, at: DateTime<Utc>) -> Result<()> {
        let redis_key = self.redis_key(key);
        let member = member(at);
        let ttl_secs = key.retention.num_seconds().max(1);
        let mut conn = self.connection.clone();

        self.bounded(async move {
            redis::pipe()
                .atomic()
                .zadd(&redis_key, member, score(at))
                .ignore()
                .expire(&redis_key, ttl_secs)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn count(&self, key: &CounterKey, window: Duration, now: DateTime<Utc>) -> Result<u64> {
        let redis_key = self.redis_key(key);
        let prune_cutoff = score(now - key.retention);
        let window_cutoff = format!("({}", score(now - window));
        let mut conn = self.connection.clone();

        let (count,): (u64,) = self
            .bounded(async move {
                redis::pipe()
                    .atomic()
                    .zrembyscore(&redis_key, "-inf", prune_cutoff)
                    .ignore()
                    .zcount(&redis_key, window_cutoff, "+inf")
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(count)
    }

    async fn oldest(
        &self,
        key: &CounterKey,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let redis_key = self.redis_key(key);
        let window_cutoff = format!("({}", score(now - window));
        let mut conn = self.connection.clone();

        let entries: Vec<(String, f64)> = self
            .bounded(async move {
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&redis_key)
                    .arg(window_cutoff)
                    .arg("+inf")
                    .arg("WITHSCORES")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(1)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        Ok(entries
            .first()
            .and_then(|(_, micros)| DateTime::<Utc>::from_timestamp_micros(*micros as i64)))
    }

    async fn remove_identity(&self, identity: &str) -> Result<u64> {
        let pattern = format!(
            "{}*|{}",
            escape_pattern(&self.config.key_prefix),
            escape_pattern(identity)
        );
        let conn = self.connection.clone();
        let mut removed = 0u64;
        let mut cursor = 0u64;

        loop {
            let scan_pattern = pattern.clone();
            let mut scan_conn = conn.clone();
            let (next, keys): (u64, Vec<String>) = self
                .bounded(async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(scan_pattern)
                        .arg("COUNT")
                        .arg(100)
                        .query_async(&mut scan_conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                let mut del_conn = conn.clone();
                let deleted: u64 = self
                    .bounded(async move { del_conn.del(&keys).await })
                    .await?;
                removed += deleted;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(identity = %identity, removed = removed, "Removed client counters from Redis");
        Ok(removed)
    }

    async fn sweep(&self, _now: DateTime<Utc>) -> Result<u64> {
        Ok(0)
    }

    fn key_count(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_pattern() {
        assert_eq!(escape_pattern("ip:10.0.0.1"), "ip:10.0.0.1");
        assert_eq!(escape_pattern("user:a*b?[c]"), "user:a\\*b\\?\\[c\\]");
    }

    #[test]
    fn test_score_is_microseconds() {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        assert_eq!(score(at), 1_700_000_000_250_000.0);
    }

    #[tokio::test]
    async fn test_stalled_round_trip_times_out() {
        let stalled = std::future::pending::<redis::RedisResult<u64>>();
        let err = bounded(std::time::Duration::from_millis(10), stalled)
            .await
            .unwrap_err();
        assert!(matches!(err, RampartError::BackendUnavailable(_)));

        let ready = async { Ok::<u64, redis::RedisError>(3) };
        assert_eq!(bounded(std::time::Duration::from_millis(10), ready).await.unwrap(), 3);
    }

    #[test]
    fn test_config_defaults() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.key_prefix, "rampart:");
        assert_eq!(config.timeout(), std::time::Duration::from_millis(50));
    }

    // Requires a Redis server on localhost.
    #[tokio::test]
    #[ignore]
    async fn test_redis_round_trip() {
        let config = RedisStoreConfig {
            key_prefix: format!("rampart-test-{}:", Uuid::new_v4().simple()),
            timeout_ms: 500,
            ..Default::default()
        };
        let store = RedisCounterStore::connect(config).await.unwrap();
        let key = CounterKey::new("quota:client", "ip:10.9.9.9", Duration::seconds(60));
        let now = Utc::now();

        for i in 0..5 {
            store.record(&key, now - Duration::seconds(i)).await.unwrap();
        }

        assert_eq!(store.count(&key, Duration::seconds(60), now).await.unwrap(), 5);
        assert_eq!(store.count(&key, Duration::milliseconds(2500), now).await.unwrap(), 3);
        assert!(store.oldest(&key, Duration::seconds(60), now).await.unwrap().is_some());
        assert_eq!(store.remove_identity("ip:10.9.9.9").await.unwrap(), 1);
        assert_eq!(store.count(&key, Duration::seconds(60), now).await.unwrap(), 0);
    }

    // Requires a Redis server on localhost.
    #[tokio::test]
    #[ignore]
    async fn test_redis_acquire_is_all_or_nothing() {
        let config = RedisStoreConfig {
            key_prefix: format!("rampart-test-{}:", Uuid::new_v4().simple()),
            timeout_ms: 500,
            ..Default::default()
        };
        let store = RedisCounterStore::connect(config).await.unwrap();
        let wide = Allowance::new(
            CounterKey::new("quota:client", "ip:10.9.9.8", Duration::seconds(60)),
            Duration::seconds(60),
            10,
        );
        let narrow = Allowance::new(
            CounterKey::new("quota:burst", "ip:10.9.9.8", Duration::seconds(10)),
            Duration::seconds(10),
            2,
        );
        let both = [wide.clone(), narrow];
        let now = Utc::now();

        assert_eq!(store.acquire(&both, now).await.unwrap(), Acquisition::Granted);
        assert_eq!(store.acquire(&both, now).await.unwrap(), Acquisition::Granted);
        assert_eq!(
            store.acquire(&both, now).await.unwrap(),
            Acquisition::Exhausted { index: 1, count: 2 }
        );
        assert_eq!(store.count(&wide.key, wide.window, now).await.unwrap(), 2);
        store.remove_identity("ip:10.9.9.8").await.unwrap();
    }
}
