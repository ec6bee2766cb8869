//! Redis-backed limiter store for rate limits shared across processes.
//!
//! Bucket state lives in one Redis hash per key (`tokens`, `ts`, `rate`,
//! `burst`). Nothing is cached locally: every admission check runs a Lua
//! script that refills, decides and writes back atomically on the server,
//! timed by the server clock so that clock skew between processes does not
//! matter.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

use super::LimiterStore;
use crate::error::{Result, TollboothError};
use crate::ratelimit::{Quota, Rate, RateLimiter, SharedLimiter};

/// Refill, admit and persist in one atomic step.
///
/// KEYS[1] = bucket hash, ARGV = rate (tokens/s or "inf"), burst, ttl (ms).
/// Returns `{admitted (0|1), tokens left}`.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local burst = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + tonumber(time[2]) / 1000

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = burst
  ts = now
end

if ARGV[1] == 'inf' then
  tokens = burst
  ts = math.max(ts, now)
elseif now > ts then
  tokens = math.min(burst, tokens + (now - ts) * tonumber(ARGV[1]) / 1000)
  ts = now
end

local admitted = 0
if tokens >= 1 then
  tokens = tokens - 1
  admitted = 1
end

local left = string.format('%.17g', tokens)
redis.call('HSET', key, 'tokens', left, 'ts', string.format('%.3f', ts),
  'rate', ARGV[1], 'burst', ARGV[2])
redis.call('PEXPIRE', key, ttl)
return {admitted, left}
"#;

/// Lower bound on bucket expiry.
const MIN_TTL_MS: i64 = 1000;

/// Upper bound on bucket expiry (30 days). Buckets slower than this to refill
/// start over full once they expire.
const MAX_TTL_MS: i64 = 30 * 24 * 3600 * 1000;

/// Configuration for the Redis store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStoreConfig {
    /// Redis connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,

    /// Upper bound on every Redis round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix for every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl RedisStoreConfig {
    /// Configuration for `url` with default timeout and prefix.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

/// Limiter store backed by a shared Redis server.
pub struct RedisStore {
    conn: ConnectionManager,
    script: Arc<Script>,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish()
    }
}

impl RedisStore {
    /// Connect to the Redis server named in `config`.
    ///
    /// Fails if the server cannot be reached within the configured timeout.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = bounded(config.timeout(), ConnectionManager::new(client)).await?;

        info!(url = %config.url, prefix = %config.key_prefix, "Connected to Redis limiter store");

        Ok(Self {
            conn,
            script: Arc::new(Script::new(TOKEN_BUCKET_SCRIPT)),
            config,
        })
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, key)
    }

    fn limiter(&self, key: &str, quota: Quota) -> RedisLimiter {
        RedisLimiter {
            key: self.build_key(key),
            quota,
            conn: self.conn.clone(),
            script: self.script.clone(),
            timeout: self.config.timeout(),
        }
    }
}

#[async_trait]
impl LimiterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<SharedLimiter>> {
        let redis_key = self.build_key(key);
        let mut conn = self.conn.clone();

        let mut cmd = redis::cmd("HMGET");
        cmd.arg(&redis_key).arg("rate").arg("burst");
        let (rate, burst): (Option<String>, Option<u32>) =
            bounded(self.config.timeout(), cmd.query_async(&mut conn)).await?;

        let (Some(rate), Some(burst)) = (rate, burst) else {
            return Ok(None);
        };
        let rate = parse_rate(&rate).ok_or_else(|| {
            TollboothError::Config(format!("Invalid rate {:?} stored at {}", rate, redis_key))
        })?;

        Ok(Some(Arc::new(self.limiter(key, Quota::new(rate, burst)))))
    }

    async fn set(&self, key: &str, limiter: SharedLimiter) -> Result<()> {
        let redis_key = self.build_key(key);
        let quota = limiter.quota();
        let mut conn = self.conn.clone();

        debug!(key = %redis_key, quota = %quota, "Resetting shared bucket");

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&redis_key)
            .ignore()
            .hset_multiple(
                &redis_key,
                &[("rate", rate_arg(quota.rate)), ("burst", quota.burst.to_string())],
            )
            .ignore()
            .pexpire(&redis_key, ttl_ms(&quota))
            .ignore();
        let _: () = bounded(self.config.timeout(), pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn get_or_insert(&self, key: &str, quota: Quota) -> Result<SharedLimiter> {
        // A missing hash is a full bucket to the script, so creation happens
        // atomically inside the first admission check.
        Ok(Arc::new(self.limiter(key, quota)))
    }
}

/// Handle to one bucket stored in Redis.
pub struct RedisLimiter {
    key: String,
    quota: Quota,
    conn: ConnectionManager,
    script: Arc<Script>,
    timeout: Duration,
}

impl RedisLimiter {
    /// The Redis key holding this bucket.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl RateLimiter for RedisLimiter {
    async fn allow(&self) -> Result<bool> {
        if self.quota.is_degenerate() {
            return Ok(false);
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(&self.key);
        invocation
            .arg(rate_arg(self.quota.rate))
            .arg(self.quota.burst)
            .arg(ttl_ms(&self.quota));

        let (admitted, tokens): (i64, String) =
            bounded(self.timeout, invocation.invoke_async(&mut conn)).await?;

        trace!(key = %self.key, admitted, tokens = %tokens, "Shared bucket checked");
        Ok(admitted == 1)
    }

    fn quota(&self) -> Quota {
        self.quota
    }
}

/// Await a Redis operation, failing with [`TollboothError::Timeout`] after `timeout`.
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TollboothError::Timeout(timeout)),
    }
}

fn rate_arg(rate: Rate) -> String {
    if rate.is_infinite() {
        "inf".to_string()
    } else {
        rate.tokens_per_second().to_string()
    }
}

fn parse_rate(value: &str) -> Option<Rate> {
    if value == "inf" {
        return Some(Rate::INFINITE);
    }
    value.parse::<f64>().ok().map(Rate::per_second)
}

/// Expiry for a bucket: once it would have refilled completely, a missing key
/// is equivalent to the stored state.
fn ttl_ms(quota: &Quota) -> i64 {
    let fill = quota
        .time_to_fill()
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(MAX_TTL_MS);
    fill.saturating_add(MIN_TTL_MS).clamp(MIN_TTL_MS, MAX_TTL_MS)
}
