//! Key-to-limiter stores.
//!
//! A store owns the limiter for every identity key seen by one middleware
//! instance. Two implementations ship with the crate: [`MemoryStore`] keeps
//! token buckets in process, [`RedisStore`] keeps bucket state in Redis so
//! several processes enforce one shared quota.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::{RedisLimiter, RedisStore, RedisStoreConfig};

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{Quota, SharedLimiter};

/// Trait for limiter stores.
#[async_trait]
pub trait LimiterStore: Send + Sync {
    /// Retrieve the limiter registered for `key`.
    async fn get(&self, key: &str) -> Result<Option<SharedLimiter>>;

    /// Register `limiter` for `key`, replacing any previous entry.
    async fn set(&self, key: &str, limiter: SharedLimiter) -> Result<()>;

    /// Retrieve the limiter for `key`, creating one with `quota` if absent.
    ///
    /// Implementations must make this atomic: concurrent callers for a new
    /// key all receive the same limiter.
    async fn get_or_insert(&self, key: &str, quota: Quota) -> Result<SharedLimiter>;

    /// Number of keys currently tracked, if the store can tell cheaply.
    fn len(&self) -> Option<usize> {
        None
    }
}
