//! Rate limiter trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::quota::Quota;
use crate::error::Result;

/// Trait for limiter implementations handed out by a store.
///
/// This abstracts over the in-process `TokenBucketLimiter` and the
/// Redis-backed `RedisLimiter`, so the middleware and reject handlers work
/// with either.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Take one token if available.
    ///
    /// Returns `Ok(true)` when the request is admitted. Errors only come from
    /// limiters whose state lives outside the process.
    async fn allow(&self) -> Result<bool>;

    /// The quota this limiter enforces.
    fn quota(&self) -> Quota;

    /// Time until the next request could be admitted, or `None` if no request
    /// ever will be.
    ///
    /// The default assumes an empty bucket, so it is an upper bound for
    /// limiters that cannot see their current token count.
    fn retry_after(&self) -> Option<Duration> {
        let quota = self.quota();
        if quota.is_degenerate() {
            return None;
        }
        quota.rate.time_to_produce(1.0)
    }

    /// Whether dropping this limiter and recreating it later would be
    /// unobservable. Stores use this to evict stale keys.
    fn is_idle(&self) -> bool {
        false
    }
}

/// A limiter shared between a store and in-flight requests.
pub type SharedLimiter = Arc<dyn RateLimiter>;
