//! In-process limiter store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::LimiterStore;
use crate::error::Result;
use crate::ratelimit::{Quota, SharedLimiter, TokenBucketLimiter};

/// In-memory store mapping keys to token bucket limiters.
///
/// Lookups take a shared lock, insertions an exclusive one. Nothing is ever
/// evicted unless [`MemoryStore::evict_idle`] runs, either directly or through
/// [`MemoryStore::spawn_janitor`].
#[derive(Default)]
pub struct MemoryStore {
    limiters: RwLock<HashMap<String, SharedLimiter>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every limiter that is idle, i.e. whose bucket has refilled and
    /// which no in-flight request still holds.
    ///
    /// A full, unreferenced bucket behaves exactly like a newly created one, so
    /// eviction never changes an admission decision. Returns the number of keys
    /// removed.
    pub fn evict_idle(&self) -> usize {
        let mut limiters = self.limiters.write();
        let before = limiters.len();
        // A handle held outside the map may still spend a token after the sweep
        limiters.retain(|_, limiter| Arc::strong_count(limiter) > 1 || !limiter.is_idle());
        let evicted = before - limiters.len();

        if evicted > 0 {
            debug!(evicted, remaining = limiters.len(), "Evicted idle limiters");
        }
        evicted
    }

    /// Run [`MemoryStore::evict_idle`] every `interval` on the current runtime.
    ///
    /// The task stops when the store is dropped.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        info!(interval = ?interval, "Starting limiter eviction task");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    debug!("Limiter store dropped, stopping eviction task");
                    break;
                };
                store.evict_idle();
            }
        })
    }

    /// Remove every limiter.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.limiters.write().clear();
    }
}

#[async_trait]
impl LimiterStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<SharedLimiter>> {
        Ok(self.limiters.read().get(key).cloned())
    }

    async fn set(&self, key: &str, limiter: SharedLimiter) -> Result<()> {
        self.limiters.write().insert(key.to_string(), limiter);
        Ok(())
    }

    async fn get_or_insert(&self, key: &str, quota: Quota) -> Result<SharedLimiter> {
        if let Some(limiter) = self.limiters.read().get(key) {
            return Ok(limiter.clone());
        }

        let mut limiters = self.limiters.write();
        let limiter = limiters
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, quota = %quota, "Creating new limiter");
                Arc::new(TokenBucketLimiter::new(quota))
            })
            .clone();
        Ok(limiter)
    }

    fn len(&self) -> Option<usize> {
        Some(self.limiters.read().len())
    }
}
