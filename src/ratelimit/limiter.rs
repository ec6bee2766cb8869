//! In-process token bucket limiter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

use super::backend::RateLimiter;
use super::quota::Quota;
use crate::error::Result;

/// Mutable bucket state, guarded by the limiter's mutex.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Bring the bucket forward to `now`. Never moves the clock backwards.
    fn refill(&mut self, quota: &Quota, now: Instant) {
        if quota.rate.is_infinite() {
            self.tokens = quota.burst as f64;
            self.last_refill = self.last_refill.max(now);
            return;
        }
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill);
        self.tokens = (self.tokens + quota.rate.tokens_over(elapsed)).min(quota.burst as f64);
        self.last_refill = now;
    }

    /// Tokens the bucket would hold at `now`, without mutating it.
    fn peek(&self, quota: &Quota, now: Instant) -> f64 {
        let mut copy = *self;
        copy.refill(quota, now);
        copy.tokens
    }
}

/// A token bucket that refills continuously at the quota's rate.
///
/// The bucket starts full. Every admitted request consumes one token; a request
/// is admitted only when at least one whole token is available. The refill and
/// the deduction happen under one lock, so concurrent callers on the same
/// limiter never admit more than the bucket holds.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    quota: Quota,
    bucket: Mutex<Bucket>,
}

impl TokenBucketLimiter {
    /// Create a limiter with a full bucket.
    pub fn new(quota: Quota) -> Self {
        Self::new_at(quota, Instant::now())
    }

    /// Create a limiter with a full bucket, as of `now`.
    pub fn new_at(quota: Quota, now: Instant) -> Self {
        Self {
            quota,
            bucket: Mutex::new(Bucket {
                tokens: quota.burst as f64,
                last_refill: now,
            }),
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Take one token if available at `now`.
    pub fn allow_at(&self, now: Instant) -> bool {
        if self.quota.is_degenerate() {
            return false;
        }

        let mut bucket = self.bucket.lock();
        bucket.refill(&self.quota, now);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            trace!(remaining = bucket.tokens, "Token taken");
            true
        } else {
            false
        }
    }

    /// The quota this limiter enforces.
    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Tokens currently available.
    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    pub fn tokens_at(&self, now: Instant) -> f64 {
        self.bucket.lock().peek(&self.quota, now)
    }

    /// Time until the next request would be admitted.
    ///
    /// Returns `None` when the quota is degenerate and no request will ever be
    /// admitted.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_at(Instant::now())
    }

    pub fn retry_after_at(&self, now: Instant) -> Option<Duration> {
        if self.quota.is_degenerate() {
            return None;
        }
        let tokens = self.tokens_at(now);
        self.quota.rate.time_to_produce(1.0 - tokens)
    }

    /// Whether the bucket would be full at `now`.
    pub fn is_full_at(&self, now: Instant) -> bool {
        self.tokens_at(now) >= self.quota.burst as f64
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn allow(&self) -> Result<bool> {
        Ok(self.allow_at(Instant::now()))
    }

    fn quota(&self) -> Quota {
        self.quota
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after_at(Instant::now())
    }

    fn is_idle(&self) -> bool {
        self.is_full_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::quota::{Rate, TimeWindow};
    use std::sync::Arc;

    fn quota(period_ms: u64, burst: u32) -> Quota {
        Quota::new(Rate::every(Duration::from_millis(period_ms)), burst)
    }

    #[test]
    fn test_burst_bound() {
        let now = Instant::now();
        let limiter = TokenBucketLimiter::new_at(quota(1000, 5), now);

        for i in 0..5 {
            assert!(limiter.allow_at(now), "Request {} should be allowed", i);
        }

        // The 6th request should be rejected
        assert!(!limiter.allow_at(now));
        assert!(!limiter.allow_at(now));
    }

    #[test]
    fn test_refill_after_period() {
        let start = Instant::now();
        let limiter = TokenBucketLimiter::new_at(quota(10, 1), start);

        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(start + Duration::from_millis(5)));
        assert!(limiter.allow_at(start + Duration::from_millis(10)));
    }

    #[test]
    fn test_refill_is_capped_at_burst() {
        let start = Instant::now();
        let limiter = TokenBucketLimiter::new_at(quota(10, 3), start);

        for _ in 0..3 {
            assert!(limiter.allow_at(start));
        }

        // A long idle period refills to burst, not beyond
        let later = start + Duration::from_secs(60);
        assert_eq!(limiter.tokens_at(later), 3.0);
        for _ in 0..3 {
            assert!(limiter.allow_at(later));
        }
        assert!(!limiter.allow_at(later));
    }

    #[test]
    fn test_rejection_does_not_deduct() {
        let start = Instant::now();
        let limiter = TokenBucketLimiter::new_at(quota(100, 1), start);

        assert!(limiter.allow_at(start));
        let half = start + Duration::from_millis(50);
        assert!(!limiter.allow_at(half));
        assert!((limiter.tokens_at(half) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_clock_never_moves_backwards() {
        let start = Instant::now();
        let limiter = TokenBucketLimiter::new_at(quota(10, 1), start + Duration::from_millis(10));

        // An observation from before the last refill neither refills nor panics
        assert!(limiter.allow_at(start));
        assert!(!limiter.allow_at(start));
    }

    #[test]
    fn test_degenerate_quota_rejects_everything() {
        let now = Instant::now();

        let zero_burst = TokenBucketLimiter::new_at(Quota::new(Rate::per_second(100.0), 0), now);
        assert!(!zero_burst.allow_at(now));
        assert!(!zero_burst.allow_at(now + Duration::from_secs(10)));
        assert_eq!(zero_burst.retry_after_at(now), None);

        let zero_rate = TokenBucketLimiter::new_at(Quota::new(Rate::ZERO, 10), now);
        assert!(!zero_rate.allow_at(now));
        assert!(!zero_rate.allow_at(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_infinite_rate_always_admits() {
        let now = Instant::now();
        let limiter = TokenBucketLimiter::new_at(Quota::new(Rate::INFINITE, 1), now);

        for _ in 0..100 {
            assert!(limiter.allow_at(now));
        }
    }

    #[test]
    fn test_retry_after() {
        let start = Instant::now();
        let limiter = TokenBucketLimiter::new_at(Quota::new(Rate::per(1, TimeWindow::Second), 1), start);

        assert_eq!(limiter.retry_after_at(start), Some(Duration::ZERO));
        assert!(limiter.allow_at(start));

        let retry = limiter.retry_after_at(start).unwrap();
        assert_eq!(retry, Duration::from_secs(1));

        let retry = limiter.retry_after_at(start + Duration::from_millis(250)).unwrap();
        assert!((retry.as_secs_f64() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_is_full() {
        let start = Instant::now();
        let limiter = TokenBucketLimiter::new_at(quota(10, 2), start);
        assert!(limiter.is_full_at(start));

        assert!(limiter.allow_at(start));
        assert!(!limiter.is_full_at(start));
        assert!(limiter.is_full_at(start + Duration::from_millis(10)));
    }

    #[test]
    fn test_concurrent_admission_is_bounded() {
        let limiter = Arc::new(TokenBucketLimiter::new(Quota::new(
            Rate::per(1, TimeWindow::Hour),
            10,
        )));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || (0..50).filter(|_| limiter.allow()).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_trait_allow() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::new(quota(60_000, 1)));

        assert!(limiter.allow().await.unwrap());
        assert!(!limiter.allow().await.unwrap());
        assert_eq!(limiter.quota().burst, 1);
        assert!(!limiter.is_idle());
    }
}
