//! Rate limiting middleware.

use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::key::{self, KeyFn};
use crate::config::{RateLimitSettings, StoreSettings};
use crate::error::{Result, TollboothError};
use crate::ratelimit::{Quota, RateLimiter, TokenBucketLimiter};
use crate::store::{LimiterStore, MemoryStore, RedisStore};

/// Builds the response sent when a request is rejected.
///
/// Receives the head of the rejected request and the limiter that rejected it.
pub type RejectFn = Arc<dyn Fn(&Parts, &dyn RateLimiter) -> Response + Send + Sync>;

/// What to do with a request when the limiter store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Reject the request as if the limit had been exceeded
    #[default]
    FailClosed,
    /// Admit the request
    FailOpen,
}

/// Outcome of an admission check.
pub enum Decision {
    /// The request may proceed.
    Admitted,
    /// The request was rejected; send this response.
    Rejected(Response),
}

impl Decision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted)
    }
}

/// Per-client rate limiting middleware state.
///
/// Install with [`axum::middleware::from_fn_with_state`] and [`rate_limit`]:
///
/// ```ignore
/// let limit = RateLimit::new(Quota::new(Rate::every(Duration::from_secs(1)), 1));
/// let app = Router::new()
///     .route("/", get(handler))
///     .layer(axum::middleware::from_fn_with_state(limit, rate_limit));
/// ```
///
/// Each instance owns its own store; cloning shares it.
#[derive(Clone)]
pub struct RateLimit {
    inner: Arc<Inner>,
}

struct Inner {
    quota: Quota,
    key_fn: KeyFn,
    store: Arc<dyn LimiterStore>,
    on_limit_exceeded: RejectFn,
    failure_policy: FailurePolicy,
}

impl RateLimit {
    /// Create a limiter keyed by client address, backed by an in-memory store,
    /// rejecting with `429 Too Many Requests`.
    pub fn new(quota: Quota) -> Self {
        Self {
            inner: Arc::new(Inner {
                quota,
                key_fn: Arc::new(key::client_ip),
                store: Arc::new(MemoryStore::new()),
                on_limit_exceeded: Arc::new(too_many_requests),
                failure_policy: FailurePolicy::default(),
            }),
        }
    }

    /// Build a limiter from configuration, connecting to Redis if selected.
    pub async fn from_settings(settings: &RateLimitSettings) -> Result<Self> {
        let store: Arc<dyn LimiterStore> = match &settings.store {
            StoreSettings::Memory { sweep_interval_secs } => {
                let store = Arc::new(MemoryStore::new());
                if *sweep_interval_secs > 0 {
                    store.spawn_janitor(Duration::from_secs(*sweep_interval_secs));
                }
                store
            }
            StoreSettings::Redis(config) => Arc::new(RedisStore::connect(config.clone()).await?),
        };

        Ok(Self::new(settings.quota())
            .with_store(store)
            .with_failure_policy(settings.failure_policy))
    }

    /// Derive the rate limit key with `key_fn` instead of the client address.
    pub fn with_key_fn<F>(self, key_fn: F) -> Self
    where
        F: Fn(&Parts) -> String + Send + Sync + 'static,
    {
        self.map(|inner| inner.key_fn = Arc::new(key_fn))
    }

    /// Keep limiters in `store` instead of a private in-memory store.
    pub fn with_store(self, store: Arc<dyn LimiterStore>) -> Self {
        self.map(|inner| inner.store = store)
    }

    /// Respond to rejected requests with `handler`.
    pub fn on_limit_exceeded<F>(self, handler: F) -> Self
    where
        F: Fn(&Parts, &dyn RateLimiter) -> Response + Send + Sync + 'static,
    {
        self.map(|inner| inner.on_limit_exceeded = Arc::new(handler))
    }

    /// Choose how requests are treated when the store fails.
    pub fn with_failure_policy(self, policy: FailurePolicy) -> Self {
        self.map(|inner| inner.failure_policy = policy)
    }

    pub fn quota(&self) -> Quota {
        self.inner.quota
    }

    pub fn store(&self) -> &Arc<dyn LimiterStore> {
        &self.inner.store
    }

    /// Apply `f` to this instance's own copy of the inner state.
    fn map(self, f: impl FnOnce(&mut Inner)) -> Self {
        let mut inner = Arc::try_unwrap(self.inner).unwrap_or_else(|shared| Inner {
            quota: shared.quota,
            key_fn: shared.key_fn.clone(),
            store: shared.store.clone(),
            on_limit_exceeded: shared.on_limit_exceeded.clone(),
            failure_policy: shared.failure_policy,
        });
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Decide whether the request with head `parts` may proceed.
    ///
    /// Store failures never surface as errors: they resolve to admission or
    /// rejection according to the failure policy.
    pub async fn check(&self, parts: &Parts) -> Decision {
        let inner = &*self.inner;
        let key = (inner.key_fn)(parts);

        trace!(key = %key, "Checking rate limit");

        let limiter = match inner.store.get_or_insert(&key, inner.quota).await {
            Ok(limiter) => limiter,
            Err(e) => return self.on_store_error(parts, &key, e),
        };

        match limiter.allow().await {
            Ok(true) => Decision::Admitted,
            Ok(false) => {
                debug!(key = %key, quota = %inner.quota, "Rate limit exceeded");
                Decision::Rejected((inner.on_limit_exceeded)(parts, &*limiter))
            }
            Err(e) => self.on_store_error(parts, &key, e),
        }
    }

    fn on_store_error(&self, parts: &Parts, key: &str, error: TollboothError) -> Decision {
        let inner = &*self.inner;
        warn!(
            key = %key,
            error = %error,
            policy = ?inner.failure_policy,
            "Limiter store failed"
        );

        match inner.failure_policy {
            FailurePolicy::FailOpen => Decision::Admitted,
            FailurePolicy::FailClosed => {
                // The store is unreachable, so reject with a detached limiter
                // carrying the configured quota.
                let limiter = TokenBucketLimiter::new(inner.quota);
                Decision::Rejected((inner.on_limit_exceeded)(parts, &limiter))
            }
        }
    }
}

/// Axum middleware function admitting or rejecting each request.
///
/// Admitted requests pass through unmodified; rejected ones never reach the
/// inner service.
pub async fn rate_limit(State(limit): State<RateLimit>, request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();

    match limit.check(&parts).await {
        Decision::Admitted => next.run(Request::from_parts(parts, body)).await,
        Decision::Rejected(response) => response,
    }
}

/// Default rejection: `429 Too Many Requests`, with `Retry-After` set to the
/// limiter's wait for its next token when one will ever arrive.
pub fn too_many_requests(_parts: &Parts, limiter: &dyn RateLimiter) -> Response {
    let mut response = (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests").into_response();

    if let Some(interval) = limiter.retry_after() {
        // Whole seconds, rounded up at millisecond precision
        let secs = interval.as_millis().div_ceil(1000).max(1) as u64;
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

impl std::fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimit")
            .field("quota", &self.inner.quota)
            .field("failure_policy", &self.inner.failure_policy)
            .finish_non_exhaustive()
    }
}
