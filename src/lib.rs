//! Tollbooth - Per-Client Rate Limiting Middleware
//!
//! This crate implements token bucket rate limiting for axum services. Each
//! request is mapped to an identity key (the client address by default), every
//! key gets its own bucket, and requests over quota are rejected with
//! `429 Too Many Requests` before they reach the handler. Bucket state lives in
//! a pluggable store: in process, or in Redis to share one quota between
//! several instances.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;

pub use error::{Result, TollboothError};
pub use http::{rate_limit, FailurePolicy, RateLimit};
pub use ratelimit::{Quota, Rate, RateLimiter, TimeWindow, TokenBucketLimiter};
pub use store::{LimiterStore, MemoryStore, RedisStore, RedisStoreConfig};
