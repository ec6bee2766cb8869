//! Token bucket admission.

mod backend;
mod limiter;
mod quota;

pub use backend::{RateLimiter, SharedLimiter};
pub use limiter::TokenBucketLimiter;
pub use quota::{Quota, Rate, TimeWindow};
