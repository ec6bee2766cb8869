//! HTTP integration: the rate limit middleware and a server to host it.

pub mod key;
mod server;
mod service;

pub use key::{client_ip, KeyFn};
pub use server::HttpServer;
pub use service::{rate_limit, too_many_requests, Decision, FailurePolicy, RateLimit, RejectFn};
