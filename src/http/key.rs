//! Identity key extraction.
//!
//! A key function maps a request to the string that selects its limiter.
//! Requests producing the same key share one bucket; an empty key is valid
//! and simply groups every request that produces it.

use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use std::net::SocketAddr;
use std::sync::Arc;

/// A function deriving the rate limit key from a request's head.
pub type KeyFn = Arc<dyn Fn(&Parts) -> String + Send + Sync>;

/// Key requests by the IP address of the connected peer.
///
/// Requires the server to be started with
/// `into_make_service_with_connect_info::<SocketAddr>()`. Without connect
/// info every request yields the empty key.
pub fn client_ip(parts: &Parts) -> String {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default()
}

/// Key requests by the value of header `name`.
///
/// Missing or non-UTF-8 header values yield the empty key.
pub fn header(name: impl Into<String>) -> impl Fn(&Parts) -> String + Send + Sync + 'static {
    let name = name.into();
    move |parts: &Parts| {
        parts
            .headers
            .get(name.as_str())
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Request;

    fn request_from(addr: Option<&str>) -> Parts {
        let mut request = Request::builder().uri("/").body(Body::empty()).unwrap();
        if let Some(addr) = addr {
            let addr: SocketAddr = addr.parse().unwrap();
            request.extensions_mut().insert(ConnectInfo(addr));
        }
        request.into_parts().0
    }

    #[test]
    fn test_client_ip_ignores_port() {
        let a = request_from(Some("10.0.0.1:5000"));
        let b = request_from(Some("10.0.0.1:6000"));

        assert_eq!(client_ip(&a), "10.0.0.1");
        assert_eq!(client_ip(&a), client_ip(&b));
    }

    #[test]
    fn test_client_ip_without_connect_info() {
        let request = request_from(None);
        assert_eq!(client_ip(&request), "");
    }

    #[test]
    fn test_header_key() {
        let key_fn = header("X-API-KEY");

        let (request, _) = Request::builder()
            .uri("/")
            .header("x-api-key", "test-key")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        assert_eq!(key_fn(&request), "test-key");

        let request = request_from(Some("10.0.0.1:5000"));
        assert_eq!(key_fn(&request), "");
    }
}
