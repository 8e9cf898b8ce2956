//! Public HTTP surface: proxy front, admin endpoints, and the agent
//! WebSocket route.

pub mod admin;
pub mod errors;
pub mod proxy;

#[cfg(test)]
mod pipeline_tests;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::http::{header, HeaderMap};
use axum::routing::{any, get};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::tunnel;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/tunnel", any(tunnel::ws_tunnel))
        .route("/api/tunnel/health", get(admin::health))
        .route("/api/tunnel/diagnostics", get(admin::diagnostics))
        .route("/api/tunnel/metrics", get(admin::metrics_scrape))
        .route(
            "/api/tunnel/config",
            get(admin::config_get).put(admin::config_put),
        )
        .route("/api/tunnel/{user_id}/{*path}", any(proxy::tunnel_proxy))
        .route(
            "/api/direct-proxy/{user_id}/{*path}",
            any(proxy::direct_proxy),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bearer token from the `Authorization` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Client address for rate limiting: first `X-Forwarded-For` hop when
/// present (the broker sits behind a load balancer), else the socket.
pub fn client_ip(headers: &HeaderMap, fallback: IpAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

/// Convenience for handlers that take the peer address.
pub fn peer_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    client_ip(headers, addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer abc.def"),
        );
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert!(bearer_token(&headers).is_none());
    }

    #[test]
    fn forwarded_for_wins_over_socket_address() {
        let fallback: IpAddr = "192.0.2.1".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, fallback), fallback);
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(
            client_ip(&headers, fallback),
            "203.0.113.7".parse::<IpAddr>().unwrap()
        );
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, fallback), fallback);
    }
}
