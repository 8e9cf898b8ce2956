//! Proxy front: turns an inbound HTTP request into a tunnel dispatch
//! and maps the outcome back to an HTTP response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use homelink_proto::{
    sanitize_request_headers, sanitize_response_headers, ErrorCode, RequestFrame,
};

use crate::correlator::DispatchError;
use crate::metrics::{METRIC_REQUESTS_TOTAL, METRIC_REQUEST_BYTES, METRIC_REQUEST_LATENCY_MS};
use crate::ratelimit::Decision;
use crate::state::AppState;

use super::errors::ApiError;
use super::{bearer_token, peer_ip};

pub async fn tunnel_proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((user_id, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    proxy_request(state, addr, "tunnel", user_id, path, request).await
}

pub async fn direct_proxy(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((user_id, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    proxy_request(state, addr, "direct_proxy", user_id, path, request).await
}

async fn proxy_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    route: &'static str,
    user_id: String,
    path: String,
    request: Request,
) -> Response {
    let started = Instant::now();
    let correlation_id = request
        .headers()
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!(
        "tunnel.forward_request",
        route,
        correlation_id = %correlation_id,
        user_id = %user_id,
        method = %request.method(),
    );
    let (outcome, decision, mut response) =
        forward(&state, addr, route, &user_id, &path, &correlation_id, request)
            .instrument(span)
            .await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response
            .headers_mut()
            .entry("x-correlation-id")
            .or_insert(value);
    }
    if let Some(decision) = decision {
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(decision.reset_unix));
    }

    metrics::counter!(METRIC_REQUESTS_TOTAL, "outcome" => outcome, "route" => route).increment(1);
    metrics::histogram!(METRIC_REQUEST_LATENCY_MS).record(started.elapsed().as_millis() as f64);
    response
}

async fn forward(
    state: &Arc<AppState>,
    addr: SocketAddr,
    route: &'static str,
    user_id: &str,
    path: &str,
    correlation_id: &str,
    request: Request,
) -> (&'static str, Option<Decision>, Response) {
    let fail = |code: ErrorCode, message: String, decision: Option<Decision>| {
        state.record_error(code, Some(user_id), correlation_id);
        let mut err = ApiError::new(code, message, correlation_id);
        if let Some(decision) = &decision {
            if !decision.allowed {
                err = err.with_retry_after(decision.retry_after_secs);
            }
        }
        (code.as_str(), decision, err.into_response())
    };

    // 1-2. bearer extraction and validation
    let Some(token) = bearer_token(request.headers()) else {
        return fail(ErrorCode::TokenMissing, "missing bearer token".into(), None);
    };
    let identity = match state.validator.validate(token) {
        Ok(identity) => identity,
        Err(err) => return fail(err.code(), err.to_string(), None),
    };

    // 3. tenant check: the path user must be the token user
    if identity.user_id != user_id {
        warn!(token_user = %identity.user_id, "cross-tenant request rejected");
        return fail(
            ErrorCode::Forbidden,
            "token does not grant access to this tunnel".into(),
            None,
        );
    }

    // 4. rate limit
    let ip = peer_ip(request.headers(), addr);
    let decision = state.limiter.check(user_id, identity.tier, ip);
    if !decision.allowed {
        debug!(%ip, code = decision.code.as_str(), "request rate limited");
        return fail(
            decision.code,
            "rate limit exceeded".into(),
            Some(decision),
        );
    }
    let decision = Some(decision);

    // 5. path hygiene before anything leaves the broker
    if path.split('/').any(|segment| segment == "..") || path.contains('\0') {
        return fail(
            ErrorCode::PathTraversal,
            "path contains forbidden segments".into(),
            decision,
        );
    }

    // 6. agent lookup
    let Some(agent) = state.registry.resolve(user_id) else {
        state.record_error(ErrorCode::AgentOffline, Some(user_id), correlation_id);
        let response = ApiError::new(
            ErrorCode::AgentOffline,
            "no agent connected for this user",
            correlation_id,
        )
        .with_retry_after(5)
        .into_response();
        return (ErrorCode::AgentOffline.as_str(), decision, response);
    };

    // 7. circuit breaker around the user's upstream
    let breaker = state.breakers.get(user_id);
    if let Err(open) = breaker.try_acquire() {
        debug!(error = %open, "circuit open");
        state.record_error(ErrorCode::ServerUnavailable, Some(user_id), correlation_id);
        let response = ApiError::new(
            ErrorCode::ServerUnavailable,
            "upstream is failing, circuit open",
            correlation_id,
        )
        .with_retry_after(open.retry_after_secs)
        .into_response();
        return (ErrorCode::ServerUnavailable.as_str(), decision, response);
    }

    // 8. build the tunnel request
    let method = request.method().as_str().to_owned();
    let query = request
        .uri()
        .query()
        .map(|q| format!("?{q}"))
        .unwrap_or_default();
    let header_pairs: Vec<(String, String)> = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();
    let headers = sanitize_request_headers(
        header_pairs
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
    );
    let timeout = request_timeout(state, request.headers());

    let body = match axum::body::to_bytes(request.into_body(), state.config.max_body_bytes).await {
        Ok(body) => body,
        Err(_) => {
            breaker.record_neutral();
            return fail(
                ErrorCode::FrameTooLarge,
                format!("request body exceeds {} bytes", state.config.max_body_bytes),
                decision,
            );
        }
    };
    // the encoded frame must still fit the wire limit after base64
    if body.len().div_ceil(3) * 4 > state.config.max_frame_bytes {
        breaker.record_neutral();
        return fail(
            ErrorCode::FrameTooLarge,
            format!(
                "encoded request exceeds frame limit of {} bytes",
                state.config.max_frame_bytes
            ),
            decision,
        );
    }
    let body_len = body.len();

    let frame = RequestFrame {
        id: String::new(),
        method,
        path: format!("/{path}{query}"),
        headers,
        body,
        timeout_ms: None,
    };

    // 9. dispatch and map the outcome
    match state
        .correlator
        .dispatch(&agent, frame, timeout, state.effective_max_channels())
        .await
    {
        Ok(tunnel_response) => {
            breaker.record_success();
            metrics::histogram!(METRIC_REQUEST_BYTES, "route" => route)
                .record((body_len + tunnel_response.body.len()) as f64);
            let status = StatusCode::from_u16(tunnel_response.status)
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::builder().status(status);
            for (name, value) in sanitize_response_headers(
                tunnel_response
                    .headers
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            ) {
                response = response.header(name, value);
            }
            let response = response
                .body(Body::from(tunnel_response.body))
                .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
            ("success", decision, response)
        }
        Err(err) => {
            match &err {
                DispatchError::Timeout | DispatchError::SessionLost => breaker.record_failure(),
                DispatchError::Agent(frame)
                    if matches!(
                        frame.code.category(),
                        homelink_proto::ErrorCategory::Upstream
                            | homelink_proto::ErrorCategory::Network
                    ) =>
                {
                    breaker.record_failure()
                }
                _ => breaker.record_neutral(),
            }
            let code = err.code();
            let retry_after = match code {
                ErrorCode::QueueFull => Some(2),
                code if code.category() == homelink_proto::ErrorCategory::Server => Some(5),
                _ => None,
            };
            state.record_error(code, Some(user_id), correlation_id);
            let mut api_err = ApiError::new(code, err.to_string(), correlation_id);
            if let Some(retry) = retry_after {
                api_err = api_err.with_retry_after(retry);
            }
            (code.as_str(), decision, api_err.into_response())
        }
    }
}

/// Per-request deadline: `X-Timeout-Ms` clamped to the configured
/// maximum, defaulting to the effective request timeout.
fn request_timeout(state: &AppState, headers: &axum::http::HeaderMap) -> Duration {
    let requested = headers
        .get("x-timeout-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let millis = match requested {
        Some(ms) => ms.clamp(1, state.config.max_request_timeout_ms),
        None => state.effective_request_timeout_ms(),
    };
    Duration::from_millis(millis)
}
