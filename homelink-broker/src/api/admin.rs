//! Operational endpoints: health, diagnostics, metrics scrape, and the
//! runtime-tunable configuration surface.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use homelink_proto::ErrorCode;

use crate::state::AppState;

use super::bearer_token;
use super::errors::ApiError;

#[derive(Serialize)]
struct Health {
    status: &'static str,
    uptime_secs: u64,
    active_connections: usize,
    outstanding_requests: usize,
    version: &'static str,
}

/// `GET /api/tunnel/health`; 503 while the broker is degraded.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let degraded = state.limiter.in_ddos_mode(std::time::Instant::now());
    let body = Health {
        status: if degraded { "degraded" } else { "ok" },
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_connections: state.registry.active_sessions(),
        outstanding_requests: state.correlator.outstanding(),
        version: env!("CARGO_PKG_VERSION"),
    };
    let status = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

#[derive(Serialize)]
struct Diagnostics {
    sessions: Vec<crate::registry::SessionInfo>,
    circuits: Vec<CircuitInfo>,
    rate_limiter: crate::ratelimit::RateLimiterSnapshot,
    outstanding_requests: usize,
    recent_errors: Vec<crate::state::ErrorEvent>,
}

#[derive(Serialize)]
struct CircuitInfo {
    upstream: String,
    state: &'static str,
}

/// `GET /api/tunnel/diagnostics`: admin-authenticated JSON snapshot.
pub async fn diagnostics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    let body = Diagnostics {
        sessions: state.registry.snapshot(),
        circuits: state
            .breakers
            .snapshot()
            .into_iter()
            .map(|(upstream, state)| CircuitInfo { upstream, state })
            .collect(),
        rate_limiter: state.limiter.snapshot(),
        outstanding_requests: state.correlator.outstanding(),
        recent_errors: state.recent_errors(),
    };
    Json(body).into_response()
}

/// `GET /api/tunnel/metrics`: Prometheus exposition text.
pub async fn metrics_scrape(State(state): State<Arc<AppState>>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Serialize)]
struct ConfigSnapshot {
    request_timeout_ms: u64,
    max_request_timeout_ms: u64,
    max_channels_per_session: usize,
    max_frame_bytes: usize,
    max_body_bytes: usize,
    ping_interval_ms: u64,
    pong_timeout_ms: u64,
    idle_timeout_ms: u64,
}

/// Runtime-tunable subset accepted by `PUT /api/tunnel/config`.
#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    pub request_timeout_ms: Option<u64>,
    pub max_channels_per_session: Option<usize>,
}

pub async fn config_get(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    Json(snapshot(&state)).into_response()
}

pub async fn config_put(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    update: Json<ConfigUpdate>,
) -> Response {
    if let Err(response) = require_admin(&state, &headers) {
        return response;
    }
    if let Some(timeout) = update.request_timeout_ms {
        if timeout == 0 || timeout > state.config.max_request_timeout_ms {
            return ApiError::new(
                ErrorCode::ConfigurationError,
                format!(
                    "request_timeout_ms must be in 1..={}",
                    state.config.max_request_timeout_ms
                ),
                &Uuid::new_v4().to_string(),
            )
            .into_response();
        }
    }
    if update.max_channels_per_session == Some(0) {
        return ApiError::new(
            ErrorCode::ConfigurationError,
            "max_channels_per_session must be positive",
            &Uuid::new_v4().to_string(),
        )
        .into_response();
    }

    {
        let mut overrides = state.overrides.write();
        if update.request_timeout_ms.is_some() {
            overrides.request_timeout_ms = update.request_timeout_ms;
        }
        if update.max_channels_per_session.is_some() {
            overrides.max_channels_per_session = update.max_channels_per_session;
        }
    }
    info!(?update, "runtime configuration updated");
    Json(snapshot(&state)).into_response()
}

fn snapshot(state: &AppState) -> ConfigSnapshot {
    ConfigSnapshot {
        request_timeout_ms: state.effective_request_timeout_ms(),
        max_request_timeout_ms: state.config.max_request_timeout_ms,
        max_channels_per_session: state.effective_max_channels(),
        max_frame_bytes: state.config.max_frame_bytes,
        max_body_bytes: state.config.max_body_bytes,
        ping_interval_ms: state.config.ping_interval_ms,
        pong_timeout_ms: state.config.pong_timeout_ms,
        idle_timeout_ms: state.config.idle_timeout_ms,
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let correlation_id = Uuid::new_v4().to_string();
    let Some(expected) = state.config.admin_token.as_deref() else {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "admin endpoints are disabled",
            &correlation_id,
        )
        .into_response());
    };
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err(ApiError::new(
            ErrorCode::Forbidden,
            "admin token mismatch",
            &correlation_id,
        )
        .into_response()),
        None => Err(ApiError::new(
            ErrorCode::TokenMissing,
            "missing admin bearer token",
            &correlation_id,
        )
        .into_response()),
    }
}
