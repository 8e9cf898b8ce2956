//! Agent-facing WebSocket endpoint.

pub mod session;
pub mod writer;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};
use uuid::Uuid;

use homelink_proto::ErrorCode;

use crate::api::errors::ApiError;
use crate::api::{bearer_token, client_ip};
use crate::state::AppState;

/// `GET /ws/tunnel`: authenticate the bearer, enforce the handshake
/// rate limit, and hand the socket to the session loop.
pub async fn ws_tunnel(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let correlation_id = Uuid::new_v4().to_string();
    let ip = client_ip(&headers, addr.ip());

    let Some(token) = bearer_token(&headers) else {
        return ApiError::new(ErrorCode::TokenMissing, "missing bearer token", &correlation_id)
            .into_response();
    };
    // handshake authentication runs under a fixed budget; a validator
    // that stalls must not hold the upgrade open
    let auth_budget = std::time::Duration::from_millis(state.config.auth_budget_ms);
    let validated = tokio::time::timeout(auth_budget, async {
        state.validator.validate(token)
    })
    .await;
    let identity = match validated {
        Err(_) => {
            warn!(%ip, "token validation exceeded its budget");
            return ApiError::new(
                ErrorCode::TokenInvalid,
                "token validation timed out",
                &correlation_id,
            )
            .into_response();
        }
        Ok(Err(err)) => {
            debug!(%ip, error = %err, "websocket auth failed");
            return ApiError::new(err.code(), err.to_string(), &correlation_id).into_response();
        }
        Ok(Ok(identity)) => identity,
    };

    let decision = state.limiter.check(&identity.user_id, identity.tier, ip);
    if !decision.allowed {
        return ApiError::new(decision.code, "handshake rate limit exceeded", &correlation_id)
            .with_retry_after(decision.retry_after_secs)
            .into_response();
    }

    let shutdown = state.shutdown.clone();
    // leave headroom above the frame limit so oversize frames reach the
    // decoder and are rejected there with frame_too_large
    let ws_cap = state.config.max_frame_bytes.saturating_mul(2);
    ws.max_message_size(ws_cap)
        .on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| session::run_session(state, socket, identity, shutdown))
}
