//! WebSocket tunnel client: connect, authenticate, and run the tunnel.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use homelink_proto::ErrorCode;

use crate::state::{AgentState, ConnState};

use super::{dispatcher, heartbeat, writer};

/// Outcome of a tunnel session.
pub enum TunnelOutcome {
    /// Graceful shutdown requested by the local process.
    Shutdown,
    /// Remote side disconnected or connection lost; should reconnect.
    Disconnected,
    /// Broker refused the handshake for an authentication reason.
    AuthRejected { code: ErrorCode },
}

/// Connect to the broker's tunnel endpoint and run until disconnected.
pub async fn connect_and_run(
    state: &Arc<AgentState>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<TunnelOutcome, anyhow::Error> {
    state.set_conn_state(ConnState::Connecting);
    let ws_url = state.config.tunnel_ws_url.clone();
    info!(url = %ws_url, "connecting tunnel");

    let mut request = ws_url.clone().into_client_request()?;
    request.headers_mut().insert(
        "Authorization",
        http::HeaderValue::from_str(&format!("Bearer {}", state.token()))?,
    );

    let uri: http::Uri = ws_url.parse()?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("missing host in tunnel URL"))?;
    let is_tls = uri.scheme_str() == Some("wss");
    let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

    let connect_timeout = Duration::from_millis(state.config.connect_timeout_ms);
    let tcp_stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            anyhow::anyhow!("tunnel TCP connect timeout ({}ms)", connect_timeout.as_millis())
        })??;
    configure_tcp_socket(&tcp_stream, state);

    let connector = if is_tls {
        Some(tokio_tungstenite::Connector::Rustls(Arc::new(
            build_tls_config(),
        )))
    } else {
        None
    };
    // headroom above the frame limit so oversize frames reach the
    // decoder instead of failing in the transport
    let ws_cap = state.config.max_frame_bytes.saturating_mul(2);
    let ws_config = WebSocketConfig {
        max_frame_size: Some(ws_cap),
        max_message_size: Some(ws_cap),
        ..Default::default()
    };

    state.set_conn_state(ConnState::Authenticating);
    let handshake = tokio::time::timeout(
        connect_timeout,
        tokio_tungstenite::client_async_tls_with_config(
            request,
            tcp_stream,
            Some(ws_config),
            connector,
        ),
    )
    .await
    .map_err(|_| {
        anyhow::anyhow!(
            "tunnel WebSocket handshake timeout ({}ms)",
            connect_timeout.as_millis()
        )
    })?;

    let (ws_stream, _response) = match handshake {
        Ok(ok) => ok,
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            let code = classify_rejection(&response);
            warn!(status = %response.status(), code = code.as_str(), "handshake rejected");
            return Ok(TunnelOutcome::AuthRejected { code });
        }
        Err(err) => return Err(err.into()),
    };
    state.set_conn_state(ConnState::Connected);
    info!("tunnel connected");

    let (ws_sink, ws_read) = futures_util::StreamExt::split(ws_stream);
    let (frame_tx, mut writer_handle) = writer::spawn_writer(ws_sink, Arc::clone(state));

    let (hb_handle, mut hb_task) = heartbeat::spawn(
        Duration::from_millis(state.config.ping_interval_ms),
        Duration::from_millis(state.config.pong_timeout_ms),
        frame_tx.clone(),
    );

    // replay whatever the last disconnection left behind, in order
    flush_queue(state, &frame_tx).await;

    let state_clone = Arc::clone(state);
    let outcome = tokio::select! {
        result = dispatcher::run(state_clone, ws_read, frame_tx.clone(), hb_handle) => {
            match result {
                Ok(()) => TunnelOutcome::Disconnected,
                Err(err) => return Err(err),
            }
        }
        // a dead write half would leave the read loop blocked forever
        writer_result = &mut writer_handle => {
            match writer_result {
                Ok(()) => warn!("writer task exited, triggering reconnect"),
                Err(err) => warn!(error = %err, "writer task failed, triggering reconnect"),
            }
            TunnelOutcome::Disconnected
        }
        _ = &mut hb_task => {
            warn!("heartbeat lost, triggering reconnect");
            TunnelOutcome::Disconnected
        }
        _ = shutdown.changed() => {
            debug!("shutdown during tunnel dispatch");
            TunnelOutcome::Shutdown
        }
    };

    // Drop our sender; the writer exits once dispatch handlers finish.
    drop(frame_tx);
    if !writer_handle.is_finished() {
        let _ = tokio::time::timeout(Duration::from_secs(20), writer_handle).await;
    }

    info!(
        queued = state.queue.len(),
        handled = state
            .metrics
            .requests_handled
            .load(std::sync::atomic::Ordering::Relaxed),
        failed = state
            .metrics
            .requests_failed
            .load(std::sync::atomic::Ordering::Relaxed),
        reconnects = state
            .metrics
            .reconnect_attempts
            .load(std::sync::atomic::Ordering::Relaxed),
        "tunnel disconnected"
    );
    Ok(outcome)
}

/// Replay queued frames after a reconnect, priority then FIFO.
async fn flush_queue(state: &Arc<AgentState>, frame_tx: &writer::FrameSender) {
    if state.queue.is_empty() {
        return;
    }
    let mut flushed = 0usize;
    while let Some(item) = state.queue.dequeue() {
        if frame_tx.send(item.payload.clone()).await.is_err() {
            state.queue.requeue_front(item);
            break;
        }
        flushed += 1;
    }
    if flushed > 0 {
        info!(flushed, "flushed queued frames");
    }
}

/// Map a rejected upgrade onto the error taxonomy using the JSON error
/// body when the broker sent one.
fn classify_rejection(response: &http::Response<Option<Vec<u8>>>) -> ErrorCode {
    if let Some(body) = response.body() {
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
            if let Some(code) = value
                .pointer("/error/code")
                .and_then(|c| c.as_str())
                .and_then(|c| c.parse::<ErrorCode>().ok())
            {
                return code;
            }
        }
    }
    match response.status().as_u16() {
        401 => ErrorCode::TokenInvalid,
        403 => ErrorCode::Forbidden,
        429 => ErrorCode::RateLimitExceeded,
        _ => ErrorCode::ServerUnavailable,
    }
}

/// Configure TCP keepalive and NODELAY on an established socket.
fn configure_tcp_socket(stream: &TcpStream, state: &Arc<AgentState>) {
    let sock_ref = socket2::SockRef::from(stream);

    if state.config.tcp_keepalive_secs > 0 {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(state.config.tcp_keepalive_secs))
            .with_interval(Duration::from_secs(5));
        #[cfg(not(target_os = "windows"))]
        let keepalive = keepalive.with_retries(3);
        if let Err(err) = sock_ref.set_tcp_keepalive(&keepalive) {
            warn!(error = %err, "failed to set TCP keepalive on tunnel socket");
        }
    }
    if let Err(err) = sock_ref.set_nodelay(true) {
        warn!(error = %err, "failed to set TCP_NODELAY on tunnel socket");
    }
}

/// Build rustls ClientConfig with the bundled root certificates.
pub fn build_tls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}
