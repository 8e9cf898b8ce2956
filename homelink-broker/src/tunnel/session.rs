//! Broker side of one agent WebSocket session: read loop, heartbeat,
//! draining, and teardown.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, WebSocket};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use homelink_proto::message::unix_ms;
use homelink_proto::{decode, ErrorCode, ErrorFrame, Heartbeat, Message, ProtoError};

use crate::auth::Identity;
use crate::correlator::Resolution;
use crate::metrics::METRIC_SESSION_CLOSES;
use crate::registry::AgentHandle;
use crate::state::AppState;
use crate::tunnel::writer::{spawn_writer, ControlSender, WriteCommand};

/// Why a session ended; recorded once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    HeartbeatTimeout,
    Idle,
    BadFrame,
    FrameTooLarge,
    CrossSession,
    Shutdown,
    SessionLimit,
}

impl CloseReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Idle => "idle_timeout",
            Self::BadFrame => "bad_frame",
            Self::FrameTooLarge => "frame_too_large",
            Self::CrossSession => "cross_session_response",
            Self::Shutdown => "shutdown",
            Self::SessionLimit => "session_limit_reached",
        }
    }

    fn close_code(&self) -> u16 {
        match self {
            Self::PeerClosed | Self::Idle | Self::Shutdown => close_code::NORMAL,
            Self::HeartbeatTimeout => close_code::AWAY,
            Self::BadFrame => close_code::PROTOCOL,
            Self::FrameTooLarge => close_code::SIZE,
            Self::CrossSession | Self::SessionLimit => close_code::POLICY,
        }
    }
}

/// Run the broker side of an accepted, authenticated WebSocket.
pub async fn run_session(
    state: Arc<AppState>,
    socket: WebSocket,
    identity: Identity,
    shutdown: watch::Receiver<bool>,
) {
    let (sink, stream) = socket.split();
    let (control_tx, data_tx, writer_handle) = spawn_writer(sink);

    let handle = Arc::new(AgentHandle::new(&identity, data_tx));
    let span = tracing::info_span!(
        "websocket.connection",
        session_id = %handle.session_id,
        user_id = %handle.user_id,
        tier = %handle.tier,
    );

    if let Err(err) = state.registry.register(Arc::clone(&handle)) {
        warn!(parent: &span, error = %err, "registration rejected");
        let _ = control_tx
            .send(WriteCommand::Frame(Message::Error(ErrorFrame::new(
                None,
                ErrorCode::SessionLimitReached,
                err.to_string(),
            ))))
            .await;
        finish(
            &state,
            &handle,
            control_tx,
            writer_handle,
            CloseReason::SessionLimit,
            false,
        )
        .await;
        return;
    }

    let reason = read_loop(&state, &handle, &control_tx, stream, shutdown)
        .instrument(span.clone())
        .await;

    span.in_scope(|| info!(reason = reason.as_str(), "session closed"));
    finish(&state, &handle, control_tx, writer_handle, reason, true).await;
}

async fn read_loop(
    state: &Arc<AppState>,
    handle: &Arc<AgentHandle>,
    control_tx: &ControlSender,
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    mut shutdown: watch::Receiver<bool>,
) -> CloseReason {
    let ping_interval = Duration::from_millis(state.config.ping_interval_ms);
    let pong_timeout = Duration::from_millis(state.config.pong_timeout_ms);
    let idle_timeout = Duration::from_millis(state.config.idle_timeout_ms);
    let drain_grace = Duration::from_millis(state.config.drain_grace_ms);
    let max_frame = state.config.max_frame_bytes;

    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut outstanding_ping: Option<(String, Instant)> = None;
    let mut last_activity = Instant::now();
    let mut drain_deadline: Option<Instant> = None;

    info!("agent session active");

    loop {
        if drain_deadline.is_some() && handle.pending.load(Ordering::Acquire) == 0 {
            return CloseReason::Shutdown;
        }

        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { return CloseReason::PeerClosed };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(err) => {
                        debug!(error = %err, "websocket read error");
                        return CloseReason::PeerClosed;
                    }
                };
                let data: &[u8] = match &msg {
                    WsMessage::Text(text) => text.as_bytes(),
                    WsMessage::Binary(bin) => bin.as_ref(),
                    WsMessage::Close(_) => {
                        debug!("received websocket close");
                        return CloseReason::PeerClosed;
                    }
                    // transport-level ping/pong is answered by the stack
                    WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                };
                match decode(data, max_frame) {
                    Ok(frame) => {
                        // heartbeats alone do not keep a session from idling out
                        if !matches!(frame, Message::Ping(_) | Message::Pong(_)) {
                            last_activity = Instant::now();
                        }
                        if let Some(reason) =
                            handle_frame(state, handle, control_tx, &mut outstanding_ping, frame)
                        {
                            return reason;
                        }
                    }
                    Err(ProtoError::UnknownType(ty)) => {
                        debug!(frame_type = %ty, "ignoring unknown frame type");
                    }
                    Err(err @ ProtoError::FrameTooLarge { .. }) => {
                        warn!(error = %err, "oversize frame");
                        let _ = control_tx.try_send(WriteCommand::Frame(Message::Error(
                            ErrorFrame::new(None, ErrorCode::FrameTooLarge, err.to_string()),
                        )));
                        return CloseReason::FrameTooLarge;
                    }
                    Err(ProtoError::Malformed(err)) => {
                        warn!(error = %err, "malformed frame");
                        return CloseReason::BadFrame;
                    }
                }
            }

            _ = ticker.tick() => {
                if let Some((_, sent_at)) = &outstanding_ping {
                    if sent_at.elapsed() >= pong_timeout {
                        warn!(
                            pong_timeout_ms = pong_timeout.as_millis() as u64,
                            "pong overdue"
                        );
                        return CloseReason::HeartbeatTimeout;
                    }
                } else {
                    if drain_deadline.is_none()
                        && last_activity.elapsed() >= idle_timeout
                        && handle.pending.load(Ordering::Acquire) == 0
                    {
                        return CloseReason::Idle;
                    }
                    let ping = Heartbeat {
                        id: Uuid::new_v4().to_string(),
                        timestamp: unix_ms(),
                    };
                    let sent = control_tx
                        .try_send(WriteCommand::Frame(Message::Ping(ping.clone())))
                        .is_ok();
                    if sent {
                        outstanding_ping = Some((ping.id, Instant::now()));
                    } else {
                        debug!("control channel full, ping skipped");
                    }
                }
            }

            _ = shutdown.changed(), if drain_deadline.is_none() => {
                handle.draining.store(true, Ordering::Release);
                if handle.pending.load(Ordering::Acquire) == 0 {
                    return CloseReason::Shutdown;
                }
                info!(
                    pending = handle.pending.load(Ordering::Acquire),
                    "draining session before shutdown"
                );
                drain_deadline = Some(Instant::now() + drain_grace);
            }

            _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                if drain_deadline.is_some() =>
            {
                return CloseReason::Shutdown;
            }
        }
    }
}

fn handle_frame(
    state: &Arc<AppState>,
    handle: &Arc<AgentHandle>,
    control_tx: &ControlSender,
    outstanding_ping: &mut Option<(String, Instant)>,
    frame: Message,
) -> Option<CloseReason> {
    match frame {
        Message::HttpResponse(response) => {
            let request_id = response.id.clone();
            match state
                .correlator
                .resolve(handle.session_id, &handle.user_id, response)
            {
                Resolution::Delivered => None,
                Resolution::Unknown => {
                    debug!(%request_id, "late or unknown response discarded");
                    None
                }
                Resolution::CrossSession => {
                    warn!(%request_id, "response for another session's request");
                    Some(CloseReason::CrossSession)
                }
            }
        }
        Message::Pong(pong) => {
            if outstanding_ping
                .as_ref()
                .is_some_and(|(id, _)| *id == pong.id)
            {
                *outstanding_ping = None;
            }
            None
        }
        Message::Ping(ping) => {
            let pong = Heartbeat {
                id: ping.id,
                timestamp: unix_ms(),
            };
            if control_tx
                .try_send(WriteCommand::Frame(Message::Pong(pong)))
                .is_err()
            {
                debug!("control channel full, pong dropped");
            }
            None
        }
        Message::Error(error) => {
            if error.id.is_some() {
                let request_id = error.id.clone().unwrap_or_default();
                match state.correlator.fail(handle.session_id, &handle.user_id, error) {
                    Resolution::Delivered | Resolution::Unknown => None,
                    Resolution::CrossSession => {
                        warn!(%request_id, "error frame for another session's request");
                        Some(CloseReason::CrossSession)
                    }
                }
            } else {
                warn!(code = error.code.as_str(), message = %error.message, "agent error");
                None
            }
        }
        Message::HttpRequest(request) => {
            warn!(request_id = %request.id, "agent sent http_request, ignoring");
            None
        }
    }
}

async fn finish(
    state: &Arc<AppState>,
    handle: &Arc<AgentHandle>,
    control_tx: ControlSender,
    writer_handle: tokio::task::JoinHandle<()>,
    reason: CloseReason,
    registered: bool,
) {
    handle.draining.store(true, Ordering::Release);
    if registered {
        state
            .registry
            .unregister(&handle.user_id, handle.session_id);
        state.correlator.fail_session(handle.session_id);
    }
    metrics::counter!(METRIC_SESSION_CLOSES, "reason" => reason.as_str()).increment(1);

    let close = CloseFrame {
        code: reason.close_code(),
        reason: reason.as_str().into(),
    };
    let _ = control_tx.send(WriteCommand::Close(Some(close))).await;
    drop(control_tx);
    if tokio::time::timeout(Duration::from_secs(5), writer_handle)
        .await
        .is_err()
    {
        warn!("session writer did not exit in time");
    }
}
