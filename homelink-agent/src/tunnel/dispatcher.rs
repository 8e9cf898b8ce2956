//! Frame dispatcher: reads incoming WebSocket frames and routes them.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use homelink_proto::message::unix_ms;
use homelink_proto::{decode, Heartbeat, Message, ProtoError};

use crate::local;
use crate::queue::Priority;
use crate::state::AgentState;

use super::heartbeat::HeartbeatHandle;
use super::writer::FrameSender;

/// Run the dispatcher loop, reading from the WebSocket stream.
pub async fn run<S>(
    state: Arc<AgentState>,
    mut ws_read: S,
    frame_tx: FrameSender,
    heartbeat: HeartbeatHandle,
) -> Result<(), anyhow::Error>
where
    S: StreamExt<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin
        + Send
        + 'static,
{
    let semaphore = Arc::new(Semaphore::new(state.config.max_concurrency));
    let mut handler_handles: Vec<JoinHandle<()>> = Vec::new();
    let mut frames_since_cleanup: u32 = 0;
    let max_frame = state.config.max_frame_bytes;

    let read_err = loop {
        let msg = match ws_read.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(err)) => {
                warn!(error = %err, "WebSocket read error");
                break Some(err);
            }
            None => break None,
        };

        let data: Bytes = match msg {
            WsMessage::Binary(data) => Bytes::from(data),
            WsMessage::Text(text) => Bytes::from(text.into_bytes()),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(frame) => {
                info!(?frame, "received WebSocket close");
                break None;
            }
            _ => continue,
        };

        match decode(&data, max_frame) {
            Ok(Message::HttpRequest(request)) => {
                let semaphore = Arc::clone(&semaphore);
                let state = Arc::clone(&state);
                let tx = frame_tx.clone();
                let request_id = request.id.clone();
                let handle = tokio::spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let reply = local::dispatch(&state, request).await;
                    if let Err(send_err) = tx.send(reply).await {
                        // writer is gone; keep the reply for reconnect
                        if let Err(err) = state.queue.enqueue(send_err.0, Priority::Normal) {
                            warn!(error = %err, "reply lost, queue full");
                        }
                    }
                });
                handler_handles.push(handle);
                debug!(request_id = %request_id, "local dispatch started");
            }

            Ok(Message::Ping(ping)) => {
                let pong = Heartbeat {
                    id: ping.id,
                    timestamp: unix_ms(),
                };
                // try_send keeps the read loop from blocking on a
                // congested writer
                if frame_tx.try_send(Message::Pong(pong)).is_err() {
                    warn!("writer channel full, pong dropped");
                }
            }

            Ok(Message::Pong(pong)) => {
                heartbeat.on_pong(pong.id).await;
            }

            Ok(Message::Error(error)) => {
                warn!(
                    code = error.code.as_str(),
                    request_id = error.id.as_deref().unwrap_or("-"),
                    message = %error.message,
                    "broker reported error"
                );
            }

            Ok(Message::HttpResponse(response)) => {
                debug!(request_id = %response.id, "ignoring unexpected http_response");
            }

            Err(ProtoError::UnknownType(ty)) => {
                debug!(frame_type = %ty, "ignoring unknown frame type");
            }

            Err(err @ ProtoError::FrameTooLarge { .. }) => {
                warn!(error = %err, "oversize frame from broker, ignoring");
            }

            Err(ProtoError::Malformed(err)) => {
                warn!(error = %err, "malformed frame, forcing reconnect");
                break None;
            }
        }

        // Periodically clean up finished handles to avoid unbounded growth.
        frames_since_cleanup += 1;
        if frames_since_cleanup >= 64 || handler_handles.len() > state.config.max_concurrency * 2 {
            handler_handles.retain(|h| !h.is_finished());
            frames_since_cleanup = 0;
        }
    };

    // In-flight dispatches finish against the queue-backed writer path,
    // so their replies survive the reconnect.
    drain_handlers(handler_handles).await;

    match read_err {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

/// Wait for active dispatch tasks to finish (with a timeout).
async fn drain_handlers(handles: Vec<JoinHandle<()>>) {
    if handles.is_empty() {
        return;
    }
    let count = handles.len();
    debug!(count, "waiting for in-flight local dispatches");
    let _ = tokio::time::timeout(Duration::from_secs(15), async {
        for handle in handles {
            let _ = handle.await;
        }
    })
    .await;
}
