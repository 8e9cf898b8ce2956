//! Dedicated WebSocket writer task.
//!
//! All frame writes go through an mpsc channel to a single writer task,
//! avoiding contention on the WebSocket sink. Frames that cannot be
//! written because the link died are moved to the outbound queue so a
//! reconnect can flush them.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, warn};

use homelink_proto::{encode, Message};

use crate::queue::Priority;
use crate::state::AgentState;

/// Sender half, cloned by the dispatcher and heartbeat.
pub type FrameSender = mpsc::Sender<Message>;

/// Spawn the writer task. Returns the sender and a JoinHandle whose
/// completion signals a dead write half.
pub fn spawn_writer<S>(mut sink: S, state: Arc<AgentState>) -> (FrameSender, JoinHandle<()>)
where
    S: SinkExt<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Message>(256);

    let handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let data = encode(&frame);
            if let Err(err) = sink.send(WsMessage::Text(data)).await {
                error!(error = %err, "failed to write frame to WebSocket");
                recover(&state, frame);
                break;
            }
        }
        debug!("writer task exiting");
        let _ = sink.close().await;
        // anything still buffered in the channel survives for reconnect
        while let Ok(frame) = rx.try_recv() {
            recover(&state, frame);
        }
    });

    (tx, handle)
}

/// Preserve an unwritten frame across the reconnect, except heartbeats,
/// which are useless once stale.
fn recover(state: &AgentState, frame: Message) {
    if matches!(frame, Message::Ping(_) | Message::Pong(_)) {
        return;
    }
    if let Err(err) = state.queue.enqueue(frame, Priority::Normal) {
        warn!(error = %err, "outbound queue full, frame dropped");
    }
}
