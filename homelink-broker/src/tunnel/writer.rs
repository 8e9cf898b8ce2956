//! Dedicated per-session WebSocket writer task.
//!
//! All frame writes funnel through bounded channels into a single task,
//! so no two writes interleave on one socket. Control traffic
//! (ping/pong, close) has its own channel and is drained ahead of data
//! frames so heartbeats never queue behind large responses.

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use homelink_proto::{encode, Message};

/// Channel capacity for data frames; senders feel backpressure here.
const DATA_CHANNEL_CAP: usize = 64;
const CONTROL_CHANNEL_CAP: usize = 8;

/// Control-plane commands; drained before data frames.
pub enum WriteCommand {
    Frame(Message),
    /// Send a close frame and stop writing.
    Close(Option<CloseFrame>),
}

pub type ControlSender = mpsc::Sender<WriteCommand>;
pub type FrameSender = mpsc::Sender<Message>;

/// Spawn the writer task for one session socket.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, WsMessage>,
) -> (ControlSender, FrameSender, JoinHandle<()>) {
    let (control_tx, mut control_rx) = mpsc::channel::<WriteCommand>(CONTROL_CHANNEL_CAP);
    let (data_tx, mut data_rx) = mpsc::channel::<Message>(DATA_CHANNEL_CAP);

    let handle = tokio::spawn(async move {
        loop {
            let command = tokio::select! {
                biased;
                cmd = control_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
                frame = data_rx.recv() => match frame {
                    Some(frame) => WriteCommand::Frame(frame),
                    None => break,
                },
            };
            match command {
                WriteCommand::Frame(frame) => {
                    if let Err(err) = sink.send(WsMessage::text(encode(&frame))).await {
                        debug!(error = %err, "websocket write failed");
                        break;
                    }
                }
                WriteCommand::Close(frame) => {
                    let _ = sink.send(WsMessage::Close(frame)).await;
                    break;
                }
            }
        }
        debug!("session writer exiting");
        let _ = sink.close().await;
    });

    (control_tx, data_tx, handle)
}
