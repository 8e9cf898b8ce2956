//! Agent-side heartbeat: periodic pings and pong-deadline detection.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use homelink_proto::message::unix_ms;
use homelink_proto::{Heartbeat, Message};

use super::writer::FrameSender;

/// Handle for the dispatcher to forward pong frames.
#[derive(Clone)]
pub struct HeartbeatHandle {
    pong_tx: mpsc::Sender<String>,
}

impl HeartbeatHandle {
    pub async fn on_pong(&self, id: String) {
        let _ = self.pong_tx.send(id).await;
    }
}

/// Spawn the heartbeat task. The returned JoinHandle completes when the
/// peer stops answering pings; the caller treats that as a disconnect.
pub fn spawn(
    ping_interval: Duration,
    pong_timeout: Duration,
    frame_tx: FrameSender,
) -> (HeartbeatHandle, JoinHandle<()>) {
    let (pong_tx, mut pong_rx) = mpsc::channel::<String>(4);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        let mut outstanding: Option<(String, Instant)> = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some((_, sent_at)) = &outstanding {
                        if sent_at.elapsed() >= pong_timeout {
                            warn!(
                                pong_timeout_ms = pong_timeout.as_millis() as u64,
                                "pong overdue, treating link as dead"
                            );
                            return;
                        }
                    } else {
                        let ping = Heartbeat {
                            id: Uuid::new_v4().to_string(),
                            timestamp: unix_ms(),
                        };
                        let id = ping.id.clone();
                        if frame_tx.send(Message::Ping(ping)).await.is_err() {
                            debug!("writer closed, heartbeat exiting");
                            return;
                        }
                        outstanding = Some((id, Instant::now()));
                    }
                }
                pong = pong_rx.recv() => {
                    match pong {
                        Some(id) => {
                            if outstanding.as_ref().is_some_and(|(expected, _)| *expected == id) {
                                outstanding = None;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    });

    (HeartbeatHandle { pong_tx }, handle)
}
