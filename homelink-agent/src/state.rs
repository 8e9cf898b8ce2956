//! Shared agent state passed to all subsystems.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use tracing::info;

use crate::config::Config;
use crate::queue::RequestQueue;

/// Connection lifecycle, exposed for logs and state-change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Disconnected = 0,
    Connecting = 1,
    Authenticating = 2,
    Connected = 3,
    Reconnecting = 4,
    Closed = 5,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Authenticating,
            3 => Self::Connected,
            4 => Self::Reconnecting,
            5 => Self::Closed,
            _ => Self::Disconnected,
        }
    }
}

/// Request counters surfaced in logs on disconnect.
#[derive(Default)]
pub struct AgentMetrics {
    pub requests_handled: AtomicU64,
    pub requests_failed: AtomicU64,
    pub reconnect_attempts: AtomicU64,
}

pub struct AgentState {
    pub config: Config,
    /// Client for local-origin dispatch (shared, pooled).
    pub client: reqwest::Client,
    pub queue: RequestQueue,
    pub metrics: AgentMetrics,
    /// Bearer token; re-read from the token file after expiry.
    token: RwLock<String>,
    conn_state: AtomicU8,
}

impl AgentState {
    pub fn new(config: Config, client: reqwest::Client, queue: RequestQueue, token: String) -> Self {
        Self {
            config,
            client,
            queue,
            metrics: AgentMetrics::default(),
            token: RwLock::new(token),
            conn_state: AtomicU8::new(ConnState::Disconnected as u8),
        }
    }

    pub fn token(&self) -> String {
        self.token.read().unwrap().clone()
    }

    /// Reload the token from the configured file, if any. Returns true
    /// when a fresh token was loaded.
    pub fn refresh_token(&self) -> bool {
        let Some(path) = &self.config.tunnel_token_file else {
            return false;
        };
        match std::fs::read_to_string(path) {
            Ok(fresh) => {
                let fresh = fresh.trim().to_owned();
                let mut token = self.token.write().unwrap();
                let changed = *token != fresh;
                *token = fresh;
                changed
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "token file read failed");
                false
            }
        }
    }

    pub fn conn_state(&self) -> ConnState {
        ConnState::from_u8(self.conn_state.load(Ordering::Acquire))
    }

    /// Transition the connection state, emitting a state-change event.
    pub fn set_conn_state(&self, next: ConnState) {
        let prev = self.conn_state.swap(next as u8, Ordering::AcqRel);
        if prev != next as u8 {
            info!(
                from = ConnState::from_u8(prev).as_str(),
                to = next.as_str(),
                "connection state changed"
            );
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EnqueuePolicy;
    use clap::Parser;

    fn state_with_token_file(path: &std::path::Path) -> AgentState {
        let config = Config::parse_from([
            "homelink-agent",
            "--tunnel-ws-url",
            "wss://broker.example.com/ws/tunnel",
            "--tunnel-token-file",
            path.to_str().unwrap(),
        ]);
        let queue = RequestQueue::new(10, EnqueuePolicy::DropNewest, Duration::from_secs(60));
        AgentState::new(config, reqwest::Client::new(), queue, "initial".into())
    }

    #[test]
    fn refresh_token_reads_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "fresh-token\n").unwrap();

        let state = state_with_token_file(&path);
        assert_eq!(state.token(), "initial");
        assert!(state.refresh_token());
        assert_eq!(state.token(), "fresh-token");
        // unchanged content reports no refresh
        assert!(!state.refresh_token());
    }

    #[test]
    fn conn_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "t").unwrap();
        let state = state_with_token_file(&path);
        assert_eq!(state.conn_state(), ConnState::Disconnected);
        state.set_conn_state(ConnState::Connecting);
        state.set_conn_state(ConnState::Connected);
        assert_eq!(state.conn_state(), ConnState::Connected);
    }
}
