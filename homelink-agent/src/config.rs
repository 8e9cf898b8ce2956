use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// HomeLink desktop agent.
///
/// Keeps an authenticated WebSocket open to the broker and proxies
/// tunneled HTTP requests to a local origin (typically an inference
/// server on loopback).
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Broker WebSocket endpoint (e.g. wss://broker.example.com/ws/tunnel)
    #[arg(long, env = "TUNNEL_WS_URL")]
    pub tunnel_ws_url: String,

    /// Local HTTP origin requests are proxied to
    #[arg(long, env = "LOCAL_ORIGIN_URL", default_value = "http://127.0.0.1:11434")]
    pub local_origin_url: String,

    /// Bearer token for the tunnel
    #[arg(long, env = "TUNNEL_TOKEN")]
    pub tunnel_token: Option<String>,

    /// File to read the bearer token from; re-read after token expiry
    #[arg(long, env = "TUNNEL_TOKEN_FILE")]
    pub tunnel_token_file: Option<PathBuf>,

    /// Reconnection/queue profile for the local network
    #[arg(long, env = "NETWORK_PROFILE", value_enum, default_value = "stable")]
    pub network_profile: NetworkProfile,

    /// Heartbeat ping interval in milliseconds
    #[arg(long, env = "PING_INTERVAL_MS", default_value_t = 30_000)]
    pub ping_interval_ms: u64,

    /// Treat the link as dead when a pong is missing for this long
    #[arg(long, env = "PONG_TIMEOUT_MS", default_value_t = 45_000)]
    pub pong_timeout_ms: u64,

    /// Upper bound for one local-origin request, milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Maximum size of one wire frame in bytes
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = 1 << 20)]
    pub max_frame_bytes: usize,

    /// Where the outbound queue is persisted across restarts
    #[arg(long, env = "QUEUE_SNAPSHOT_PATH", default_value = "homelink-queue.json")]
    pub queue_snapshot_path: PathBuf,

    /// Queued items older than this are dropped at dequeue
    #[arg(long, env = "QUEUE_TTL_MS", default_value_t = 60_000)]
    pub queue_ttl_ms: u64,

    /// What happens when the outbound queue is full
    #[arg(long, env = "QUEUE_POLICY", value_enum, default_value = "drop-newest")]
    pub queue_policy: QueuePolicy,

    /// Concurrent local-origin requests
    #[arg(long, env = "MAX_CONCURRENCY", default_value_t = 10)]
    pub max_concurrency: usize,

    /// Broker TCP/TLS/upgrade handshake timeout, milliseconds
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// TCP keepalive on the tunnel socket in seconds (0 disables)
    #[arg(long, env = "TCP_KEEPALIVE_SECS", default_value_t = 60)]
    pub tcp_keepalive_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

/// Backpressure policy for a full outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum QueuePolicy {
    DropNewest,
    DropOldest,
}

impl From<QueuePolicy> for crate::queue::EnqueuePolicy {
    fn from(policy: QueuePolicy) -> Self {
        match policy {
            QueuePolicy::DropNewest => Self::DropNewest,
            QueuePolicy::DropOldest => Self::DropOldest,
        }
    }
}

/// Tuning profiles for reconnection and queueing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NetworkProfile {
    Stable,
    Unstable,
    LowBandwidth,
}

impl NetworkProfile {
    /// Base delay, max delay, and attempt cap for reconnection backoff.
    pub fn backoff(&self) -> (Duration, Duration, u32) {
        match self {
            Self::Stable => (Duration::from_secs(1), Duration::from_secs(30), 10),
            Self::Unstable => (Duration::from_secs(1), Duration::from_secs(60), 20),
            Self::LowBandwidth => (Duration::from_secs(2), Duration::from_secs(120), 10),
        }
    }

    /// Outbound queue capacity.
    pub fn queue_capacity(&self) -> usize {
        match self {
            Self::LowBandwidth => 50,
            Self::Stable => 100,
            Self::Unstable => 200,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.tunnel_ws_url.starts_with("ws://") && !self.tunnel_ws_url.starts_with("wss://") {
            anyhow::bail!("TUNNEL_WS_URL must use the ws:// or wss:// scheme");
        }
        if !self.local_origin_url.starts_with("http://")
            && !self.local_origin_url.starts_with("https://")
        {
            anyhow::bail!("LOCAL_ORIGIN_URL must use the http:// or https:// scheme");
        }
        if self.tunnel_token.is_none() && self.tunnel_token_file.is_none() {
            anyhow::bail!("one of TUNNEL_TOKEN or TUNNEL_TOKEN_FILE is required");
        }
        if self.ping_interval_ms == 0 || self.pong_timeout_ms == 0 {
            anyhow::bail!("heartbeat intervals must be positive");
        }
        if (self.pong_timeout_ms as f64) < 1.5 * self.ping_interval_ms as f64 {
            anyhow::bail!(
                "PONG_TIMEOUT_MS ({}) must be at least 1.5x PING_INTERVAL_MS ({})",
                self.pong_timeout_ms,
                self.ping_interval_ms
            );
        }
        if self.max_frame_bytes == 0 || self.request_timeout_ms == 0 || self.max_concurrency == 0 {
            anyhow::bail!("limits must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::parse_from([
            "homelink-agent",
            "--tunnel-ws-url",
            "wss://broker.example.com/ws/tunnel",
            "--tunnel-token",
            "tok",
        ])
    }

    #[test]
    fn defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn rejects_non_websocket_url() {
        let mut config = base();
        config.tunnel_ws_url = "https://broker.example.com".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn requires_a_token_source() {
        let mut config = base();
        config.tunnel_token = None;
        config.tunnel_token_file = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_tight_heartbeat_ratio() {
        let mut config = base();
        config.pong_timeout_ms = config.ping_interval_ms + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn profiles_scale_queue_capacity() {
        assert_eq!(NetworkProfile::LowBandwidth.queue_capacity(), 50);
        assert_eq!(NetworkProfile::Stable.queue_capacity(), 100);
        assert_eq!(NetworkProfile::Unstable.queue_capacity(), 200);
    }
}
