use std::time::Duration;

use clap::Parser;

use crate::breaker::BreakerSettings;
use crate::ratelimit::RateLimitSettings;

/// HomeLink tunnel broker.
///
/// Terminates public HTTP and the agent WebSocket, correlates tunneled
/// requests with responses, and enforces per-tenant limits.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address to bind the public listener on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8787")]
    pub listen_addr: String,

    /// Shared secret used to verify agent/client JWTs (HS256)
    #[arg(long, env = "TOKEN_SECRET")]
    pub token_secret: String,

    /// Expected JWT issuer (unchecked if omitted)
    #[arg(long, env = "TOKEN_ISSUER")]
    pub token_issuer: Option<String>,

    /// Expected JWT audience (unchecked if omitted)
    #[arg(long, env = "TOKEN_AUDIENCE")]
    pub token_audience: Option<String>,

    /// Bearer token for the diagnostics/config endpoints; disabled if omitted
    #[arg(long, env = "ADMIN_TOKEN")]
    pub admin_token: Option<String>,

    /// Heartbeat ping interval in milliseconds
    #[arg(long, env = "PING_INTERVAL_MS", default_value_t = 30_000)]
    pub ping_interval_ms: u64,

    /// Close a session when a pong is missing for this long
    #[arg(long, env = "PONG_TIMEOUT_MS", default_value_t = 45_000)]
    pub pong_timeout_ms: u64,

    /// Maximum size of one wire frame in bytes
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = 1 << 20)]
    pub max_frame_bytes: usize,

    /// Default per-request deadline in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Upper bound for caller-supplied X-Timeout-Ms
    #[arg(long, env = "MAX_REQUEST_TIMEOUT_MS", default_value_t = 120_000)]
    pub max_request_timeout_ms: u64,

    /// Free-tier request budget per minute
    #[arg(long, env = "RATE_LIMIT_FREE_PER_MIN", default_value_t = 60)]
    pub rate_limit_free_per_min: u32,

    /// Premium-tier request budget per minute
    #[arg(long, env = "RATE_LIMIT_PREMIUM_PER_MIN", default_value_t = 300)]
    pub rate_limit_premium_per_min: u32,

    /// Enterprise-tier request budget per minute
    #[arg(long, env = "RATE_LIMIT_ENTERPRISE_PER_MIN", default_value_t = 1000)]
    pub rate_limit_enterprise_per_min: u32,

    /// Per-source-IP request budget per minute
    #[arg(long, env = "RATE_LIMIT_IP_PER_MIN", default_value_t = 200)]
    pub rate_limit_ip_per_min: u32,

    /// Ban window for auto-blocked IPs in seconds
    #[arg(long, env = "RATE_LIMIT_BAN_SECS", default_value_t = 600)]
    pub rate_limit_ban_secs: u64,

    /// Concurrent outstanding requests allowed per session
    #[arg(long, env = "MAX_CHANNELS_PER_SESSION", default_value_t = 10)]
    pub max_channels_per_session: usize,

    /// Process-wide bound on outstanding tunnel requests
    #[arg(long, env = "MAX_PENDING_REQUESTS", default_value_t = 1024)]
    pub max_pending_requests: usize,

    /// Largest request body accepted by the proxy front
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 10 << 20)]
    pub max_body_bytes: usize,

    /// Close sessions with no application traffic after this long
    #[arg(long, env = "IDLE_TIMEOUT_MS", default_value_t = 300_000)]
    pub idle_timeout_ms: u64,

    /// Grace period for outstanding responses during shutdown
    #[arg(long, env = "DRAIN_GRACE_MS", default_value_t = 10_000)]
    pub drain_grace_ms: u64,

    /// Consecutive failures that open a circuit
    #[arg(long, env = "CIRCUIT_FAILURE_THRESHOLD", default_value_t = 5)]
    pub circuit_failure_threshold: u32,

    /// Consecutive half-open successes that close a circuit
    #[arg(long, env = "CIRCUIT_SUCCESS_THRESHOLD", default_value_t = 2)]
    pub circuit_success_threshold: u32,

    /// Time an open circuit waits before admitting probes
    #[arg(long, env = "CIRCUIT_RESET_MS", default_value_t = 30_000)]
    pub circuit_reset_ms: u64,

    /// Cap on cached token validations, milliseconds
    #[arg(long, env = "AUTH_CACHE_TTL_MS", default_value_t = 300_000)]
    pub auth_cache_ttl_ms: u64,

    /// Budget for token validation during the WebSocket handshake
    #[arg(long, env = "AUTH_BUDGET_MS", default_value_t = 5_000)]
    pub auth_budget_ms: u64,

    /// Expose the Prometheus scrape endpoint
    #[arg(long, env = "METRICS_ENABLED", default_value_t = true)]
    pub metrics_enabled: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Reject configurations that violate protocol invariants.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ping_interval_ms == 0 || self.pong_timeout_ms == 0 {
            anyhow::bail!("heartbeat intervals must be positive");
        }
        // a pong budget shorter than 1.5 pings cannot distinguish a slow
        // peer from a dead one
        if (self.pong_timeout_ms as f64) < 1.5 * self.ping_interval_ms as f64 {
            anyhow::bail!(
                "PONG_TIMEOUT_MS ({}) must be at least 1.5x PING_INTERVAL_MS ({})",
                self.pong_timeout_ms,
                self.ping_interval_ms
            );
        }
        if self.max_frame_bytes == 0 || self.max_body_bytes == 0 {
            anyhow::bail!("frame and body limits must be positive");
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > self.max_request_timeout_ms {
            anyhow::bail!(
                "REQUEST_TIMEOUT_MS must be in 1..=MAX_REQUEST_TIMEOUT_MS ({})",
                self.max_request_timeout_ms
            );
        }
        if self.max_channels_per_session == 0 || self.max_pending_requests == 0 {
            anyhow::bail!("concurrency caps must be positive");
        }
        if self.token_secret.len() < 16 {
            anyhow::bail!("TOKEN_SECRET must be at least 16 bytes");
        }
        if self.circuit_failure_threshold == 0 || self.circuit_success_threshold == 0 {
            anyhow::bail!("circuit thresholds must be positive");
        }
        Ok(())
    }

    pub fn rate_limit_settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            free_per_min: self.rate_limit_free_per_min,
            premium_per_min: self.rate_limit_premium_per_min,
            enterprise_per_min: self.rate_limit_enterprise_per_min,
            ip_per_min: self.rate_limit_ip_per_min,
            ban_window: Duration::from_secs(self.rate_limit_ban_secs),
            stale_after: Duration::from_secs(600),
        }
    }

    pub fn breaker_settings(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.circuit_failure_threshold,
            success_threshold: self.circuit_success_threshold,
            reset_timeout: Duration::from_millis(self.circuit_reset_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::parse_from(["homelink-broker", "--token-secret", "0123456789abcdef"])
    }

    #[test]
    fn defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn rejects_tight_heartbeat_ratio() {
        let mut config = base();
        config.ping_interval_ms = 30_000;
        config.pong_timeout_ms = 31_000;
        assert!(config.validate().is_err());
        // exactly 1.5x is accepted
        config.pong_timeout_ms = 45_000;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_timeout_above_maximum() {
        let mut config = base();
        config.request_timeout_ms = 500_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_short_secret() {
        let mut config = base();
        config.token_secret = "short".into();
        assert!(config.validate().is_err());
    }
}
