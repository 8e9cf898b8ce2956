//! Tunnel error taxonomy: stable codes, categories, and retryability.
//!
//! Codes are wire-exposed identifiers: they appear in `error` frames,
//! HTTP error bodies, and logs, and must never change meaning.

use serde::{Deserialize, Serialize};

/// Broad failure class; governs HTTP status mapping and recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Authentication,
    RateLimit,
    Server,
    Protocol,
    Upstream,
    Configuration,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Server => "server",
            Self::Protocol => "protocol",
            Self::Upstream => "upstream",
            Self::Configuration => "configuration",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable error code carried on the wire and in HTTP error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // network
    ConnectionRefused,
    DnsFailure,
    NetworkUnreachable,
    // authentication
    TokenMissing,
    TokenInvalid,
    TokenExpired,
    Forbidden,
    // rate_limit
    RateLimitExceeded,
    QueueFull,
    IpBlocked,
    SessionLimitReached,
    // server
    AgentOffline,
    SessionLost,
    HeartbeatTimeout,
    InternalError,
    ServerUnavailable,
    // protocol
    BadFrame,
    FrameTooLarge,
    UnknownType,
    CrossSessionResponse,
    PathTraversal,
    // upstream
    UpstreamTimeout,
    UpstreamError,
    // configuration
    ConfigurationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionRefused => "connection_refused",
            Self::DnsFailure => "dns_failure",
            Self::NetworkUnreachable => "network_unreachable",
            Self::TokenMissing => "token_missing",
            Self::TokenInvalid => "token_invalid",
            Self::TokenExpired => "token_expired",
            Self::Forbidden => "forbidden",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::QueueFull => "queue_full",
            Self::IpBlocked => "ip_blocked",
            Self::SessionLimitReached => "session_limit_reached",
            Self::AgentOffline => "agent_offline",
            Self::SessionLost => "session_lost",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::InternalError => "internal_error",
            Self::ServerUnavailable => "server_unavailable",
            Self::BadFrame => "bad_frame",
            Self::FrameTooLarge => "frame_too_large",
            Self::UnknownType => "unknown_type",
            Self::CrossSessionResponse => "cross_session_response",
            Self::PathTraversal => "path_traversal",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamError => "upstream_error",
            Self::ConfigurationError => "configuration_error",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectionRefused | Self::DnsFailure | Self::NetworkUnreachable => {
                ErrorCategory::Network
            }
            Self::TokenMissing | Self::TokenInvalid | Self::TokenExpired | Self::Forbidden => {
                ErrorCategory::Authentication
            }
            Self::RateLimitExceeded
            | Self::QueueFull
            | Self::IpBlocked
            | Self::SessionLimitReached => ErrorCategory::RateLimit,
            Self::AgentOffline
            | Self::SessionLost
            | Self::HeartbeatTimeout
            | Self::InternalError
            | Self::ServerUnavailable => ErrorCategory::Server,
            Self::BadFrame
            | Self::FrameTooLarge
            | Self::UnknownType
            | Self::CrossSessionResponse
            | Self::PathTraversal => ErrorCategory::Protocol,
            Self::UpstreamTimeout | Self::UpstreamError => ErrorCategory::Upstream,
            Self::ConfigurationError => ErrorCategory::Configuration,
        }
    }

    /// Whether a caller may retry the same operation without changing it.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            Self::ConfigurationError
                | Self::TokenInvalid
                | Self::TokenMissing
                | Self::Forbidden
                | Self::BadFrame
                | Self::PathTraversal
                | Self::CrossSessionResponse
        )
    }

    /// HTTP status the proxy front maps this code to.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::TokenMissing | Self::TokenInvalid | Self::TokenExpired => 401,
            Self::Forbidden => 403,
            Self::PathTraversal | Self::BadFrame | Self::FrameTooLarge | Self::UnknownType => 400,
            Self::RateLimitExceeded | Self::IpBlocked => 429,
            Self::AgentOffline
            | Self::SessionLost
            | Self::QueueFull
            | Self::SessionLimitReached
            | Self::ServerUnavailable => 503,
            Self::UpstreamTimeout => 504,
            Self::ConnectionRefused
            | Self::DnsFailure
            | Self::NetworkUnreachable
            | Self::UpstreamError
            | Self::CrossSessionResponse
            | Self::HeartbeatTimeout => 502,
            Self::InternalError | Self::ConfigurationError => 500,
        }
    }

    /// Operator-facing hint included in HTTP error bodies.
    pub fn suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Network => "check network connectivity and retry",
            ErrorCategory::Authentication => match self {
                Self::TokenExpired => "refresh the access token and retry",
                _ => "verify the access token and account permissions",
            },
            ErrorCategory::RateLimit => "slow down and retry after the indicated delay",
            ErrorCategory::Server => match self {
                Self::AgentOffline => "start the desktop agent and retry",
                _ => "retry shortly; the tunnel is recovering",
            },
            ErrorCategory::Protocol => "this indicates a client bug; do not retry unchanged",
            ErrorCategory::Upstream => "check that the local service is running and responsive",
            ErrorCategory::Configuration => "fix the configuration before retrying",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = UnknownCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| UnknownCode(s.to_owned()))
    }
}

/// Parse failure for an error-code string received on the wire.
#[derive(Debug, thiserror::Error)]
#[error("unknown error code: {0}")]
pub struct UnknownCode(pub String);
