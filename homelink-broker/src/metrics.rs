//! Metric key definitions for the broker.
//!
//! Keys are declared here and described once at startup via
//! [`describe_metrics`]; call sites record through the `metrics` macros.

/// Requests through the proxy front, labeled by `outcome`.
pub const METRIC_REQUESTS_TOTAL: &str = "homelink.requests.total";
/// Failures by error `category`.
pub const METRIC_ERRORS_TOTAL: &str = "homelink.errors.total";
/// Rate-limit denials.
pub const METRIC_RATE_LIMIT_VIOLATIONS: &str = "homelink.rate_limit.violations.total";
/// Circuit-breaker transitions, labeled `from`/`to`.
pub const METRIC_CIRCUIT_TRANSITIONS: &str = "homelink.circuit.transitions.total";
/// Live agent sessions.
pub const METRIC_CONNECTIONS_ACTIVE: &str = "homelink.connections.active";
/// Live agent sessions by `tier`.
pub const METRIC_CONNECTIONS_BY_TIER: &str = "homelink.connections.by_tier";
/// Circuit state per `user` (0 closed, 1 open, 2 half-open).
pub const METRIC_CIRCUIT_STATE: &str = "homelink.circuit.state";
/// End-to-end proxy latency.
pub const METRIC_REQUEST_LATENCY_MS: &str = "homelink.request.latency_ms";
/// Bytes moved through the tunnel per request (request + response bodies).
pub const METRIC_REQUEST_BYTES: &str = "homelink.request.bytes";
/// Session closes, labeled by `reason`.
pub const METRIC_SESSION_CLOSES: &str = "homelink.sessions.closed.total";

pub fn describe_metrics() {
    metrics::describe_counter!(
        METRIC_REQUESTS_TOTAL,
        metrics::Unit::Count,
        "Requests handled by the proxy front, labeled by outcome"
    );
    metrics::describe_counter!(
        METRIC_ERRORS_TOTAL,
        metrics::Unit::Count,
        "Failed requests by error category"
    );
    metrics::describe_counter!(
        METRIC_RATE_LIMIT_VIOLATIONS,
        metrics::Unit::Count,
        "Requests denied by the rate limiter"
    );
    metrics::describe_counter!(
        METRIC_CIRCUIT_TRANSITIONS,
        metrics::Unit::Count,
        "Circuit breaker state transitions"
    );
    metrics::describe_gauge!(
        METRIC_CONNECTIONS_ACTIVE,
        metrics::Unit::Count,
        "Currently connected agent sessions"
    );
    metrics::describe_gauge!(
        METRIC_CONNECTIONS_BY_TIER,
        metrics::Unit::Count,
        "Currently connected agent sessions per tier"
    );
    metrics::describe_gauge!(
        METRIC_CIRCUIT_STATE,
        metrics::Unit::Count,
        "Circuit breaker state per protected upstream"
    );
    metrics::describe_histogram!(
        METRIC_REQUEST_LATENCY_MS,
        metrics::Unit::Milliseconds,
        "End-to-end latency of proxied requests"
    );
    metrics::describe_histogram!(
        METRIC_REQUEST_BYTES,
        metrics::Unit::Bytes,
        "Combined request and response body size per proxied request"
    );
    metrics::describe_counter!(
        METRIC_SESSION_CLOSES,
        metrics::Unit::Count,
        "Agent session closes by reason"
    );
}
