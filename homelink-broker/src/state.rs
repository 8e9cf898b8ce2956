//! Shared broker state, built once at startup.

use std::collections::VecDeque;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use homelink_proto::ErrorCode;

use crate::auth::{unix_now, TokenValidator};
use crate::breaker::BreakerMap;
use crate::config::Config;
use crate::correlator::Correlator;
use crate::ratelimit::RateLimiter;
use crate::registry::AgentRegistry;

/// Recent-error ring capacity for the diagnostics endpoint.
const RECENT_ERRORS_CAP: usize = 100;

/// Subset of configuration adjustable at runtime via the admin API.
#[derive(Debug, Default)]
pub struct RuntimeOverrides {
    pub request_timeout_ms: Option<u64>,
    pub max_channels_per_session: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorEvent {
    pub at: u64,
    pub code: &'static str,
    pub user_id: Option<String>,
    pub correlation_id: String,
}

pub struct AppState {
    pub config: Config,
    pub validator: TokenValidator,
    pub limiter: RateLimiter,
    pub breakers: BreakerMap,
    pub registry: AgentRegistry,
    pub correlator: Correlator,
    pub overrides: RwLock<RuntimeOverrides>,
    pub prometheus: Option<PrometheusHandle>,
    pub started_at: Instant,
    /// Cloned into every session so shutdown can drain them.
    pub shutdown: watch::Receiver<bool>,
    recent: Mutex<VecDeque<ErrorEvent>>,
}

impl AppState {
    pub fn new(
        config: Config,
        prometheus: Option<PrometheusHandle>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let validator = TokenValidator::new(
            &config.token_secret,
            config.token_issuer.as_deref(),
            config.token_audience.as_deref(),
            std::time::Duration::from_millis(config.auth_cache_ttl_ms),
        );
        let limiter = RateLimiter::new(config.rate_limit_settings());
        let breakers = BreakerMap::new(config.breaker_settings());
        let correlator = Correlator::new(config.max_pending_requests);
        Self {
            validator,
            limiter,
            breakers,
            registry: AgentRegistry::new(),
            correlator,
            overrides: RwLock::new(RuntimeOverrides::default()),
            prometheus,
            started_at: Instant::now(),
            shutdown,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_ERRORS_CAP)),
            config,
        }
    }

    pub fn effective_request_timeout_ms(&self) -> u64 {
        self.overrides
            .read()
            .request_timeout_ms
            .unwrap_or(self.config.request_timeout_ms)
    }

    pub fn effective_max_channels(&self) -> usize {
        self.overrides
            .read()
            .max_channels_per_session
            .unwrap_or(self.config.max_channels_per_session)
    }

    /// Remember a failure for the diagnostics endpoint.
    pub fn record_error(&self, code: ErrorCode, user_id: Option<&str>, correlation_id: &str) {
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_ERRORS_CAP {
            recent.pop_front();
        }
        recent.push_back(ErrorEvent {
            at: unix_now(),
            code: code.as_str(),
            user_id: user_id.map(str::to_owned),
            correlation_id: correlation_id.to_owned(),
        });
    }

    pub fn recent_errors(&self) -> Vec<ErrorEvent> {
        self.recent.lock().iter().cloned().collect()
    }
}
