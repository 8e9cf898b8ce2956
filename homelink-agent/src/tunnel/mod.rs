//! Tunnel main loop: connect, dispatch, reconnect with backoff.

pub mod backoff;
pub mod client;
pub mod dispatcher;
pub mod heartbeat;
pub mod writer;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{error, info, warn};

use homelink_proto::ErrorCode;

use crate::state::{AgentState, ConnState};

use backoff::Backoff;

/// A connection that survives this long resets the backoff schedule.
const STABLE_CONNECTION: std::time::Duration = std::time::Duration::from_secs(60);

/// Errors that end the agent process with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("authentication rejected ({})", .0.as_str())]
    Auth(ErrorCode),
    #[error("reconnect attempts exhausted after {0} tries")]
    Network(u32),
}

/// Run the tunnel until shutdown or a fatal error.
pub async fn run(
    state: Arc<AgentState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), FatalError> {
    let (base, max, attempts) = state.config.network_profile.backoff();
    let mut backoff = Backoff::new(base, max, attempts);

    loop {
        let connected_at = Instant::now();
        match client::connect_and_run(&state, &mut shutdown).await {
            Ok(client::TunnelOutcome::Shutdown) => {
                state.set_conn_state(ConnState::Closed);
                info!("tunnel shut down gracefully");
                return Ok(());
            }
            Ok(client::TunnelOutcome::Disconnected) => {
                info!("tunnel disconnected, will reconnect");
            }
            Ok(client::TunnelOutcome::AuthRejected { code }) => {
                if code == ErrorCode::TokenExpired {
                    info!("token expired, refreshing before reconnect");
                    if !state.refresh_token() {
                        warn!("no fresh token available, retrying with the old one");
                    }
                } else if !code.retryable() {
                    state.set_conn_state(ConnState::Closed);
                    return Err(FatalError::Auth(code));
                }
            }
            Err(err) => {
                error!(error = %err, "tunnel connection lost");
            }
        }

        if *shutdown.borrow() {
            state.set_conn_state(ConnState::Closed);
            info!("shutdown requested, not reconnecting");
            return Ok(());
        }

        if connected_at.elapsed() >= STABLE_CONNECTION {
            backoff.reset();
        }

        state.set_conn_state(ConnState::Reconnecting);
        state
            .metrics
            .reconnect_attempts
            .fetch_add(1, Ordering::Relaxed);

        let Some(delay) = backoff.next_delay() else {
            state.set_conn_state(ConnState::Closed);
            return Err(FatalError::Network(backoff.attempt()));
        };
        info!(
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "reconnecting tunnel"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                state.set_conn_state(ConnState::Closed);
                info!("shutdown requested during reconnect wait");
                return Ok(());
            }
        }
    }
}
