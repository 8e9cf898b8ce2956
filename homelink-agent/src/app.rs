//! Application lifecycle: initialization, the tunnel task, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;
use crate::queue::RequestQueue;
use crate::state::AgentState;
use crate::tunnel;

/// Configuration problems discovered after parsing (e.g. an unreadable
/// token file); mapped to exit code 2.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Run the agent until shutdown or a fatal error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls CryptoProvider"))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        origin = %config.local_origin_url,
        profile = ?config.network_profile,
        "homelink-agent starting"
    );

    let token = load_token(&config)?;

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
        .pool_max_idle_per_host(8)
        .tcp_nodelay(true)
        .build()
        .map_err(|err| anyhow::anyhow!("failed to build http client: {err}"))?;

    let queue = RequestQueue::new(
        config.network_profile.queue_capacity(),
        config.queue_policy.into(),
        Duration::from_millis(config.queue_ttl_ms),
    );
    match queue.restore(&config.queue_snapshot_path) {
        Ok(0) => {}
        Ok(restored) => info!(restored, "resumed queued frames from snapshot"),
        Err(err) => warn!(error = %err, "queue snapshot not restored"),
    }

    let state = Arc::new(AgentState::new(config, client, queue, token));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tunnel_task = tokio::spawn(tunnel::run(Arc::clone(&state), shutdown_rx));

    let result = tokio::select! {
        joined = &mut tunnel_task => match joined {
            Ok(tunnel_result) => tunnel_result.map_err(anyhow::Error::from),
            Err(err) => Err(anyhow::anyhow!("tunnel task panicked: {err}")),
        },
        _ = wait_for_shutdown() => {
            info!("shutdown signal received, cleaning up...");
            let _ = shutdown_tx.send(true);
            match tunnel_task.await {
                Ok(tunnel_result) => tunnel_result.map_err(anyhow::Error::from),
                Err(err) => Err(anyhow::anyhow!("tunnel task panicked: {err}")),
            }
        }
    };

    if let Err(err) = state.queue.persist(&state.config.queue_snapshot_path) {
        warn!(error = %err, "failed to persist queue snapshot");
    }

    info!(
        connection_state = state.conn_state().as_str(),
        "homelink-agent stopped"
    );
    result
}

/// Token precedence: explicit value, then token file.
fn load_token(config: &Config) -> Result<String, ConfigError> {
    if let Some(token) = &config.tunnel_token {
        return Ok(token.clone());
    }
    let path = config
        .tunnel_token_file
        .as_ref()
        .ok_or_else(|| ConfigError("no token source configured".into()))?;
    let token = std::fs::read_to_string(path)
        .map_err(|err| ConfigError(format!("cannot read {}: {err}", path.display())))?;
    let token = token.trim().to_owned();
    if token.is_empty() {
        return Err(ConfigError(format!("{} is empty", path.display())));
    }
    Ok(token)
}

fn init_tracing(config: &Config) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
