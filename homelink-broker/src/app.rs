//! Application lifecycle: initialization, background tasks, and shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use crate::api;
use crate::config::Config;
use crate::metrics::describe_metrics;
use crate::state::AppState;

/// Interval for the stale-state cleaner.
const CLEANER_INTERVAL: Duration = Duration::from_secs(30);

/// Run the broker until a shutdown signal arrives.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    // metrics first: everything after may record
    let prometheus = if config.metrics_enabled {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|err| anyhow::anyhow!("failed to install metrics recorder: {err}"))?;
        describe_metrics();
        Some(handle)
    } else {
        None
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen_addr,
        "homelink-broker starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState::new(config, prometheus, shutdown_rx.clone()));

    {
        let state = Arc::clone(&state);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(cleaner(state, shutdown));
    }

    let listener = tokio::net::TcpListener::bind(&state.config.listen_addr).await?;
    let router = api::router(Arc::clone(&state));

    let shutdown_signal = async move {
        wait_for_shutdown().await;
        info!("shutdown signal received, draining sessions");
        let _ = shutdown_tx.send(true);
    };

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await?;

    info!("homelink-broker stopped");
    Ok(())
}

/// Periodically evict expired auth-cache entries, stale rate-limit
/// buckets, and abandoned correlator entries.
async fn cleaner(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(CLEANER_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.validator.evict_expired();
                state.limiter.cleanup();
                state.correlator.sweep();
            }
            _ = shutdown.changed() => break,
        }
    }
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
