mod api;
mod app;
mod auth;
mod breaker;
mod config;
mod correlator;
mod metrics;
mod ratelimit;
mod registry;
mod state;
mod tunnel;

use clap::Parser;

use config::Config;

/// Exit code for configuration errors.
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    let config = Config::parse();
    if let Err(err) = config.validate() {
        eprintln!("configuration error: {err}");
        std::process::exit(EXIT_CONFIG);
    }
    if let Err(err) = app::run(config).await {
        eprintln!("homelink-broker failed: {err:#}");
        std::process::exit(1);
    }
}
