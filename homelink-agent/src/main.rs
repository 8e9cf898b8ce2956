mod app;
mod config;
mod local;
mod queue;
mod state;
mod tunnel;

use clap::Parser;

use config::Config;
use tunnel::FatalError;

const EXIT_GENERIC: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_AUTH: i32 = 3;
const EXIT_NETWORK: i32 = 4;

#[tokio::main]
async fn main() {
    let config = Config::parse();
    if let Err(err) = config.validate() {
        eprintln!("configuration error: {err}");
        std::process::exit(EXIT_CONFIG);
    }

    if let Err(err) = app::run(config).await {
        let code = if let Some(fatal) = err.downcast_ref::<FatalError>() {
            match fatal {
                FatalError::Auth(_) => EXIT_AUTH,
                FatalError::Network(_) => EXIT_NETWORK,
            }
        } else if err.downcast_ref::<app::ConfigError>().is_some() {
            EXIT_CONFIG
        } else {
            EXIT_GENERIC
        };
        eprintln!("homelink-agent failed: {err:#}");
        std::process::exit(code);
    }
}
