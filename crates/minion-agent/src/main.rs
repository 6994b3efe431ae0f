use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod executor;
mod session;

use config::Config;
use session::Session;

const CONFIG_PATH: &str = "config.json";

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::load(Path::new(CONFIG_PATH)) {
        Ok(config) => config,
        Err(err) => {
            error!("config_error: {err}");
            std::process::exit(1);
        }
    };

    let session = match Session::connect(config).await {
        Ok(session) => session,
        Err(err) => {
            error!("connect_error: {err}");
            std::process::exit(1);
        }
    };
    info!("connected to controller, entering dispatch loop");

    if let Err(err) = session.run().await {
        error!("session_terminated: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
