use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod infrastructure;
mod modules;
mod state;
mod workers;

use config::settings::{AppConfig, Profile};
use infrastructure::db::pool::connect_to_db;
use infrastructure::queue::rabbitmq::RabbitMqService;
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let profile = Profile::from_env()?;
    let env_file = profile.load();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match env_file {
        Ok(path) => info!(profile = profile.as_str(), "Loaded environment from {}", path.display()),
        Err(e) => warn!(profile = profile.as_str(), "Environment file not loaded: {}", e),
    }

    info!("Starting converter worker...");

    let config = AppConfig::new(profile).context("Invalid configuration")?;

    let db = connect_to_db(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let queue = RabbitMqService::new(&config.amqp_url).await?;

    let state = AppState::new(config, db, queue);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.cancel();
        }
    });

    workers::transcoder::start_transcoder_worker(state, shutdown).await?;

    info!("Converter worker stopped");
    Ok(())
}
