//! Binary entry point: loads configuration, builds the venue client, and
//! runs the engine loop until interrupted.

use std::sync::Arc;

use scalp_engine::config;
use scalp_engine::engine::Engine;
use scalp_engine::venue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = config::load_config()?;
    let dry_run = !config.trading_enabled;
    let venue_client = venue::create_venue_client(dry_run, &config.venue_rest_base)?;
    let engine = Engine::new(config, Arc::from(venue_client));

    tokio::select! {
        result = engine.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            engine.stop();
            Ok(())
        }
    }
}
