use std::sync::Arc;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod clock;
mod config;
mod services;
mod state;

use crate::clock::SystemClock;
use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting veles botd...");

    let config = Config::from_env()?;
    let pool = veles_db::connect(&config.database_url).await?;
    let state = Arc::new(AppState::new(pool, config, Arc::new(SystemClock)));

    // Surface panel misconfiguration at boot instead of on first purchase.
    for server in state.servers.get_active().await? {
        match state.panel_for(&server) {
            Ok(_) => info!("server {} ({}) configured", server.id, server.name),
            Err(e) => warn!("server {} ({}) unusable: {:#}", server.id, server.name, e),
        }
    }

    let sweeper_state = state.clone();
    tokio::spawn(async move {
        services::sweeper::run(sweeper_state).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping");
    Ok(())
}
