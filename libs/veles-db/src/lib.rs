pub mod models;
pub mod repositories;

pub use sqlx;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

/// Opens the store and brings the schema up to date.
///
/// Migrations are versioned SQL files applied in order; each run is
/// idempotent and tracked by sqlx's migration table.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid SQLite URL: {url}"))?
        .create_if_missing(true)
        .foreign_keys(true);

    // An in-memory database exists per connection; keep a single handle so
    // every caller sees the same schema.
    let max_connections = if url.contains(":memory:") { 1 } else { 10 };

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .context("Failed to connect to SQLite")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run DB migrations")?;

    Ok(pool)
}
