// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Multiapps Core - Deployment Process Worker
//!
//! The worker owns the database side of the process core:
//! - Schema migrations (SQLite or PostgreSQL, picked by URL scheme)
//! - Database health check on startup
//! - Periodic release of operation locks left behind by crashed processes
//!
//! Steps themselves are invoked by the workflow scheduler embedding the
//! library.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info, warn};

use multiapps_core::config::Config;
use multiapps_core::conflict::ConflictPreventer;
use multiapps_core::migrations;
use multiapps_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};

async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>> {
    if database_url.starts_with("sqlite:") {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("Running SQLite migrations...");
        migrations::run_sqlite(&pool).await?;
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("Running PostgreSQL migrations...");
        migrations::run_postgres(&pool).await?;
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("multiapps_core=info".parse()?),
        )
        .init();

    info!("Starting Multiapps Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        max_parallel_operations = config.max_parallel_operations,
        lock_timeout_secs = config.lock_timeout.as_secs(),
        lock_sweep_interval_secs = config.lock_sweep_interval.as_secs(),
        fail_safe = config.fail_safe,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence = connect(&config.database_url).await?;
    info!("Migrations completed");

    if !persistence.health_check_db().await? {
        anyhow::bail!("Database health check failed");
    }
    info!("Database health check passed");

    let preventer = ConflictPreventer::new(persistence.clone());
    let mut sweep = tokio::time::interval(config.lock_sweep_interval);

    info!("Multiapps Core initialized successfully");

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                if let Err(e) = preventer.release_stale(config.lock_timeout).await {
                    warn!(error = %e, "Stale lock sweep failed");
                }
            }
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutting down...");
                break;
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}
