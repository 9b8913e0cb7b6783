//! Postline Background Worker
//!
//! Handles scheduled jobs:
//! - Monthly usage counter reset (midnight UTC on the 1st)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use postline_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Postline Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If Stripe isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            info!("Worker running without Stripe integration");

            // Keep running with minimal functionality
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Reset monthly usage counters
    // Cron: midnight UTC on the first of every month
    let usage_meter = billing.clone();
    scheduler
        .add(Job::new_async("0 0 0 1 * *", move |_uuid, _l| {
            let billing = usage_meter.clone();
            Box::pin(async move {
                info!("Running monthly usage counter reset");
                match billing.usage.reset_monthly_usage().await {
                    Ok(rows) => info!(rows = rows, "Monthly usage reset complete"),
                    Err(e) => error!(error = %e, "Monthly usage reset failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Monthly usage reset (midnight UTC, 1st of month)");

    // Job 2: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Postline Worker started successfully with 2 scheduled jobs");

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
