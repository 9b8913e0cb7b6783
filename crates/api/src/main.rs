// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Postline API Server
//!
//! HTTP surface for the billing reconciliation engine: the Stripe webhook
//! endpoint plus the internal subscription/entitlement read routes.

mod config;
mod error;
mod routes;
mod state;

use std::net::SocketAddr;

use axum::http::{header, Method};
use postline_shared::{create_pool, run_migrations};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,postline_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Postline API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Run migrations
    tracing::info!("Running database migrations...");
    run_migrations(&pool).await?;
    tracing::info!("Database migrations complete");

    // Create application state
    let state = AppState::new(pool, config.clone());

    // Build CORS layer - restrict to allowed origins only.
    // Default to localhost for development; production sets ALLOWED_ORIGINS.
    let allowed_origins: Vec<axum::http::HeaderValue> = std::env::var("ALLOWED_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE])
        .allow_credentials(true);

    // Build the router
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
