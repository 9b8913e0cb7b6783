//! HTTP route definitions

pub mod billing;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/billing/webhook", post(billing::webhook))
        .route(
            "/billing/subscription/{user_id}",
            get(billing::get_subscription),
        )
        .route(
            "/billing/history/{user_id}",
            get(billing::billing_history),
        )
        .route(
            "/billing/entitlements/{user_id}/post",
            get(billing::can_post),
        )
        .route(
            "/billing/entitlements/{user_id}/clients",
            get(billing::can_add_client),
        )
        .route(
            "/billing/entitlements/{user_id}/credits",
            get(billing::can_consume_credits),
        )
        .with_state(state)
}

/// Health check: reports whether the database and billing service are up
async fn health(State(state): State<AppState>) -> Json<Value> {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();

    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": db_ok,
        "billing": state.billing.is_some(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
