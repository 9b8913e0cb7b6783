//! Billing routes for Stripe integration

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use postline_billing::{BillingRecord, EntitlementDecision, SubscriptionRecord};

use crate::{error::ApiError, state::AppState};

/// Handle Stripe webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    // Get signature header
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    // Verify and parse event. Only a signature failure maps to 400; a
    // correctly signed payload that fails to parse is contract drift and
    // surfaces as 5xx so the processor redelivers and alerts.
    let event = billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = ?e, "Stripe webhook verification failed");
            ApiError::from(e)
        })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    // Handle the event. Transient failures surface as 5xx so Stripe
    // redelivers; every write already committed is idempotent under replay.
    billing.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(severity = %e.severity(), "Webhook handling error: {}", e);
        ApiError::from(e)
    })?;

    tracing::info!("Stripe webhook processed successfully");

    Ok(StatusCode::OK)
}

/// Get the reconciled subscription for a user
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<SubscriptionRecord>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let record = billing
        .entitlements
        .get_subscription(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No subscription for user {}", user_id)))?;

    Ok(Json(record))
}

#[derive(Debug, Serialize)]
pub struct EntitlementResponse {
    pub allowed: bool,
    pub decision: EntitlementDecision,
}

impl From<EntitlementDecision> for EntitlementResponse {
    fn from(decision: EntitlementDecision) -> Self {
        Self {
            allowed: decision.is_allowed(),
            decision,
        }
    }
}

/// Can this user schedule another post this month?
pub async fn can_post(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    Ok(Json(billing.entitlements.can_post(user_id).await.into()))
}

/// Can this user add another managed client?
pub async fn can_add_client(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    Ok(Json(
        billing.entitlements.can_add_client(user_id).await.into(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct CreditsQuery {
    /// Number of credits the caller wants to spend
    #[serde(default = "default_credits")]
    pub n: i64,
}

fn default_credits() -> i64 {
    1
}

/// Can this user spend `n` AI credits?
pub async fn can_consume_credits(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<CreditsQuery>,
) -> Result<Json<EntitlementResponse>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    Ok(Json(
        billing
            .entitlements
            .can_consume_credits(user_id, query.n)
            .await
            .into(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    pub limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

/// Billing history for a user, newest first
pub async fn billing_history(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<BillingRecord>>, ApiError> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let limit = query.limit.clamp(1, 200);
    let records = billing.history.list_records(user_id, limit).await?;

    Ok(Json(records))
}
