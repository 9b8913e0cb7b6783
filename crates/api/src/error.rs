//! API error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use postline_billing::BillingError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable")]
    ServiceUnavailable,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            // Bad signatures are the caller's fault; everything else that
            // escapes a handler is a transient server-side failure, and the
            // 5xx tells Stripe to redeliver.
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::ServiceUnavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service unavailable".to_string(),
            ),
            ApiError::Database(msg) => {
                tracing::error!(error = %msg, "Database error in request handler");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error in request handler");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failure_maps_to_bad_request() {
        let api: ApiError = BillingError::WebhookSignatureInvalid.into();
        assert!(matches!(api, ApiError::BadRequest(_)));
    }

    #[test]
    fn transient_billing_errors_map_to_internal() {
        let api: ApiError = BillingError::UpstreamTimeout.into();
        assert!(matches!(api, ApiError::Internal(_)));

        let api: ApiError = BillingError::Database("connection reset".to_string()).into();
        assert!(matches!(api, ApiError::Internal(_)));
    }

    #[test]
    fn signed_but_unparseable_payload_is_a_server_error() {
        // A payload that passes signature verification but fails to parse is
        // contract drift, not a bad caller: it must 5xx so the processor
        // redelivers, never 400.
        let api: ApiError = BillingError::MalformedPayload("event JSON did not parse".to_string()).into();
        assert!(matches!(api, ApiError::Internal(_)));
    }
}
