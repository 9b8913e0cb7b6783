//! Billing error taxonomy
//!
//! Every webhook failure falls into one of these buckets, which determines
//! the HTTP response the payment processor sees (and therefore whether it
//! retries delivery):
//!
//! - `WebhookSignatureInvalid` -> 400, never retried
//! - `UpstreamLookupFailed` / `UpstreamTimeout` / `Database` /
//!   `MalformedPayload` -> 5xx, processor retries with backoff
//! - `MissingMetadata` / `MissingLocalSubscription` are logged and
//!   acknowledged inside the handlers; retrying cannot manufacture the
//!   missing context, so they never surface as 5xx

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Stripe API error: {0}")]
    UpstreamLookupFailed(#[from] stripe::StripeError),

    #[error("Stripe API call timed out")]
    UpstreamTimeout,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Required metadata missing from event: {0}")]
    MissingMetadata(String),

    #[error("No local subscription for customer {0}")]
    MissingLocalSubscription(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

/// Severity tier attached to error logs, independent of the HTTP response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Anything touching elevated credentials
    Critical,
    /// Authentication or connection failures
    High,
    /// Quota or delivery issues
    Medium,
    /// Everything else
    Low,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::High => write!(f, "HIGH"),
            ErrorSeverity::Medium => write!(f, "MEDIUM"),
            ErrorSeverity::Low => write!(f, "LOW"),
        }
    }
}

impl BillingError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            BillingError::Config(_) => ErrorSeverity::Critical,
            BillingError::WebhookSignatureInvalid
            | BillingError::UpstreamLookupFailed(_)
            | BillingError::UpstreamTimeout
            | BillingError::Database(_) => ErrorSeverity::High,
            BillingError::MalformedPayload(_) | BillingError::MissingLocalSubscription(_) => {
                ErrorSeverity::Medium
            }
            BillingError::MissingMetadata(_) | BillingError::Internal(_) => ErrorSeverity::Low,
        }
    }

    /// Whether the processor should retry delivery of the triggering event.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::UpstreamLookupFailed(_)
                | BillingError::UpstreamTimeout
                | BillingError::Database(_)
                | BillingError::MalformedPayload(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failure_is_not_retryable() {
        assert!(!BillingError::WebhookSignatureInvalid.is_retryable());
    }

    #[test]
    fn transient_failures_are_retryable() {
        assert!(BillingError::UpstreamTimeout.is_retryable());
        assert!(BillingError::Database("connection reset".into()).is_retryable());
        assert!(BillingError::MalformedPayload("bad object".into()).is_retryable());
    }

    #[test]
    fn missing_context_is_not_retryable() {
        // Retrying cannot manufacture missing metadata or a missing row
        assert!(!BillingError::MissingMetadata("user_id".into()).is_retryable());
        assert!(!BillingError::MissingLocalSubscription("cus_123".into()).is_retryable());
    }

    #[test]
    fn severity_tiers() {
        assert_eq!(
            BillingError::Config("no secret".into()).severity(),
            ErrorSeverity::Critical
        );
        assert_eq!(
            BillingError::WebhookSignatureInvalid.severity(),
            ErrorSeverity::High
        );
        assert_eq!(
            BillingError::MissingLocalSubscription("cus_1".into()).severity(),
            ErrorSeverity::Medium
        );
    }
}
