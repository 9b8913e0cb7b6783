//! Stripe webhook handling
//!
//! Signature verification runs against the raw request bytes before any JSON
//! parsing; a tampered payload is rejected without being decoded. Verified
//! events are decoded into a closed variant set and dispatched to the
//! reconciler, credit ledger, or billing history recorder.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, Webhook};

use crate::catalog::TierCatalog;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::history::BillingHistoryRecorder;
use crate::reconciler::SubscriptionReconciler;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamps older than this are rejected
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    catalog: TierCatalog,
    pool: PgPool,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, catalog: TierCatalog, pool: PgPool) -> Self {
        Self {
            stripe,
            catalog,
            pool,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Uses manual signature verification as a fallback to work around
    /// async-stripe version incompatibility with newer Stripe API versions.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!("System time error: {}", e);
                BillingError::WebhookSignatureInvalid
            })?
            .as_secs() as i64;

        verify_signature(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            let err = BillingError::MalformedPayload(format!("event JSON did not parse: {}", e));
            tracing::error!(severity = %err.severity(), parse_error = %e, "Failed to parse webhook event JSON");
            err
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification passed"
        );

        Ok(event)
    }

    /// Decode and dispatch a verified event.
    ///
    /// Unhandled types and trial notices acknowledge without side effects.
    /// Transient failures propagate so the caller returns 5xx and the
    /// processor redelivers; every write a handler commits before failing is
    /// an individually valid idempotent upsert.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let decoded = BillingEvent::decode(event).map_err(|e| {
            tracing::error!(
                severity = %e.severity(),
                event_id = %event_id,
                error = %e,
                "Webhook payload malformed for a known event type"
            );
            e
        })?;

        tracing::info!(
            event_id = %event_id,
            event_kind = %decoded.kind(),
            "Processing Stripe webhook event"
        );

        let reconciler = SubscriptionReconciler::new(
            self.stripe.clone(),
            self.catalog.clone(),
            self.pool.clone(),
        );
        let history = BillingHistoryRecorder::new(self.pool.clone());

        match decoded {
            BillingEvent::CheckoutCompleted(session) => {
                reconciler.handle_checkout_completed(&session).await?;
            }
            BillingEvent::SubscriptionCreatedOrUpdated(sub) => {
                reconciler.handle_subscription_event(&sub).await?;
            }
            BillingEvent::SubscriptionDeleted(sub) => {
                reconciler.handle_subscription_deleted(&sub).await?;
            }
            BillingEvent::InvoicePaid(invoice) => {
                history.record_invoice_paid(&invoice).await?;
            }
            BillingEvent::InvoicePaymentFailed(invoice) => {
                history.record_invoice_payment_failed(&invoice).await?;
            }
            BillingEvent::TrialWillEnd(sub) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    trial_end = ?sub.trial_end,
                    "Trial period ending soon"
                );
            }
            BillingEvent::Unhandled(event_type) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }
}

/// Parse the `t=timestamp,v1=signature` header format.
fn parse_signature_header(signature: &str) -> BillingResult<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    Ok((timestamp, v1_signature))
}

/// Manual HMAC-SHA256 verification of the signed payload.
fn verify_signature(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now: i64,
) -> BillingResult<()> {
    let (timestamp, v1_signature) = parse_signature_header(signature)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The secret starts with "whsec_"; the remainder is the signing key
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_signing_key";

    fn sign(payload: &str, timestamp: i64) -> String {
        let key = SECRET.strip_prefix("whsec_").unwrap();
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn valid_signature_passes() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now);
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let payload = r#"{"id":"evt_1","amount":100}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now);

        let tampered = r#"{"id":"evt_1","amount":99999}"#;
        assert!(matches!(
            verify_signature(tampered, &header, SECRET, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = sign(payload, signed_at);

        // 301 seconds later: outside tolerance
        assert!(matches!(
            verify_signature(payload, &header, SECRET, signed_at + 301),
            Err(BillingError::WebhookSignatureInvalid)
        ));

        // 300 seconds: at the boundary, still accepted
        assert!(verify_signature(payload, &header, SECRET, signed_at + 300).is_ok());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign(payload, now);
        assert!(matches!(
            verify_signature(payload, &header, "whsec_other_key", now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn header_without_required_parts_is_rejected() {
        assert!(parse_signature_header("v1=abcdef").is_err());
        assert!(parse_signature_header("").is_err());
        assert!(parse_signature_header("t=123").is_err());
        assert!(parse_signature_header("t=123,v1=abc").is_ok());
    }
}
