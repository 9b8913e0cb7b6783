//! Webhook event decoding
//!
//! Maps a verified Stripe event envelope onto a closed set of variants before
//! any business logic runs. Unknown event types decode to `Unhandled` (the
//! dispatcher acknowledges them without side effects); a known type carrying
//! the wrong payload object is a contract drift and decodes to an error.

use stripe::{CheckoutSession, Event, EventObject, EventType, Invoice, Subscription};

use crate::error::{BillingError, BillingResult};

/// A decoded billing event
#[derive(Debug)]
pub enum BillingEvent {
    CheckoutCompleted(Box<CheckoutSession>),
    SubscriptionCreatedOrUpdated(Box<Subscription>),
    SubscriptionDeleted(Box<Subscription>),
    InvoicePaid(Box<Invoice>),
    InvoicePaymentFailed(Box<Invoice>),
    TrialWillEnd(Box<Subscription>),
    Unhandled(String),
}

impl BillingEvent {
    /// Decode a verified event envelope.
    ///
    /// Never fails on an unknown event type; fails with `MalformedPayload`
    /// when a known type's payload object does not match.
    pub fn decode(event: Event) -> BillingResult<Self> {
        let event_type = event.type_;
        match event_type {
            EventType::CheckoutSessionCompleted => match event.data.object {
                EventObject::CheckoutSession(session) => {
                    Ok(BillingEvent::CheckoutCompleted(Box::new(session)))
                }
                other => Err(malformed(event_type, &other)),
            },
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                match event.data.object {
                    EventObject::Subscription(sub) => {
                        Ok(BillingEvent::SubscriptionCreatedOrUpdated(Box::new(sub)))
                    }
                    other => Err(malformed(event_type, &other)),
                }
            }
            EventType::CustomerSubscriptionDeleted => match event.data.object {
                EventObject::Subscription(sub) => {
                    Ok(BillingEvent::SubscriptionDeleted(Box::new(sub)))
                }
                other => Err(malformed(event_type, &other)),
            },
            EventType::CustomerSubscriptionTrialWillEnd => match event.data.object {
                EventObject::Subscription(sub) => Ok(BillingEvent::TrialWillEnd(Box::new(sub))),
                other => Err(malformed(event_type, &other)),
            },
            EventType::InvoicePaid => match event.data.object {
                EventObject::Invoice(invoice) => Ok(BillingEvent::InvoicePaid(Box::new(invoice))),
                other => Err(malformed(event_type, &other)),
            },
            EventType::InvoicePaymentFailed => match event.data.object {
                EventObject::Invoice(invoice) => {
                    Ok(BillingEvent::InvoicePaymentFailed(Box::new(invoice)))
                }
                other => Err(malformed(event_type, &other)),
            },
            other => Ok(BillingEvent::Unhandled(other.to_string())),
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &str {
        match self {
            BillingEvent::CheckoutCompleted(_) => "checkout_completed",
            BillingEvent::SubscriptionCreatedOrUpdated(_) => "subscription_created_or_updated",
            BillingEvent::SubscriptionDeleted(_) => "subscription_deleted",
            BillingEvent::InvoicePaid(_) => "invoice_paid",
            BillingEvent::InvoicePaymentFailed(_) => "invoice_payment_failed",
            BillingEvent::TrialWillEnd(_) => "trial_will_end",
            BillingEvent::Unhandled(ty) => ty,
        }
    }
}

fn malformed(event_type: EventType, object: &EventObject) -> BillingError {
    BillingError::MalformedPayload(format!(
        "event type '{}' carried unexpected object {:?}",
        event_type,
        std::mem::discriminant(object)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal event envelope as Stripe delivers it over the wire.
    fn event(event_type: &str, object_json: &str) -> Event {
        let payload = format!(
            r#"{{
                "id": "evt_test_1",
                "object": "event",
                "api_version": "2024-04-10",
                "created": 1700000000,
                "data": {{ "object": {object_json} }},
                "livemode": false,
                "pending_webhooks": 1,
                "request": null,
                "type": "{event_type}"
            }}"#
        );
        serde_json::from_str(&payload).unwrap()
    }

    #[test]
    fn known_types_decode_to_their_variants() {
        let decoded = BillingEvent::decode(event(
            "invoice.paid",
            r#"{"object": "invoice", "id": "in_test_1"}"#,
        ))
        .unwrap();
        assert!(matches!(decoded, BillingEvent::InvoicePaid(_)));

        let decoded = BillingEvent::decode(event(
            "invoice.payment_failed",
            r#"{"object": "invoice", "id": "in_test_1"}"#,
        ))
        .unwrap();
        assert!(matches!(decoded, BillingEvent::InvoicePaymentFailed(_)));
    }

    #[test]
    fn unrecognized_type_decodes_to_unhandled() {
        // Types with no handler acknowledge without side effects; decoding
        // must never fail on them.
        let decoded = BillingEvent::decode(event(
            "customer.created",
            r#"{"object": "customer", "id": "cus_test_1"}"#,
        ))
        .unwrap();

        match decoded {
            BillingEvent::Unhandled(ty) => assert_eq!(ty, "customer.created"),
            other => panic!("expected Unhandled, got {}", other.kind()),
        }
    }

    #[test]
    fn known_type_with_wrong_object_is_malformed() {
        // A known type whose payload carries the wrong object is contract
        // drift and must propagate as an error, not be silently ignored.
        let result = BillingEvent::decode(event(
            "invoice.paid",
            r#"{"object": "customer", "id": "cus_test_1"}"#,
        ));
        assert!(matches!(result, Err(BillingError::MalformedPayload(_))));

        let result = BillingEvent::decode(event(
            "customer.subscription.updated",
            r#"{"object": "invoice", "id": "in_test_1"}"#,
        ));
        assert!(matches!(result, Err(BillingError::MalformedPayload(_))));
    }
}
