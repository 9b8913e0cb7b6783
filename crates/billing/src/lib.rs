// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Postline Billing Module
//!
//! Subscription and billing reconciliation against Stripe.
//!
//! ## Features
//!
//! - **Webhooks**: signature verification and typed event dispatch
//! - **Reconciliation**: idempotent, order-independent subscription upserts
//! - **Credit Ledger**: additive purchased AI credits with per-session dedup
//! - **Billing History**: append-only paid-invoice records
//! - **Entitlement Gate**: read-side permission checks with self-repair
//! - **Usage Metering**: atomic usage-counter increments and monthly reset

pub mod catalog;
pub mod client;
pub mod credits;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod history;
pub mod reconciler;
pub mod usage;
pub mod webhooks;

// Catalog
pub use catalog::{TierCatalog, DEFAULT_TIER};

// Client
pub use client::{StripeClient, StripeConfig};

// Credits
pub use credits::{CreditGrant, CreditLedger};

// Entitlement
pub use entitlement::{
    DenialReason, EntitlementDecision, EntitlementGate, SubscriptionRecord,
};

// Error
pub use error::{BillingError, BillingResult, ErrorSeverity};

// Events
pub use events::BillingEvent;

// History
pub use history::{BillingHistoryRecorder, BillingRecord};

// Reconciler
pub use reconciler::{SubscriptionReconciler, SubscriptionSnapshot, SubscriptionUpsert};

// Usage
pub use usage::UsageMeter;

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub credits: CreditLedger,
    pub entitlements: EntitlementGate,
    pub history: BillingHistoryRecorder,
    pub reconciler: SubscriptionReconciler,
    pub usage: UsageMeter,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        let catalog = TierCatalog::from_config(stripe.config());

        Self {
            credits: CreditLedger::new(pool.clone()),
            entitlements: EntitlementGate::new(stripe.clone(), catalog.clone(), pool.clone()),
            history: BillingHistoryRecorder::new(pool.clone()),
            reconciler: SubscriptionReconciler::new(stripe.clone(), catalog.clone(), pool.clone()),
            usage: UsageMeter::new(pool.clone()),
            webhooks: WebhookHandler::new(stripe, catalog, pool),
        }
    }
}
