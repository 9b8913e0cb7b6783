//! Subscription reconciliation
//!
//! Keeps the local `subscriptions` row in sync with the payment processor's
//! authoritative state. Events arrive at-least-once and without ordering
//! guarantees across event types, so every write here is a full-state
//! idempotent upsert keyed by `stripe_customer_id`, and usage counters are
//! never written by this module.

use sqlx::PgPool;
use stripe::{CheckoutSession, Customer, Expandable, Subscription};
use time::OffsetDateTime;
use uuid::Uuid;

use postline_shared::{SubscriptionStatus, SubscriptionTier};

use crate::catalog::TierCatalog;
use crate::client::StripeClient;
use crate::credits::CreditLedger;
use crate::error::{BillingError, BillingResult};

/// Checkout metadata key identifying the purchase kind
pub const METADATA_CHECKOUT_KIND: &str = "checkout_kind";
/// Purchase kind value for one-time AI credit purchases
pub const CHECKOUT_KIND_CREDITS: &str = "credits";

/// Wire fields extracted from an authoritative Stripe subscription object
///
/// Separated from the Stripe types so the upsert derivation is a pure,
/// independently testable function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub user_id: Option<Uuid>,
    pub customer_id: String,
    pub subscription_id: String,
    pub price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

impl SubscriptionSnapshot {
    /// Extract the reconciliation-relevant fields from a Stripe subscription.
    pub fn from_stripe(sub: &Subscription) -> Self {
        let price_id = sub
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        Self {
            user_id: sub
                .metadata
                .get("user_id")
                .and_then(|v| Uuid::parse_str(v).ok()),
            customer_id: expandable_id(&sub.customer),
            subscription_id: sub.id.to_string(),
            price_id,
            status: map_status(sub.status),
            period_start: OffsetDateTime::from_unix_timestamp(sub.current_period_start).ok(),
            period_end: OffsetDateTime::from_unix_timestamp(sub.current_period_end).ok(),
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }
}

/// The planned row state for a subscription upsert
///
/// Usage counters are deliberately absent: the reconciler never writes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpsert {
    pub user_id: Option<Uuid>,
    pub customer_id: String,
    pub subscription_id: String,
    pub price_id: Option<String>,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub max_clients: i32,
    pub max_posts_per_month: i32,
    pub max_ai_credits_per_month: i32,
}

/// Derive the full row state for a snapshot. Pure.
///
/// Tier comes from the price id via the catalog (unknown -> default + warn
/// inside the catalog); limits come from the tier.
pub fn plan_upsert(snapshot: &SubscriptionSnapshot, catalog: &TierCatalog) -> SubscriptionUpsert {
    let tier = snapshot
        .price_id
        .as_deref()
        .map(|p| catalog.resolve_price(p))
        .unwrap_or(crate::catalog::DEFAULT_TIER);
    let limits = catalog.limits(tier);

    SubscriptionUpsert {
        user_id: snapshot.user_id,
        customer_id: snapshot.customer_id.clone(),
        subscription_id: snapshot.subscription_id.clone(),
        price_id: snapshot.price_id.clone(),
        tier,
        status: snapshot.status,
        period_start: snapshot.period_start,
        period_end: snapshot.period_end,
        cancel_at_period_end: snapshot.cancel_at_period_end,
        max_clients: limits.max_clients,
        max_posts_per_month: limits.max_posts_per_month,
        max_ai_credits_per_month: limits.max_ai_credits_per_month,
    }
}

/// Map Stripe's subscription status onto the local lifecycle states.
pub fn map_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    use stripe::SubscriptionStatus as S;
    match status {
        S::Active => SubscriptionStatus::Active,
        S::Trialing => SubscriptionStatus::Trialing,
        S::PastDue | S::Unpaid => SubscriptionStatus::PastDue,
        S::Canceled | S::IncompleteExpired => SubscriptionStatus::Canceled,
        S::Incomplete => SubscriptionStatus::Incomplete,
        _ => SubscriptionStatus::Incomplete,
    }
}

fn expandable_id(customer: &Expandable<Customer>) -> String {
    match customer {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(c) => c.id.to_string(),
    }
}

fn opt_expandable_customer_id(customer: &Option<Expandable<Customer>>) -> Option<String> {
    customer.as_ref().map(expandable_id)
}

/// Subscription reconciler: the write side of the billing engine
pub struct SubscriptionReconciler {
    stripe: StripeClient,
    catalog: TierCatalog,
    pool: PgPool,
}

impl SubscriptionReconciler {
    pub fn new(stripe: StripeClient, catalog: TierCatalog, pool: PgPool) -> Self {
        Self {
            stripe,
            catalog,
            pool,
        }
    }

    /// Handle checkout.session.completed.
    ///
    /// Credit purchases delegate entirely to the credit ledger and never touch
    /// the subscription row. Subscription purchases fetch the authoritative
    /// subscription to resolve the tier immediately; if that fetch fails we
    /// record the link with the default tier and let the next subscription
    /// event correct it.
    pub async fn handle_checkout_completed(&self, session: &CheckoutSession) -> BillingResult<()> {
        let session_id = session.id.to_string();

        let Some(metadata) = session.metadata.as_ref() else {
            tracing::error!(
                session_id = %session_id,
                "Checkout session has no metadata; cannot attribute to a user - dropping"
            );
            return Ok(());
        };

        let Some(user_id) = metadata
            .get("user_id")
            .and_then(|v| Uuid::parse_str(v).ok())
        else {
            tracing::error!(
                session_id = %session_id,
                "Checkout session metadata missing user_id - dropping"
            );
            return Ok(());
        };

        if metadata.get(METADATA_CHECKOUT_KIND).map(String::as_str) == Some(CHECKOUT_KIND_CREDITS)
        {
            // One-time credit purchase: amount comes from trusted metadata set
            // at checkout-creation time, not from client input.
            let credits: i64 = metadata
                .get("credits")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            if credits <= 0 {
                tracing::error!(
                    session_id = %session_id,
                    user_id = %user_id,
                    "Credit purchase checkout missing a positive credits amount - dropping"
                );
                return Ok(());
            }

            let ledger = CreditLedger::new(self.pool.clone());
            ledger
                .add_purchased_credits(user_id, credits, &session_id)
                .await?;
            return Ok(());
        }

        let Some(customer_id) = opt_expandable_customer_id(&session.customer) else {
            tracing::error!(
                session_id = %session_id,
                user_id = %user_id,
                "Checkout session has no customer - dropping"
            );
            return Ok(());
        };

        let subscription_id = session.subscription.as_ref().map(|s| match s {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(sub) => sub.id.to_string(),
        });

        let Some(subscription_id) = subscription_id else {
            tracing::info!(
                session_id = %session_id,
                user_id = %user_id,
                "Checkout session completed without a subscription; nothing to reconcile"
            );
            return Ok(());
        };

        match self.stripe.retrieve_subscription(&subscription_id).await {
            Ok(sub) => {
                let mut snapshot = SubscriptionSnapshot::from_stripe(&sub);
                snapshot.user_id = snapshot.user_id.or(Some(user_id));
                let plan = plan_upsert(&snapshot, &self.catalog);
                self.upsert_subscription(&plan).await?;

                tracing::info!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    subscription_id = %subscription_id,
                    tier = %plan.tier,
                    "Checkout completed, subscription reconciled"
                );
            }
            Err(e) => {
                tracing::warn!(
                    severity = %e.severity(),
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to fetch subscription after checkout; recording default tier until the subscription event arrives"
                );
                self.insert_checkout_fallback(user_id, &customer_id, &subscription_id)
                    .await?;
            }
        }

        Ok(())
    }

    /// Handle customer.subscription.created / customer.subscription.updated.
    ///
    /// Full-overwrite upsert of price, tier, status, period, cancel flag, and
    /// the three limit columns; usage counters are left untouched. Creates
    /// the row when it does not exist yet (the subscription event may arrive
    /// before checkout completion is processed).
    pub async fn handle_subscription_event(&self, sub: &Subscription) -> BillingResult<()> {
        let snapshot = SubscriptionSnapshot::from_stripe(sub);
        let plan = plan_upsert(&snapshot, &self.catalog);

        if plan.user_id.is_some() {
            self.upsert_subscription(&plan).await?;
        } else {
            // Without user_id metadata we can only update an existing row.
            let updated = self.update_subscription_by_customer(&plan).await?;
            if !updated {
                let err = BillingError::MissingLocalSubscription(plan.customer_id.clone());
                tracing::error!(
                    severity = %err.severity(),
                    customer_id = %plan.customer_id,
                    subscription_id = %plan.subscription_id,
                    "Subscription event for unknown customer without user_id metadata - acknowledging"
                );
                return Ok(());
            }
        }

        tracing::info!(
            customer_id = %plan.customer_id,
            subscription_id = %plan.subscription_id,
            tier = %plan.tier,
            status = %plan.status,
            "Subscription reconciled"
        );

        Ok(())
    }

    /// Handle customer.subscription.deleted.
    ///
    /// The row is retained (canceled is a status, not a deletion) so billing
    /// records keep a valid reference.
    pub async fn handle_subscription_deleted(&self, sub: &Subscription) -> BillingResult<()> {
        let customer_id = expandable_id(&sub.customer);

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = 'canceled',
                cancel_at_period_end = FALSE,
                updated_at = NOW()
            WHERE stripe_customer_id = $1
            "#,
        )
        .bind(&customer_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            let err = BillingError::MissingLocalSubscription(customer_id.clone());
            tracing::error!(
                severity = %err.severity(),
                customer_id = %customer_id,
                subscription_id = %sub.id,
                "Subscription deleted for customer with no local row - acknowledging"
            );
            return Ok(());
        }

        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %sub.id,
            "Subscription canceled"
        );

        Ok(())
    }

    /// Fetch the authoritative subscription and re-run the upsert.
    ///
    /// Compensating action used by the entitlement gate's read-path repair.
    pub async fn resync_from_stripe(
        &self,
        subscription_id: &str,
        user_id: Uuid,
    ) -> BillingResult<()> {
        let sub = self.stripe.retrieve_subscription(subscription_id).await?;
        let mut snapshot = SubscriptionSnapshot::from_stripe(&sub);
        snapshot.user_id = snapshot.user_id.or(Some(user_id));
        let plan = plan_upsert(&snapshot, &self.catalog);
        self.upsert_subscription(&plan).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            tier = %plan.tier,
            "Subscription resynced from Stripe"
        );
        Ok(())
    }

    /// Atomic insert-or-update keyed by stripe_customer_id.
    ///
    /// `user_id` is written only on insert; usage counters are never part of
    /// this statement.
    async fn upsert_subscription(&self, plan: &SubscriptionUpsert) -> BillingResult<()> {
        let user_id = plan
            .user_id
            .ok_or_else(|| BillingError::Internal("upsert requires user_id".to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, stripe_customer_id, stripe_subscription_id, stripe_price_id,
                tier, status, current_period_start, current_period_end,
                cancel_at_period_end, max_clients, max_posts_per_month, max_ai_credits_per_month
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (stripe_customer_id) DO UPDATE SET
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                tier = EXCLUDED.tier,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                max_clients = EXCLUDED.max_clients,
                max_posts_per_month = EXCLUDED.max_posts_per_month,
                max_ai_credits_per_month = EXCLUDED.max_ai_credits_per_month,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(&plan.customer_id)
        .bind(&plan.subscription_id)
        .bind(&plan.price_id)
        .bind(plan.tier.as_str())
        .bind(plan.status.as_str())
        .bind(plan.period_start)
        .bind(plan.period_end)
        .bind(plan.cancel_at_period_end)
        .bind(plan.max_clients)
        .bind(plan.max_posts_per_month)
        .bind(plan.max_ai_credits_per_month)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update-only variant for events that cannot create the row.
    async fn update_subscription_by_customer(
        &self,
        plan: &SubscriptionUpsert,
    ) -> BillingResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions SET
                stripe_subscription_id = $1,
                stripe_price_id = $2,
                tier = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                cancel_at_period_end = $7,
                max_clients = $8,
                max_posts_per_month = $9,
                max_ai_credits_per_month = $10,
                updated_at = NOW()
            WHERE stripe_customer_id = $11
            "#,
        )
        .bind(&plan.subscription_id)
        .bind(&plan.price_id)
        .bind(plan.tier.as_str())
        .bind(plan.status.as_str())
        .bind(plan.period_start)
        .bind(plan.period_end)
        .bind(plan.cancel_at_period_end)
        .bind(plan.max_clients)
        .bind(plan.max_posts_per_month)
        .bind(plan.max_ai_credits_per_month)
        .bind(&plan.customer_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Degraded checkout path: record the customer/subscription link with the
    /// default tier. If a subscription event already populated the row, only
    /// the subscription id is filled in; tier and status are not clobbered.
    async fn insert_checkout_fallback(
        &self,
        user_id: Uuid,
        customer_id: &str,
        subscription_id: &str,
    ) -> BillingResult<()> {
        let tier = crate::catalog::DEFAULT_TIER;
        let limits = tier.limits();

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, stripe_customer_id, stripe_subscription_id,
                tier, status, max_clients, max_posts_per_month, max_ai_credits_per_month
            ) VALUES ($1, $2, $3, $4, 'active', $5, $6, $7)
            ON CONFLICT (stripe_customer_id) DO UPDATE SET
                stripe_subscription_id = COALESCE(
                    subscriptions.stripe_subscription_id, EXCLUDED.stripe_subscription_id
                ),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .bind(subscription_id)
        .bind(tier.as_str())
        .bind(limits.max_clients)
        .bind(limits.max_posts_per_month)
        .bind(limits.max_ai_credits_per_month)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StripeConfig;
    use std::time::Duration;

    fn catalog() -> TierCatalog {
        TierCatalog::from_config(&StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: "whsec_x".to_string(),
            price_starter: "price_starter_1".to_string(),
            price_professional: "price_pro_1".to_string(),
            price_agency: "price_agency_1".to_string(),
            api_timeout: Duration::from_secs(10),
        })
    }

    fn snapshot(price_id: Option<&str>) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            user_id: Some(Uuid::new_v4()),
            customer_id: "cus_123".to_string(),
            subscription_id: "sub_123".to_string(),
            price_id: price_id.map(str::to_string),
            status: SubscriptionStatus::Active,
            period_start: OffsetDateTime::from_unix_timestamp(1_700_000_000).ok(),
            period_end: OffsetDateTime::from_unix_timestamp(1_702_600_000).ok(),
            cancel_at_period_end: false,
        }
    }

    #[test]
    fn plan_is_deterministic_for_repeated_events() {
        // Applying the same event twice must yield the same planned state
        let catalog = catalog();
        let snap = snapshot(Some("price_pro_1"));
        let first = plan_upsert(&snap, &catalog);
        let second = plan_upsert(&snap, &catalog);
        assert_eq!(first, second);
    }

    #[test]
    fn plan_resolves_tier_and_limits_from_price() {
        let catalog = catalog();
        let plan = plan_upsert(&snapshot(Some("price_agency_1")), &catalog);
        assert_eq!(plan.tier, SubscriptionTier::Agency);
        assert_eq!(plan.max_clients, -1);
        assert_eq!(plan.max_posts_per_month, -1);
        assert_eq!(plan.max_ai_credits_per_month, 1000);
    }

    #[test]
    fn plan_falls_back_to_default_tier_for_unknown_price() {
        let catalog = catalog();
        let plan = plan_upsert(&snapshot(Some("price_retired_2019")), &catalog);
        assert_eq!(plan.tier, SubscriptionTier::Starter);
        assert_eq!(plan.max_posts_per_month, 30);
    }

    #[test]
    fn plan_without_price_uses_default_tier() {
        let catalog = catalog();
        let plan = plan_upsert(&snapshot(None), &catalog);
        assert_eq!(plan.tier, crate::catalog::DEFAULT_TIER);
        assert!(plan.price_id.is_none());
    }

    #[test]
    fn checkout_and_subscription_events_agree_on_final_state() {
        // Both delivery orders derive the row from the same authoritative
        // subscription object, so tier and status must be identical either way.
        let catalog = catalog();
        let snap = snapshot(Some("price_pro_1"));

        let via_checkout = plan_upsert(&snap, &catalog);
        let via_subscription_event = plan_upsert(&snap, &catalog);

        assert_eq!(via_checkout.tier, via_subscription_event.tier);
        assert_eq!(via_checkout.status, via_subscription_event.status);
        assert_eq!(via_checkout, via_subscription_event);
    }

    #[test]
    fn status_mapping_covers_lifecycle() {
        use stripe::SubscriptionStatus as S;
        assert_eq!(map_status(S::Active), SubscriptionStatus::Active);
        assert_eq!(map_status(S::Trialing), SubscriptionStatus::Trialing);
        assert_eq!(map_status(S::PastDue), SubscriptionStatus::PastDue);
        assert_eq!(map_status(S::Unpaid), SubscriptionStatus::PastDue);
        assert_eq!(map_status(S::Canceled), SubscriptionStatus::Canceled);
        assert_eq!(map_status(S::IncompleteExpired), SubscriptionStatus::Canceled);
        assert_eq!(map_status(S::Incomplete), SubscriptionStatus::Incomplete);
    }
}
