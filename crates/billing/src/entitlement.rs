//! Entitlement gate
//!
//! Read-side API answering "is operation X permitted for user Y" from the
//! reconciled subscription state. This is the only surface the rest of the
//! application talks to; nothing outside the billing crate touches the
//! reconciliation path.
//!
//! Checks fail closed: if the subscription row cannot be read or repaired,
//! the answer is denied, never allowed.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use postline_shared::{SubscriptionStatus, SubscriptionTier};

use crate::catalog::TierCatalog;
use crate::client::StripeClient;
use crate::error::BillingResult;
use crate::reconciler::SubscriptionReconciler;

/// The reconciled subscription row as read by the gate
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub tier: String,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub max_clients: i32,
    pub max_posts_per_month: i32,
    pub max_ai_credits_per_month: i32,
    pub clients_used: i32,
    pub posts_used_this_month: i32,
    pub ai_credits_used_this_month: i32,
    /// From credit_balances; 0 when the user never purchased credits
    pub purchased_credits: i64,
}

impl SubscriptionRecord {
    pub fn tier(&self) -> SubscriptionTier {
        SubscriptionTier::parse(&self.tier)
    }

    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::parse(&self.status)
    }

    /// Remaining AI credit capacity: monthly allotment + purchased - used.
    /// An allotment of -1 means unlimited.
    pub fn remaining_credits(&self) -> i64 {
        if self.max_ai_credits_per_month == -1 {
            return i64::MAX;
        }
        i64::from(self.max_ai_credits_per_month) + self.purchased_credits
            - i64::from(self.ai_credits_used_this_month)
    }

    /// A non-null subscription id with a null price id means a prior
    /// reconciliation only partially completed.
    pub fn needs_repair(&self) -> bool {
        self.stripe_subscription_id.is_some() && self.stripe_price_id.is_none()
    }
}

/// Outcome of a permission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum EntitlementDecision {
    Allowed,
    Denied { reason: DenialReason },
}

impl EntitlementDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, EntitlementDecision::Allowed)
    }

    fn denied(reason: DenialReason) -> Self {
        EntitlementDecision::Denied { reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoSubscription,
    SubscriptionInactive,
    PostLimitReached,
    ClientLimitReached,
    InsufficientCredits,
    /// Row could not be read or repaired; fail closed
    Unavailable,
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DenialReason::NoSubscription => "no subscription",
            DenialReason::SubscriptionInactive => "subscription is not active",
            DenialReason::PostLimitReached => "monthly post limit reached",
            DenialReason::ClientLimitReached => "client limit reached",
            DenialReason::InsufficientCredits => "insufficient AI credits",
            DenialReason::Unavailable => "entitlement state unavailable",
        };
        write!(f, "{}", s)
    }
}

/// Whether the user may schedule another post. Pure.
pub fn decide_post(record: &SubscriptionRecord) -> EntitlementDecision {
    if !record.status().is_usable() {
        return EntitlementDecision::denied(DenialReason::SubscriptionInactive);
    }
    if record.max_posts_per_month != -1
        && record.posts_used_this_month >= record.max_posts_per_month
    {
        return EntitlementDecision::denied(DenialReason::PostLimitReached);
    }
    EntitlementDecision::Allowed
}

/// Whether the user may add another managed client. Pure.
pub fn decide_add_client(record: &SubscriptionRecord) -> EntitlementDecision {
    if record.max_clients != -1 && record.clients_used >= record.max_clients {
        return EntitlementDecision::denied(DenialReason::ClientLimitReached);
    }
    EntitlementDecision::Allowed
}

/// Whether the user may consume `n` AI credits. Pure.
pub fn decide_consume_credits(record: &SubscriptionRecord, n: i64) -> EntitlementDecision {
    if record.remaining_credits() < n {
        return EntitlementDecision::denied(DenialReason::InsufficientCredits);
    }
    EntitlementDecision::Allowed
}

/// The entitlement gate service
pub struct EntitlementGate {
    stripe: StripeClient,
    catalog: TierCatalog,
    pool: PgPool,
}

impl EntitlementGate {
    pub fn new(stripe: StripeClient, catalog: TierCatalog, pool: PgPool) -> Self {
        Self {
            stripe,
            catalog,
            pool,
        }
    }

    /// Load a user's reconciled subscription, repairing a partially
    /// reconciled row first (see `repair_subscription`).
    pub async fn get_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let Some(record) = self.load(user_id).await? else {
            return Ok(None);
        };

        if record.needs_repair() {
            self.repair_subscription(&record).await?;
            return self.load(user_id).await;
        }

        Ok(Some(record))
    }

    pub async fn can_post(&self, user_id: Uuid) -> EntitlementDecision {
        self.check(user_id, decide_post).await
    }

    pub async fn can_add_client(&self, user_id: Uuid) -> EntitlementDecision {
        self.check(user_id, decide_add_client).await
    }

    pub async fn can_consume_credits(&self, user_id: Uuid, n: i64) -> EntitlementDecision {
        self.check(user_id, |record| decide_consume_credits(record, n))
            .await
    }

    async fn check<F>(&self, user_id: Uuid, decide: F) -> EntitlementDecision
    where
        F: FnOnce(&SubscriptionRecord) -> EntitlementDecision,
    {
        match self.get_subscription(user_id).await {
            Ok(Some(record)) => decide(&record),
            Ok(None) => EntitlementDecision::denied(DenialReason::NoSubscription),
            Err(e) => {
                tracing::error!(
                    severity = %e.severity(),
                    user_id = %user_id,
                    error = %e,
                    "Entitlement check could not read subscription state - denying"
                );
                EntitlementDecision::denied(DenialReason::Unavailable)
            }
        }
    }

    /// Compensating action for a partially completed reconciliation: re-fetch
    /// the authoritative subscription and re-run the reconciler upsert before
    /// answering the permission check.
    async fn repair_subscription(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let subscription_id = match record.stripe_subscription_id.as_deref() {
            Some(id) => id,
            None => return Ok(()),
        };

        tracing::warn!(
            user_id = %record.user_id,
            subscription_id = %subscription_id,
            "Subscription row missing price id - repairing from Stripe"
        );

        let reconciler = SubscriptionReconciler::new(
            self.stripe.clone(),
            self.catalog.clone(),
            self.pool.clone(),
        );
        reconciler
            .resync_from_stripe(subscription_id, record.user_id)
            .await
    }

    async fn load(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT s.user_id, s.stripe_customer_id, s.stripe_subscription_id,
                   s.stripe_price_id, s.tier, s.status,
                   s.current_period_start, s.current_period_end,
                   s.cancel_at_period_end, s.max_clients, s.max_posts_per_month,
                   s.max_ai_credits_per_month, s.clients_used,
                   s.posts_used_this_month, s.ai_credits_used_this_month,
                   COALESCE(c.purchased_credits, 0) AS purchased_credits
            FROM subscriptions s
            LEFT JOIN credit_balances c ON c.user_id = s.user_id
            WHERE s.user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: Uuid::new_v4(),
            stripe_customer_id: "cus_123".to_string(),
            stripe_subscription_id: Some("sub_123".to_string()),
            stripe_price_id: Some("price_pro_1".to_string()),
            tier: "professional".to_string(),
            status: "active".to_string(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            max_clients: 10,
            max_posts_per_month: 150,
            max_ai_credits_per_month: 250,
            clients_used: 0,
            posts_used_this_month: 0,
            ai_credits_used_this_month: 0,
            purchased_credits: 0,
        }
    }

    #[test]
    fn post_allowed_under_limit() {
        let mut r = record();
        r.max_posts_per_month = 10;
        r.posts_used_this_month = 9;
        assert!(decide_post(&r).is_allowed());
    }

    #[test]
    fn post_denied_at_exact_limit() {
        let mut r = record();
        r.max_posts_per_month = 10;
        r.posts_used_this_month = 10;
        assert_eq!(
            decide_post(&r),
            EntitlementDecision::Denied {
                reason: DenialReason::PostLimitReached
            }
        );
    }

    #[test]
    fn unlimited_posts_always_allowed() {
        let mut r = record();
        r.max_posts_per_month = -1;
        r.posts_used_this_month = 1_000_000;
        assert!(decide_post(&r).is_allowed());
    }

    #[test]
    fn post_denied_when_not_active_or_trialing() {
        for status in ["incomplete", "past_due", "canceled"] {
            let mut r = record();
            r.status = status.to_string();
            assert_eq!(
                decide_post(&r),
                EntitlementDecision::Denied {
                    reason: DenialReason::SubscriptionInactive
                },
                "status {} should deny posting",
                status
            );
        }
    }

    #[test]
    fn trialing_may_post() {
        let mut r = record();
        r.status = "trialing".to_string();
        assert!(decide_post(&r).is_allowed());
    }

    #[test]
    fn client_limit_boundary() {
        let mut r = record();
        r.max_clients = 3;
        r.clients_used = 2;
        assert!(decide_add_client(&r).is_allowed());

        r.clients_used = 3;
        assert_eq!(
            decide_add_client(&r),
            EntitlementDecision::Denied {
                reason: DenialReason::ClientLimitReached
            }
        );
    }

    #[test]
    fn unlimited_clients_always_allowed() {
        let mut r = record();
        r.max_clients = -1;
        r.clients_used = 50_000;
        assert!(decide_add_client(&r).is_allowed());
    }

    #[test]
    fn remaining_credits_includes_purchased_capacity() {
        let mut r = record();
        r.max_ai_credits_per_month = 50;
        r.purchased_credits = 100;
        r.ai_credits_used_this_month = 30;
        assert_eq!(r.remaining_credits(), 120);
        assert!(decide_consume_credits(&r, 120).is_allowed());
        assert_eq!(
            decide_consume_credits(&r, 121),
            EntitlementDecision::Denied {
                reason: DenialReason::InsufficientCredits
            }
        );
    }

    #[test]
    fn purchased_credits_are_additive() {
        // Two purchases extend capacity by their sum, they never reset it
        let mut r = record();
        r.max_ai_credits_per_month = 50;
        r.purchased_credits = 0;
        let base = r.remaining_credits();

        r.purchased_credits += 100;
        r.purchased_credits += 50;
        assert_eq!(r.remaining_credits(), base + 150);
    }

    #[test]
    fn unlimited_allotment_never_runs_out() {
        let mut r = record();
        r.max_ai_credits_per_month = -1;
        r.ai_credits_used_this_month = i32::MAX;
        assert!(decide_consume_credits(&r, 1_000_000).is_allowed());
    }

    #[test]
    fn partial_reconciliation_is_detected() {
        let mut r = record();
        assert!(!r.needs_repair());

        r.stripe_price_id = None;
        assert!(r.needs_repair());

        r.stripe_subscription_id = None;
        assert!(!r.needs_repair(), "no subscription id means nothing to repair");
    }
}
