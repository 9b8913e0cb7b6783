//! Usage counters
//!
//! The only writers of `clients_used`, `posts_used_this_month`, and
//! `ai_credits_used_this_month`. Every mutation is a single-statement atomic
//! increment at the storage layer; the reconciliation handlers never touch
//! these columns.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

pub struct UsageMeter {
    pool: PgPool,
}

impl UsageMeter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Count a published/scheduled post against the monthly quota.
    pub async fn record_post(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET posts_used_this_month = posts_used_this_month + 1, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Count a newly added managed client.
    pub async fn record_client_added(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET clients_used = clients_used + 1, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Release a client slot when a client is removed. Never goes negative.
    pub async fn record_client_removed(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET clients_used = GREATEST(clients_used - 1, 0), updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Consume `n` AI credits, guarded in SQL against exceeding remaining
    /// capacity (monthly allotment + purchased balance). Returns false when
    /// capacity was insufficient and nothing was consumed.
    pub async fn consume_ai_credits(&self, user_id: Uuid, n: i64) -> BillingResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions s
            SET ai_credits_used_this_month = ai_credits_used_this_month + $2,
                updated_at = NOW()
            FROM (SELECT $1::uuid AS uid) target
            LEFT JOIN credit_balances c ON c.user_id = target.uid
            WHERE s.user_id = target.uid
              AND (
                s.max_ai_credits_per_month = -1
                OR s.max_ai_credits_per_month::bigint + COALESCE(c.purchased_credits, 0)
                   - s.ai_credits_used_this_month >= $2
              )
            "#,
        )
        .bind(user_id)
        .bind(n)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Zero the monthly counters for every subscription.
    ///
    /// Run by the worker on the first of each month. Purchased credits are a
    /// separate additive balance and are not reset.
    pub async fn reset_monthly_usage(&self) -> BillingResult<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET posts_used_this_month = 0,
                ai_credits_used_this_month = 0,
                updated_at = NOW()
            WHERE posts_used_this_month > 0 OR ai_credits_used_this_month > 0
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        tracing::info!(rows = rows, "Monthly usage counters reset");
        Ok(rows)
    }
}
