//! Credit ledger
//!
//! Additive counter of purchased one-time AI credits, separate from the
//! monthly tier allotment. The increment is a single atomic upsert at the
//! storage layer; concurrent purchases cannot lose an update. Each checkout
//! session id is claimed exactly once so redelivered checkout events cannot
//! double-credit a user.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Outcome of a credit purchase application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditGrant {
    /// Credits were added
    Applied { credits: i64 },
    /// Session was already processed; balance unchanged
    Duplicate,
}

pub struct CreditLedger {
    pool: PgPool,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add purchased credits for a user, idempotent per checkout session.
    ///
    /// The session claim and the balance increment commit together: a crash
    /// between them cannot leave a session marked processed without credits.
    pub async fn add_purchased_credits(
        &self,
        user_id: Uuid,
        credits: i64,
        session_id: &str,
    ) -> BillingResult<CreditGrant> {
        if credits <= 0 {
            return Err(BillingError::Internal(format!(
                "credit amount must be positive, got {}",
                credits
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        // Claim the session id. ON CONFLICT DO NOTHING means a redelivered
        // event affects zero rows and we skip the increment entirely.
        let claimed = sqlx::query(
            r#"
            INSERT INTO processed_checkout_sessions (stripe_session_id, user_id, credits)
            VALUES ($1, $2, $3)
            ON CONFLICT (stripe_session_id) DO NOTHING
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .bind(credits)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback()
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;

            tracing::info!(
                user_id = %user_id,
                session_id = %session_id,
                "Credit purchase session already processed - skipping"
            );
            return Ok(CreditGrant::Duplicate);
        }

        // Atomic additive upsert; never a read-modify-write in application code.
        sqlx::query(
            r#"
            INSERT INTO credit_balances (user_id, purchased_credits)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET
                purchased_credits = credit_balances.purchased_credits + EXCLUDED.purchased_credits,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(credits)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session_id,
            credits = credits,
            "Purchased credits added"
        );

        Ok(CreditGrant::Applied { credits })
    }

    /// Current purchased-credit balance (0 when no row exists).
    pub async fn purchased_credits(&self, user_id: Uuid) -> BillingResult<i64> {
        let balance: Option<(i64,)> =
            sqlx::query_as("SELECT purchased_credits FROM credit_balances WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(balance.map(|(b,)| b).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_outcomes_are_distinguishable() {
        assert_ne!(CreditGrant::Applied { credits: 100 }, CreditGrant::Duplicate);
        assert_eq!(
            CreditGrant::Applied { credits: 100 },
            CreditGrant::Applied { credits: 100 }
        );
    }
}
