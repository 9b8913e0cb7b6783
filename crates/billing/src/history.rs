//! Billing history
//!
//! Append-only record of paid invoices, unique per Stripe invoice id
//! regardless of redelivery. Failed invoice attempts do not produce a record;
//! they move the subscription to past_due instead.

use serde::Serialize;
use sqlx::PgPool;
use stripe::{Customer, Expandable, Invoice};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A recorded paid invoice
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingRecord {
    pub stripe_invoice_id: String,
    pub user_id: Uuid,
    pub stripe_customer_id: String,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub status: String,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub paid_at: Option<OffsetDateTime>,
}

const INSERT_PAID_INVOICE: &str = r#"
    INSERT INTO billing_records (
        stripe_invoice_id, user_id, stripe_customer_id,
        amount_paid_cents, currency, status,
        period_start, period_end, paid_at
    ) VALUES ($1, $2, $3, $4, $5, 'paid', $6, $7, $8)
    ON CONFLICT (stripe_invoice_id) DO NOTHING
"#;

// Guarded by the current status alone, so it is safe to run on a
// redelivered event whose billing record already exists.
const CLEAR_PAST_DUE_ON_PAYMENT: &str = r#"
    UPDATE subscriptions SET status = 'active', updated_at = NOW()
    WHERE stripe_customer_id = $1 AND status = 'past_due'
"#;

pub struct BillingHistoryRecorder {
    pool: PgPool,
}

impl BillingHistoryRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Record a paid invoice. Idempotent against redelivery: at most one row
    /// per invoice id.
    pub async fn record_invoice_paid(&self, invoice: &Invoice) -> BillingResult<()> {
        let invoice_id = invoice.id.to_string();

        let Some(customer_id) = customer_id(&invoice.customer) else {
            tracing::error!(
                invoice_id = %invoice_id,
                "Paid invoice has no customer - acknowledging without a record"
            );
            return Ok(());
        };

        let Some(user_id) = self.user_for_customer(&customer_id).await? else {
            let err = BillingError::MissingLocalSubscription(customer_id.clone());
            tracing::error!(
                severity = %err.severity(),
                invoice_id = %invoice_id,
                customer_id = %customer_id,
                "Paid invoice for customer with no local subscription - acknowledging"
            );
            return Ok(());
        };

        let period_start = invoice
            .period_start
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
        let period_end = invoice
            .period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
        // The invoice's own payment time; delivery time only as a fallback.
        let paid_at = invoice_paid_at(invoice).unwrap_or_else(OffsetDateTime::now_utc);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let appended = sqlx::query(INSERT_PAID_INVOICE)
            .bind(&invoice_id)
            .bind(user_id)
            .bind(&customer_id)
            .bind(invoice.amount_paid.unwrap_or(0))
            .bind(
                invoice
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "usd".to_string()),
            )
            .bind(period_start)
            .bind(period_end)
            .bind(paid_at)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        // A paid renewal invoice also clears past_due. This runs on
        // redelivery too: an earlier delivery may have committed the record
        // and then failed before the transition.
        sqlx::query(CLEAR_PAST_DUE_ON_PAYMENT)
            .bind(&customer_id)
            .execute(&mut *tx)
            .await?;

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        if appended {
            tracing::info!(
                invoice_id = %invoice_id,
                user_id = %user_id,
                amount_paid = invoice.amount_paid.unwrap_or(0),
                "Invoice paid"
            );
        } else {
            tracing::info!(
                invoice_id = %invoice_id,
                user_id = %user_id,
                "Invoice already recorded - redelivery acknowledged"
            );
        }

        Ok(())
    }

    /// Record a failed invoice payment: no billing record is appended; the
    /// subscription transitions to past_due. Canceled is terminal and is
    /// never moved back.
    pub async fn record_invoice_payment_failed(&self, invoice: &Invoice) -> BillingResult<()> {
        let invoice_id = invoice.id.to_string();

        let Some(customer_id) = customer_id(&invoice.customer) else {
            tracing::error!(
                invoice_id = %invoice_id,
                "Failed invoice has no customer - acknowledging"
            );
            return Ok(());
        };

        let rows = sqlx::query(
            r#"
            UPDATE subscriptions SET status = 'past_due', updated_at = NOW()
            WHERE stripe_customer_id = $1 AND status != 'canceled'
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
                invoice_id = %invoice_id,
                customer_id = %customer_id,
                "Invoice payment failed for customer with no reconcilable subscription - acknowledging"
            );
            return Ok(());
        }

        tracing::warn!(
            invoice_id = %invoice_id,
            customer_id = %customer_id,
            amount_due = invoice.amount_due.unwrap_or(0),
            "Invoice payment failed, subscription marked past_due"
        );

        Ok(())
    }

    /// Billing history page for a user, newest first.
    pub async fn list_records(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingRecord>> {
        let records = sqlx::query_as::<_, BillingRecord>(
            r#"
            SELECT stripe_invoice_id, user_id, stripe_customer_id,
                   amount_paid_cents, currency, status,
                   period_start, period_end, paid_at
            FROM billing_records
            WHERE user_id = $1
            ORDER BY paid_at DESC NULLS LAST
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM subscriptions WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id,)| id))
    }
}

fn customer_id(customer: &Option<Expandable<Customer>>) -> Option<String> {
    match customer {
        Some(Expandable::Id(id)) => Some(id.to_string()),
        Some(Expandable::Object(c)) => Some(c.id.to_string()),
        None => None,
    }
}

/// The timestamp at which the invoice itself was paid, when Stripe reported
/// one. Redelivered events carry the original payment time, not delivery time.
fn invoice_paid_at(invoice: &Invoice) -> Option<OffsetDateTime> {
    invoice
        .status_transitions
        .as_ref()
        .and_then(|transitions| transitions.paid_at)
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paid_at_comes_from_the_invoice_not_delivery_time() {
        let invoice: Invoice = serde_json::from_str(
            r#"{"id":"in_test_1","status_transitions":{"paid_at":1700000000}}"#,
        )
        .unwrap();

        let paid_at = invoice_paid_at(&invoice).unwrap();
        assert_eq!(paid_at.unix_timestamp(), 1_700_000_000);
    }

    #[test]
    fn missing_payment_timestamp_yields_none() {
        let invoice: Invoice = serde_json::from_str(r#"{"id":"in_test_1"}"#).unwrap();
        assert!(invoice_paid_at(&invoice).is_none());

        let invoice: Invoice =
            serde_json::from_str(r#"{"id":"in_test_1","status_transitions":{}}"#).unwrap();
        assert!(invoice_paid_at(&invoice).is_none());
    }

    #[test]
    fn past_due_clear_depends_only_on_subscription_state() {
        // The transition must be safe to run for a redelivered event whose
        // billing record already exists: a prior delivery may have committed
        // the record and failed before this statement ran. It is therefore
        // guarded by the current status alone.
        assert!(CLEAR_PAST_DUE_ON_PAYMENT.contains("status = 'past_due'"));
        assert!(!CLEAR_PAST_DUE_ON_PAYMENT.contains("billing_records"));
    }

    #[test]
    fn paid_invoice_record_is_unique_per_invoice_id() {
        assert!(INSERT_PAID_INVOICE.contains("ON CONFLICT (stripe_invoice_id) DO NOTHING"));
    }
}
