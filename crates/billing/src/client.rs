//! Stripe client wrapper and configuration

use std::time::Duration;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration loaded once at process start
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Server-held secret API key (never exposed to clients)
    pub secret_key: String,
    /// Webhook signing secret (whsec_...)
    pub webhook_secret: String,
    /// Price id for the Starter tier
    pub price_starter: String,
    /// Price id for the Professional tier
    pub price_professional: String,
    /// Price id for the Agency tier
    pub price_agency: String,
    /// Bound on synchronous outbound Stripe calls made inside webhook handlers
    pub api_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let timeout_secs: u64 = std::env::var("STRIPE_API_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        Ok(Self {
            secret_key,
            webhook_secret,
            price_starter: std::env::var("STRIPE_PRICE_STARTER").unwrap_or_default(),
            price_professional: std::env::var("STRIPE_PRICE_PROFESSIONAL").unwrap_or_default(),
            price_agency: std::env::var("STRIPE_PRICE_AGENCY").unwrap_or_default(),
            api_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Shared Stripe client
///
/// Constructed once at startup and cloned into each service; no global
/// mutable state.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Retrieve a subscription from Stripe, bounded by the configured timeout.
    ///
    /// Timeouts surface as `UpstreamTimeout` so webhook handlers return 5xx
    /// and the processor redelivers.
    pub async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<stripe::Subscription> {
        let parsed: stripe::SubscriptionId = subscription_id.parse().map_err(|e| {
            BillingError::MalformedPayload(format!(
                "invalid subscription id '{}': {}",
                subscription_id, e
            ))
        })?;

        let subscription = tokio::time::timeout(
            self.config.api_timeout,
            stripe::Subscription::retrieve(&self.inner, &parsed, &[]),
        )
        .await
        .map_err(|_| BillingError::UpstreamTimeout)??;

        Ok(subscription)
    }

    /// Retrieve a checkout session from Stripe, bounded by the configured timeout.
    pub async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<stripe::CheckoutSession> {
        let parsed: stripe::CheckoutSessionId = session_id.parse().map_err(|e| {
            BillingError::MalformedPayload(format!("invalid session id '{}': {}", session_id, e))
        })?;

        let session = tokio::time::timeout(
            self.config.api_timeout,
            stripe::CheckoutSession::retrieve(&self.inner, &parsed, &[]),
        )
        .await
        .map_err(|_| BillingError::UpstreamTimeout)??;

        Ok(session)
    }
}
