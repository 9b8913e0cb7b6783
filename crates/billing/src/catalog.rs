//! Tier and limits catalog
//!
//! Immutable mapping from Stripe price id to subscription tier, built from
//! configuration at process start. The reverse direction (tier -> limits)
//! lives on `SubscriptionTier` in the shared crate.

use postline_shared::{SubscriptionTier, TierLimits};

use crate::client::StripeConfig;

/// Default tier used when a price id cannot be resolved.
///
/// The next subscription-updated event (or the read-path repair) corrects the
/// record once the price becomes resolvable.
pub const DEFAULT_TIER: SubscriptionTier = SubscriptionTier::Starter;

#[derive(Debug, Clone)]
pub struct TierCatalog {
    price_starter: String,
    price_professional: String,
    price_agency: String,
}

impl TierCatalog {
    pub fn from_config(config: &StripeConfig) -> Self {
        Self {
            price_starter: config.price_starter.clone(),
            price_professional: config.price_professional.clone(),
            price_agency: config.price_agency.clone(),
        }
    }

    /// Resolve a price id to a tier.
    ///
    /// Total: an unknown price id resolves to `DEFAULT_TIER` with a warning,
    /// never an error. Reconciliation must not stall on a price the catalog
    /// has not seen.
    pub fn resolve_price(&self, price_id: &str) -> SubscriptionTier {
        if !price_id.is_empty() {
            if price_id == self.price_starter {
                return SubscriptionTier::Starter;
            }
            if price_id == self.price_professional {
                return SubscriptionTier::Professional;
            }
            if price_id == self.price_agency {
                return SubscriptionTier::Agency;
            }
        }

        tracing::warn!(
            price_id = %price_id,
            default_tier = %DEFAULT_TIER,
            "Unknown price id, falling back to default tier"
        );
        DEFAULT_TIER
    }

    pub fn limits(&self, tier: SubscriptionTier) -> TierLimits {
        tier.limits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[test]
    fn every_configured_price_resolves_to_exactly_one_tier() {
        let catalog = catalog();
        assert_eq!(
            catalog.resolve_price("price_starter_1"),
            SubscriptionTier::Starter
        );
        assert_eq!(
            catalog.resolve_price("price_pro_1"),
            SubscriptionTier::Professional
        );
        assert_eq!(
            catalog.resolve_price("price_agency_1"),
            SubscriptionTier::Agency
        );
    }

    #[test]
    fn unknown_price_falls_back_to_default_tier() {
        let catalog = catalog();
        assert_eq!(catalog.resolve_price("price_nonexistent"), DEFAULT_TIER);
        assert_eq!(catalog.resolve_price(""), DEFAULT_TIER);
    }

    #[test]
    fn empty_configured_price_never_matches() {
        // A half-configured environment (missing price vars) must not make
        // an empty incoming price id resolve to a paid tier.
        let catalog = TierCatalog::from_config(&StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: "whsec_x".to_string(),
            price_starter: String::new(),
            price_professional: String::new(),
            price_agency: "price_agency_1".to_string(),
            api_timeout: Duration::from_secs(10),
        });
        assert_eq!(catalog.resolve_price(""), DEFAULT_TIER);
    }

    #[test]
    fn limits_come_from_tier() {
        let catalog = catalog();
        let limits = catalog.limits(SubscriptionTier::Professional);
        assert_eq!(limits.max_clients, 10);
        assert_eq!(limits.max_posts_per_month, 150);
        assert_eq!(limits.max_ai_credits_per_month, 250);
    }
}
