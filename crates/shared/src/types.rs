//! Common types used across Postline

use serde::{Deserialize, Serialize};

/// Subscription tier names
///
/// Tiers bound monthly resource usage for an account. The catalog in the
/// billing crate maps Stripe price IDs onto these names at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Starter,
    Professional,
    Agency,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Starter => "starter",
            SubscriptionTier::Professional => "professional",
            SubscriptionTier::Agency => "agency",
        }
    }

    /// Parse a tier name; unknown names map to Starter so that a bad value in
    /// the database can never block entitlement reads.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "professional" => SubscriptionTier::Professional,
            "agency" => SubscriptionTier::Agency,
            _ => SubscriptionTier::Starter,
        }
    }

    /// Maximum managed clients (-1 = unlimited)
    pub fn max_clients(&self) -> i32 {
        match self {
            SubscriptionTier::Starter => 3,
            SubscriptionTier::Professional => 10,
            SubscriptionTier::Agency => -1,
        }
    }

    /// Maximum scheduled posts per month (-1 = unlimited)
    pub fn max_posts_per_month(&self) -> i32 {
        match self {
            SubscriptionTier::Starter => 30,
            SubscriptionTier::Professional => 150,
            SubscriptionTier::Agency => -1,
        }
    }

    /// Monthly AI credit allotment (-1 = unlimited)
    pub fn max_ai_credits_per_month(&self) -> i32 {
        match self {
            SubscriptionTier::Starter => 50,
            SubscriptionTier::Professional => 250,
            SubscriptionTier::Agency => 1000,
        }
    }

    pub fn limits(&self) -> TierLimits {
        TierLimits {
            max_clients: self.max_clients(),
            max_posts_per_month: self.max_posts_per_month(),
            max_ai_credits_per_month: self.max_ai_credits_per_month(),
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Numeric entitlement limits for a tier (-1 = unlimited)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub max_clients: i32,
    pub max_posts_per_month: i32,
    pub max_ai_credits_per_month: i32,
}

/// Subscription lifecycle status
///
/// State machine: {incomplete, trialing, active} -> past_due ->
/// {active (invoice paid) | canceled}. Canceled is terminal for the current
/// lifecycle; a fresh checkout reactivates the same row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Parse a status name; unknown values map to Incomplete.
    pub fn parse(s: &str) -> Self {
        match s {
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Incomplete,
        }
    }

    /// Whether the account may create new content (post scheduling etc.)
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_strings() {
        for tier in [
            SubscriptionTier::Starter,
            SubscriptionTier::Professional,
            SubscriptionTier::Agency,
        ] {
            assert_eq!(SubscriptionTier::parse(tier.as_str()), tier);
        }
    }

    #[test]
    fn unknown_tier_falls_back_to_starter() {
        assert_eq!(
            SubscriptionTier::parse("enterprise"),
            SubscriptionTier::Starter
        );
        assert_eq!(SubscriptionTier::parse(""), SubscriptionTier::Starter);
    }

    #[test]
    fn agency_has_unlimited_clients_and_posts() {
        assert_eq!(SubscriptionTier::Agency.max_clients(), -1);
        assert_eq!(SubscriptionTier::Agency.max_posts_per_month(), -1);
        // AI credits stay bounded even on the top tier
        assert!(SubscriptionTier::Agency.max_ai_credits_per_month() > 0);
    }

    #[test]
    fn limits_are_monotonic_across_paid_tiers() {
        let starter = SubscriptionTier::Starter.limits();
        let pro = SubscriptionTier::Professional.limits();
        assert!(pro.max_clients > starter.max_clients);
        assert!(pro.max_posts_per_month > starter.max_posts_per_month);
        assert!(pro.max_ai_credits_per_month > starter.max_ai_credits_per_month);
    }

    #[test]
    fn only_active_and_trialing_are_usable() {
        assert!(SubscriptionStatus::Active.is_usable());
        assert!(SubscriptionStatus::Trialing.is_usable());
        assert!(!SubscriptionStatus::Incomplete.is_usable());
        assert!(!SubscriptionStatus::PastDue.is_usable());
        assert!(!SubscriptionStatus::Canceled.is_usable());
    }

    #[test]
    fn status_parse_handles_all_known_values() {
        for status in [
            SubscriptionStatus::Incomplete,
            SubscriptionStatus::Trialing,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(SubscriptionStatus::parse(status.as_str()), status);
        }
        // Unknown statuses never panic
        assert_eq!(
            SubscriptionStatus::parse("paused"),
            SubscriptionStatus::Incomplete
        );
    }
}
