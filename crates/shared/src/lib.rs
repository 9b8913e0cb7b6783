//! Shared types and database utilities for Postline
//!
//! Domain types (subscription tiers, statuses, entitlement limits) and the
//! database pool/migration helpers used by the api, billing, and worker crates.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations};
pub use types::{SubscriptionStatus, SubscriptionTier, TierLimits};
