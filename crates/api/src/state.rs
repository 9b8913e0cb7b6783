//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use postline_billing::BillingService;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Billing service, None when Stripe is not configured
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let billing = if config.enable_billing {
            match BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self {
            pool,
            config,
            billing,
        }
    }
}
