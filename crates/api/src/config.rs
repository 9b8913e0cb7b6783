//! API server configuration

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Whether the Stripe billing service should be started. When false the
    /// server runs with the billing surface disabled.
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let enable_billing = std::env::var("ENABLE_BILLING")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            bind_address,
            enable_billing,
        })
    }
}
