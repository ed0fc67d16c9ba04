//! Application state

use billsync_billing::BillingService;
use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
}

impl AppState {
    pub fn new(billing: BillingService) -> Self {
        Self { billing }
    }

    /// Build the Stripe-backed billing service over `pool`
    pub fn from_env(pool: PgPool) -> anyhow::Result<Self> {
        let billing = BillingService::from_env(pool)?;
        if billing.webhook_secret.is_none() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set, webhook requests will be rejected");
        }
        tracing::info!("Stripe billing service initialized");
        Ok(Self::new(billing))
    }
}
