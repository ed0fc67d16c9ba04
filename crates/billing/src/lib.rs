// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries gateway messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billsync Billing Module
//!
//! Keeps each user's local subscription record consistent with the payment
//! gateway across checkout completion, webhook delivery, manual refreshes and
//! scheduled batch reconciliation.
//!
//! ## Features
//!
//! - **Reconciliation**: gateway state overwrites local state per user, with dangling-reference cleanup
//! - **Batch sync**: bounded-concurrency reconciliation over a filtered population
//! - **Dangling sweep**: cancels gateway subscriptions no local record references
//! - **Checkout**: hosted checkout start and finalization into a bound record
//! - **Webhooks**: signature verification and idempotent event intake
//! - **Invariants**: read-only consistency checks over stored records

pub mod catalog;
pub mod checkout;
pub mod client;
pub mod customer;
pub mod error;
pub mod invariants;
pub mod reconcile;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;


use std::sync::Arc;

use sqlx::PgPool;

// Catalog
pub use catalog::{BillingInterval, CatalogPlan, PgCatalog, PlanCatalog, StaticCatalog};

// Checkout
pub use checkout::{AnchorPolicy, CheckoutConfig, CheckoutService};

// Client
pub use client::{
    BillingGateway, CancellationFeedback, CheckoutSessionDetails, RemoteStatus,
    RemoteSubscriptionSnapshot, StripeClient, StripeConfig,
};

// Customer
pub use customer::{BillingCustomer, CustomerDirectory, CustomerService, PgCustomerDirectory};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Reconciliation
pub use reconcile::{
    BatchFilter, CancelRequest, ReconcileConfig, ReconcileOutcome, ReconciliationEngine,
    ReconciliationResult, SyncReport,
};

// Store
pub use store::{CandidateQuery, PgSubscriptionStore, SubscriptionStore};

// Subscriptions
pub use subscriptions::{LocalSubscriptionRecord, SubscriptionStatus};

// Webhooks
pub use webhooks::{
    verify_signature, EventDedupStore, PgDedupStore, WebhookEvent, WebhookHandler,
    WebhookOutcome,
};

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> BillingResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub engine: Arc<ReconciliationEngine>,
    pub checkout: CheckoutService,
    pub customers: CustomerService,
    pub webhooks: Arc<WebhookHandler>,
    /// Secret for verifying inbound webhook signatures
    pub webhook_secret: Option<String>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();

        let mut service = Self::with_postgres(
            Arc::new(stripe),
            pool,
            ReconcileConfig::from_env()?,
            CheckoutConfig::from_env()?,
        );
        service.webhook_secret = webhook_secret;
        Ok(service)
    }

    /// Postgres-backed stores around the given gateway
    pub fn with_postgres(
        gateway: Arc<dyn BillingGateway>,
        pool: PgPool,
        reconcile: ReconcileConfig,
        checkout: CheckoutConfig,
    ) -> Self {
        Self::new(
            gateway,
            Arc::new(PgSubscriptionStore::new(pool.clone())),
            Arc::new(PgCatalog::new(pool.clone())),
            Arc::new(PgCustomerDirectory::new(pool.clone())),
            Arc::new(PgDedupStore::new(pool)),
            reconcile,
            checkout,
        )
    }

    /// Wire the services together over explicit collaborators
    pub fn new(
        gateway: Arc<dyn BillingGateway>,
        store: Arc<dyn SubscriptionStore>,
        catalog: Arc<dyn PlanCatalog>,
        customers: Arc<dyn CustomerDirectory>,
        dedup: Arc<dyn EventDedupStore>,
        reconcile: ReconcileConfig,
        checkout: CheckoutConfig,
    ) -> Self {
        let engine = Arc::new(ReconciliationEngine::new(
            store,
            gateway.clone(),
            catalog,
            customers.clone(),
            reconcile,
        ));
        let checkout = CheckoutService::new(engine.clone(), checkout);
        let webhooks = Arc::new(WebhookHandler::new(
            engine.clone(),
            checkout.clone(),
            dedup,
        ));

        Self {
            customers: CustomerService::new(gateway, customers),
            engine,
            checkout,
            webhooks,
            webhook_secret: None,
        }
    }
}
