//! Checkout start and finalization
//!
//! Finalization turns a completed checkout session into a bound subscription
//! record, then reconciles it so status and period come from the gateway rather
//! than from the (possibly partial) checkout payload.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{with_session_placeholder, CancellationFeedback, CheckoutSessionRequest};
use crate::customer::CustomerService;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{ReconciliationEngine, ReconciliationResult};

pub const REPLACED_CANCEL_REASON: &str = "Auto ended, new membership";

/// How a new checkout treats the billing cycle of the subscription it replaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPolicy {
    /// New subscription starts its own cycle
    #[default]
    Reset,
    /// New subscription's first renewal lines up with the old period end
    PreservePeriodEnd,
}

impl AnchorPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reset" => Some(AnchorPolicy::Reset),
            "preserve" | "preserve_period_end" => Some(AnchorPolicy::PreservePeriodEnd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutConfig {
    /// Public origin the gateway redirects back to
    pub base_url: String,
    pub anchor_policy: AnchorPolicy,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            anchor_policy: AnchorPolicy::Reset,
        }
    }
}

impl CheckoutConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let base_url = std::env::var("BASE_URL").unwrap_or(defaults.base_url);
        let anchor_policy = match std::env::var("CHECKOUT_ANCHOR_POLICY") {
            Ok(raw) => AnchorPolicy::parse(&raw).ok_or_else(|| {
                BillingError::Config(format!("CHECKOUT_ANCHOR_POLICY has an invalid value: {raw}"))
            })?,
            Err(_) => defaults.anchor_policy,
        };
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            anchor_policy,
        })
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }
}

#[derive(Clone)]
pub struct CheckoutService {
    engine: Arc<ReconciliationEngine>,
    customers: CustomerService,
    config: CheckoutConfig,
}

impl CheckoutService {
    pub fn new(engine: Arc<ReconciliationEngine>, config: CheckoutConfig) -> Self {
        let customers = CustomerService::new(engine.gateway.clone(), engine.customers.clone());
        Self {
            engine,
            customers,
            config,
        }
    }

    /// Start a hosted checkout for `plan_id` and return its URL
    pub async fn start_checkout(
        &self,
        user_id: Uuid,
        plan_id: &str,
        success_path: &str,
        cancel_path: &str,
    ) -> BillingResult<String> {
        let plan = self
            .engine
            .catalog
            .plan(plan_id)
            .await?
            .filter(|p| p.active)
            .ok_or_else(|| BillingError::UnknownPlan(plan_id.to_string()))?;

        let customer_remote_id = self.customers.ensure_remote_customer(user_id).await?;
        let billing_cycle_anchor = self.anchor_for(user_id).await?;

        let url = self
            .engine
            .gateway
            .start_checkout_session(CheckoutSessionRequest {
                customer_remote_id,
                price_id: plan.remote_price_id.clone(),
                success_url: with_session_placeholder(&self.config.url(success_path)),
                cancel_url: self.config.url(cancel_path),
                billing_cycle_anchor,
            })
            .await?;

        tracing::info!(
            user_id = %user_id,
            plan_id = %plan.plan_id,
            anchored = billing_cycle_anchor.is_some(),
            "Started checkout session"
        );
        Ok(url)
    }

    async fn anchor_for(&self, user_id: Uuid) -> BillingResult<Option<OffsetDateTime>> {
        if self.config.anchor_policy == AnchorPolicy::Reset {
            return Ok(None);
        }
        let now = OffsetDateTime::now_utc();
        Ok(self
            .engine
            .store
            .get(user_id)
            .await?
            .filter(|r| r.status.is_paid())
            .and_then(|r| r.current_period_end)
            .filter(|end| *end > now))
    }

    /// Bind the subscription from a completed checkout session to its user
    pub async fn finalize_checkout(&self, session_id: &str) -> BillingResult<ReconciliationResult> {
        let gateway = &self.engine.gateway;
        let session = gateway.get_checkout_session(session_id).await?;

        let (Some(customer_remote_id), Some(remote_subscription_id)) = (
            session.customer_remote_id.clone(),
            session.remote_subscription_id.clone(),
        ) else {
            tracing::error!(
                session_id,
                customer = ?session.customer_remote_id,
                subscription = ?session.remote_subscription_id,
                "Checkout session is missing customer or subscription"
            );
            return Err(BillingError::InvalidCheckout(format!(
                "session {session_id} has no customer or subscription"
            )));
        };

        let user_id = self
            .engine
            .customers
            .user_for_customer(&customer_remote_id)
            .await?
            .ok_or_else(|| {
                tracing::error!(
                    session_id,
                    customer_id = %customer_remote_id,
                    "Checkout customer has no local user"
                );
                BillingError::UnknownCustomer(customer_remote_id.clone())
            })?;

        let price_id = match session.price_id.clone() {
            Some(price) => price,
            None => gateway
                .get_subscription(&remote_subscription_id)
                .await?
                .price_id
                .ok_or_else(|| {
                    BillingError::InvalidCheckout(format!("session {session_id} has no price"))
                })?,
        };
        let plan = self
            .engine
            .catalog
            .plan_by_price(&price_id)
            .await?
            .ok_or_else(|| {
                tracing::error!(session_id, price_id = %price_id, "Checkout price not in catalog");
                BillingError::UnknownPlan(price_id.clone())
            })?;

        let _guard = self
            .engine
            .locks
            .acquire(user_id, self.engine.config.lock_backoff)
            .await?;

        let (record, _) = self.engine.store.get_or_create(user_id).await?;

        if record.remote_subscription_id.as_deref() != Some(remote_subscription_id.as_str()) {
            if let Some(old_id) = record.remote_subscription_id.as_deref() {
                match gateway
                    .cancel_subscription(
                        old_id,
                        REPLACED_CANCEL_REASON,
                        CancellationFeedback::Other,
                        true,
                    )
                    .await
                {
                    Ok(_) => tracing::info!(
                        user_id = %user_id,
                        old_subscription_id = %old_id,
                        new_subscription_id = %remote_subscription_id,
                        "Cancelled replaced subscription"
                    ),
                    Err(e) => tracing::warn!(
                        user_id = %user_id,
                        old_subscription_id = %old_id,
                        error = %e,
                        "Failed to cancel replaced subscription, continuing"
                    ),
                }
            }

            let bound = record.rebound(&remote_subscription_id, &plan.plan_id);
            self.engine.store.save(&bound).await?;
            tracing::info!(
                user_id = %user_id,
                subscription_id = %remote_subscription_id,
                plan_id = %plan.plan_id,
                "Bound checkout subscription"
            );
        }

        self.engine.reconcile_locked(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_policy_parse() {
        assert_eq!(AnchorPolicy::parse("reset"), Some(AnchorPolicy::Reset));
        assert_eq!(
            AnchorPolicy::parse("preserve"),
            Some(AnchorPolicy::PreservePeriodEnd)
        );
        assert_eq!(AnchorPolicy::parse("keep"), None);
    }

    #[test]
    fn test_urls_join_base() {
        let config = CheckoutConfig {
            base_url: "https://app.test".to_string(),
            anchor_policy: AnchorPolicy::Reset,
        };
        assert_eq!(
            config.url("/billing/checkout/finalize"),
            "https://app.test/billing/checkout/finalize"
        );
        assert_eq!(config.url("pricing"), "https://app.test/pricing");
        assert_eq!(
            config.url("https://other.test/done"),
            "https://other.test/done"
        );
    }
}
