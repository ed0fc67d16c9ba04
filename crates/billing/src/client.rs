//! Payment gateway boundary
//!
//! The reconciliation engine talks to the gateway only through [`BillingGateway`].
//! [`StripeClient`] is the live implementation; every call is wrapped in a
//! per-attempt timeout and a bounded retry that only fires for transient failures.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stripe::{
    CancelSubscription, CancellationDetails, CancellationDetailsFeedback, CheckoutSession, CheckoutSessionId,
    CheckoutSessionMode, Client, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CreateCustomer, Customer, CustomerId, Expandable,
    ListSubscriptions, Subscription, SubscriptionId, SubscriptionStatusFilter, UpdateSubscription,
    UpdateSubscriptionCancellationDetails, UpdateSubscriptionCancellationDetailsFeedback,
};
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// Placeholder the gateway substitutes with the real session id on redirect
pub const CHECKOUT_SESSION_PLACEHOLDER: &str = "{CHECKOUT_SESSION_ID}";

const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const LIST_PAGE_SIZE: u64 = 100;

// =============================================================================
// Gateway-facing types
// =============================================================================

/// Subscription status as reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Active,
    Canceled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Paused,
    Trialing,
    Unpaid,
}

impl RemoteStatus {
    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "active" => RemoteStatus::Active,
            "canceled" => RemoteStatus::Canceled,
            "incomplete" => RemoteStatus::Incomplete,
            "incomplete_expired" => RemoteStatus::IncompleteExpired,
            "past_due" => RemoteStatus::PastDue,
            "paused" => RemoteStatus::Paused,
            "trialing" => RemoteStatus::Trialing,
            "unpaid" => RemoteStatus::Unpaid,
            _ => return None,
        })
    }
}

/// The gateway's view of a subscription at query time. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscriptionSnapshot {
    pub remote_id: String,
    pub status: RemoteStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub customer_remote_id: String,
    /// Price of the first subscription item, used for plan drift detection
    pub price_id: Option<String>,
}

/// Fields of a checkout session needed to finalize it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckoutSessionDetails {
    pub session_id: String,
    pub customer_remote_id: Option<String>,
    pub remote_subscription_id: Option<String>,
    pub price_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewCustomer {
    pub name: Option<String>,
    pub email: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct CheckoutSessionRequest {
    pub customer_remote_id: String,
    pub price_id: String,
    pub success_url: String,
    pub cancel_url: String,
    pub billing_cycle_anchor: Option<OffsetDateTime>,
}

/// Cancellation feedback codes accepted by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationFeedback {
    CustomerService,
    LowQuality,
    MissingFeatures,
    Other,
    SwitchedService,
    TooComplex,
    TooExpensive,
    Unused,
}

impl CancellationFeedback {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationFeedback::CustomerService => "customer_service",
            CancellationFeedback::LowQuality => "low_quality",
            CancellationFeedback::MissingFeatures => "missing_features",
            CancellationFeedback::Other => "other",
            CancellationFeedback::SwitchedService => "switched_service",
            CancellationFeedback::TooComplex => "too_complex",
            CancellationFeedback::TooExpensive => "too_expensive",
            CancellationFeedback::Unused => "unused",
        }
    }

    fn for_cancel(self) -> CancellationDetailsFeedback {
        use CancellationDetailsFeedback as F;
        match self {
            CancellationFeedback::CustomerService => F::CustomerService,
            CancellationFeedback::LowQuality => F::LowQuality,
            CancellationFeedback::MissingFeatures => F::MissingFeatures,
            CancellationFeedback::Other => F::Other,
            CancellationFeedback::SwitchedService => F::SwitchedService,
            CancellationFeedback::TooComplex => F::TooComplex,
            CancellationFeedback::TooExpensive => F::TooExpensive,
            CancellationFeedback::Unused => F::Unused,
        }
    }

    fn for_update(self) -> UpdateSubscriptionCancellationDetailsFeedback {
        use UpdateSubscriptionCancellationDetailsFeedback as F;
        match self {
            CancellationFeedback::CustomerService => F::CustomerService,
            CancellationFeedback::LowQuality => F::LowQuality,
            CancellationFeedback::MissingFeatures => F::MissingFeatures,
            CancellationFeedback::Other => F::Other,
            CancellationFeedback::SwitchedService => F::SwitchedService,
            CancellationFeedback::TooComplex => F::TooComplex,
            CancellationFeedback::TooExpensive => F::TooExpensive,
            CancellationFeedback::Unused => F::Unused,
        }
    }
}

impl std::fmt::Display for CancellationFeedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations the core needs from the payment gateway
#[async_trait]
pub trait BillingGateway: Send + Sync {
    async fn create_customer(&self, customer: NewCustomer) -> BillingResult<String>;

    /// Returns the hosted checkout URL
    async fn start_checkout_session(&self, request: CheckoutSessionRequest)
        -> BillingResult<String>;

    async fn get_checkout_session(&self, session_id: &str)
        -> BillingResult<CheckoutSessionDetails>;

    /// `NotFound` here is the dangling-reference signal
    async fn get_subscription(&self, remote_id: &str)
        -> BillingResult<RemoteSubscriptionSnapshot>;

    async fn list_active_subscriptions(
        &self,
        customer_remote_id: &str,
    ) -> BillingResult<Vec<RemoteSubscriptionSnapshot>>;

    /// With `immediate = false` the subscription is set to cancel at period end
    async fn cancel_subscription(
        &self,
        remote_id: &str,
        reason: &str,
        feedback: CancellationFeedback,
        immediate: bool,
    ) -> BillingResult<RemoteSubscriptionSnapshot>;
}

/// Append the session-id placeholder to a success URL unless it is already there
pub fn with_session_placeholder(success_url: &str) -> String {
    if success_url.contains(CHECKOUT_SESSION_PLACEHOLDER) {
        return success_url.to_string();
    }
    let separator = if success_url.contains('?') { '&' } else { '?' };
    format!("{success_url}{separator}session_id={CHECKOUT_SESSION_PLACEHOLDER}")
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: Option<String>,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl std::fmt::Debug for StripeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripeConfig")
            .field("secret_key", &"[REDACTED]")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[REDACTED]"))
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StripeConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            webhook_secret: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let allow_test_key = cfg!(debug_assertions)
            || std::env::var("STRIPE_ALLOW_TEST_KEY")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false);
        check_key_mode(&secret_key, allow_test_key)?;

        let max_retries = parse_env("STRIPE_MAX_RETRIES", DEFAULT_MAX_RETRIES)?;
        let timeout_secs = parse_env("STRIPE_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;

        Ok(Self {
            secret_key,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").ok(),
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn check_key_mode(secret_key: &str, allow_test_key: bool) -> BillingResult<()> {
    if !secret_key.starts_with("sk_") && !secret_key.starts_with("rk_") {
        return Err(BillingError::Config(
            "STRIPE_SECRET_KEY is not a Stripe secret key".to_string(),
        ));
    }
    if secret_key.starts_with("sk_test_") && !allow_test_key {
        return Err(BillingError::Config(
            "Refusing to start with a test-mode Stripe key in a release build".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} has an invalid value: {raw}"))),
        Err(_) => Ok(default),
    }
}

// =============================================================================
// Live Stripe client
// =============================================================================

#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, call: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, stripe::StripeError>>,
    {
        call_with_retry(operation, self.config.timeout, self.config.max_retries, call).await
    }
}

/// Run a gateway call with a per-attempt timeout and up to `max_retries`
/// retries on transient errors. Non-transient errors return after one attempt.
pub(crate) async fn call_with_retry<T, E, F, Fut>(
    operation: &'static str,
    timeout: Duration,
    max_retries: u32,
    mut call: F,
) -> BillingResult<T>
where
    E: Into<BillingError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(100)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(max_retries as usize);

    let action = || {
        let attempt = call();
        async move {
            match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result.map_err(Into::<BillingError>::into),
                Err(_) => Err(BillingError::gateway(
                    "timeout",
                    format!("Request timed out after {}s", timeout.as_secs()),
                    true,
                )),
            }
        }
    };

    RetryIf::spawn(strategy, action, |err: &BillingError| {
        let retry = err.is_transient();
        if retry {
            tracing::warn!(operation, error = %err, "Transient gateway error, retrying");
        }
        retry
    })
    .await
}

fn parse_id<T: std::str::FromStr>(kind: &'static str, id: &str) -> BillingResult<T> {
    id.parse()
        .map_err(|_| BillingError::gateway("invalid_id", format!("Invalid {kind} id: {id}"), false))
}

/// Re-tag a generic 404 with the resource that was being looked up
fn tag_not_found<'a>(
    resource: &'static str,
    id: &'a str,
) -> impl FnOnce(BillingError) -> BillingError + 'a {
    move |err| match err {
        BillingError::NotFound { .. } => BillingError::NotFound {
            resource,
            id: id.to_string(),
        },
        other => other,
    }
}

fn expandable_id<T: stripe::Object>(value: &Expandable<T>) -> String
where
    T::Id: std::fmt::Display,
{
    match value {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(obj) => obj.id().to_string(),
    }
}

fn timestamp(value: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value).map_err(|e| {
        BillingError::gateway("invalid_payload", format!("Bad timestamp {value}: {e}"), false)
    })
}

fn map_status(status: stripe::SubscriptionStatus) -> RemoteStatus {
    match status {
        stripe::SubscriptionStatus::Active => RemoteStatus::Active,
        stripe::SubscriptionStatus::Canceled => RemoteStatus::Canceled,
        stripe::SubscriptionStatus::Incomplete => RemoteStatus::Incomplete,
        stripe::SubscriptionStatus::IncompleteExpired => RemoteStatus::IncompleteExpired,
        stripe::SubscriptionStatus::PastDue => RemoteStatus::PastDue,
        stripe::SubscriptionStatus::Paused => RemoteStatus::Paused,
        stripe::SubscriptionStatus::Trialing => RemoteStatus::Trialing,
        stripe::SubscriptionStatus::Unpaid => RemoteStatus::Unpaid,
    }
}

fn snapshot_from(sub: &Subscription) -> BillingResult<RemoteSubscriptionSnapshot> {
    let price_id = sub
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .map(|price| price.id.to_string());

    Ok(RemoteSubscriptionSnapshot {
        remote_id: sub.id.to_string(),
        status: map_status(sub.status),
        current_period_start: timestamp(sub.current_period_start)?,
        current_period_end: timestamp(sub.current_period_end)?,
        cancel_at_period_end: sub.cancel_at_period_end,
        customer_remote_id: expandable_id(&sub.customer),
        price_id,
    })
}

#[async_trait]
impl BillingGateway for StripeClient {
    async fn create_customer(&self, customer: NewCustomer) -> BillingResult<String> {
        let created = self
            .with_retry("create_customer", || {
                let mut params = CreateCustomer::new();
                params.name = customer.name.as_deref();
                params.email = customer.email.as_deref();
                params.metadata = Some(customer.metadata.clone());
                Customer::create(&self.inner, params)
            })
            .await?;

        tracing::info!(customer_id = %created.id, "Created gateway customer");
        Ok(created.id.to_string())
    }

    async fn start_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> BillingResult<String> {
        let customer_id: CustomerId = parse_id("customer", &request.customer_remote_id)?;
        let success_url = with_session_placeholder(&request.success_url);
        let anchor = request.billing_cycle_anchor.map(|t| t.unix_timestamp());

        let session = self
            .with_retry("start_checkout_session", || {
                let mut params = CreateCheckoutSession::new();
                params.customer = Some(customer_id.clone());
                params.mode = Some(CheckoutSessionMode::Subscription);
                params.success_url = Some(&success_url);
                params.cancel_url = Some(&request.cancel_url);
                params.line_items = Some(vec![CreateCheckoutSessionLineItems {
                    price: Some(request.price_id.clone()),
                    quantity: Some(1),
                    ..Default::default()
                }]);
                if let Some(anchor) = anchor {
                    params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                        billing_cycle_anchor: Some(anchor),
                        ..Default::default()
                    });
                }
                CheckoutSession::create(&self.inner, params)
            })
            .await?;

        session.url.ok_or_else(|| {
            BillingError::gateway("invalid_payload", "Checkout session has no URL", false)
        })
    }

    async fn get_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionDetails> {
        let id: CheckoutSessionId = parse_id("checkout session", session_id)?;

        let session = self
            .with_retry("get_checkout_session", || {
                CheckoutSession::retrieve(&self.inner, &id, &["line_items"])
            })
            .await
            .map_err(tag_not_found("checkout_session", session_id))?;

        let price_id = session
            .line_items
            .as_ref()
            .and_then(|items| items.data.first())
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        Ok(CheckoutSessionDetails {
            session_id: session.id.to_string(),
            customer_remote_id: session.customer.as_ref().map(expandable_id),
            remote_subscription_id: session.subscription.as_ref().map(expandable_id),
            price_id,
        })
    }

    async fn get_subscription(
        &self,
        remote_id: &str,
    ) -> BillingResult<RemoteSubscriptionSnapshot> {
        let id: SubscriptionId = parse_id("subscription", remote_id)?;

        let sub = self
            .with_retry("get_subscription", || {
                Subscription::retrieve(&self.inner, &id, &[])
            })
            .await
            .map_err(tag_not_found("subscription", remote_id))?;

        snapshot_from(&sub)
    }

    async fn list_active_subscriptions(
        &self,
        customer_remote_id: &str,
    ) -> BillingResult<Vec<RemoteSubscriptionSnapshot>> {
        let customer_id: CustomerId = parse_id("customer", customer_remote_id)?;
        let mut snapshots = Vec::new();
        let mut starting_after: Option<SubscriptionId> = None;

        loop {
            let page = self
                .with_retry("list_active_subscriptions", || {
                    let mut params = ListSubscriptions::new();
                    params.customer = Some(customer_id.clone());
                    params.status = Some(SubscriptionStatusFilter::Active);
                    params.limit = Some(LIST_PAGE_SIZE);
                    params.starting_after = starting_after.clone();
                    Subscription::list(&self.inner, &params)
                })
                .await?;

            for sub in &page.data {
                snapshots.push(snapshot_from(sub)?);
            }

            match (page.has_more, page.data.last()) {
                (true, Some(last)) => starting_after = Some(last.id.clone()),
                _ => break,
            }
        }

        Ok(snapshots)
    }

    async fn cancel_subscription(
        &self,
        remote_id: &str,
        reason: &str,
        feedback: CancellationFeedback,
        immediate: bool,
    ) -> BillingResult<RemoteSubscriptionSnapshot> {
        let id: SubscriptionId = parse_id("subscription", remote_id)?;

        let sub = if immediate {
            self.with_retry("cancel_subscription", || {
                let mut params = CancelSubscription::default();
                params.cancellation_details = Some(CancellationDetails {
                    comment: Some(reason.to_string()),
                    feedback: Some(feedback.for_cancel()),
                    reason: None,
                });
                Subscription::cancel(&self.inner, &id, params)
            })
            .await
        } else {
            self.with_retry("cancel_subscription_at_period_end", || {
                let mut params = UpdateSubscription::new();
                params.cancel_at_period_end = Some(true);
                params.cancellation_details = Some(UpdateSubscriptionCancellationDetails {
                    comment: Some(reason.to_string()),
                    feedback: Some(feedback.for_update()),
                });
                Subscription::update(&self.inner, &id, params)
            })
            .await
        }
        .map_err(tag_not_found("subscription", remote_id))?;

        tracing::info!(
            subscription_id = %remote_id,
            immediate,
            reason,
            feedback = %feedback,
            "Cancelled gateway subscription"
        );

        snapshot_from(&sub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_appended_once() {
        assert_eq!(
            with_session_placeholder("https://app.test/checkout/finalize"),
            "https://app.test/checkout/finalize?session_id={CHECKOUT_SESSION_ID}"
        );
        assert_eq!(
            with_session_placeholder("https://app.test/finalize?ref=pricing"),
            "https://app.test/finalize?ref=pricing&session_id={CHECKOUT_SESSION_ID}"
        );

        let already = "https://app.test/finalize?session_id={CHECKOUT_SESSION_ID}";
        assert_eq!(with_session_placeholder(already), already);
        assert_eq!(
            with_session_placeholder(&with_session_placeholder(already))
                .matches(CHECKOUT_SESSION_PLACEHOLDER)
                .count(),
            1
        );
    }

    #[test]
    fn test_key_mode_guard() {
        assert!(check_key_mode("sk_live_abc", false).is_ok());
        assert!(check_key_mode("rk_live_abc", false).is_ok());
        assert!(check_key_mode("sk_test_abc", true).is_ok());
        assert!(matches!(
            check_key_mode("sk_test_abc", false),
            Err(BillingError::Config(_))
        ));
        assert!(matches!(
            check_key_mode("pk_live_abc", true),
            Err(BillingError::Config(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = StripeConfig::new("sk_live_secret");
        config.webhook_secret = Some("whsec_secret".to_string());
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk_live_secret"));
        assert!(!rendered.contains("whsec_secret"));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_remote_status_parse() {
        assert_eq!(RemoteStatus::parse("trialing"), Some(RemoteStatus::Trialing));
        assert_eq!(
            RemoteStatus::parse("incomplete_expired"),
            Some(RemoteStatus::IncompleteExpired)
        );
        assert_eq!(RemoteStatus::parse("bogus"), None);
    }

    const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_twice() {
        let mut attempts = 0;
        let call = || {
            attempts += 1;
            async { Err(BillingError::gateway("http_503", "unavailable", true)) }
        };
        let result: BillingResult<()> =
            call_with_retry("get_subscription", ATTEMPT_TIMEOUT, 2, call).await;

        assert_eq!(attempts, 3);
        assert!(matches!(
            result,
            Err(BillingError::Gateway { transient: true, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_not_retried() {
        let mut attempts = 0;
        let call = || {
            attempts += 1;
            async { Err(BillingError::gateway("http_400", "bad request", false)) }
        };
        let result: BillingResult<()> =
            call_with_retry("create_customer", ATTEMPT_TIMEOUT, 2, call).await;

        assert_eq!(attempts, 1);
        assert!(matches!(
            result,
            Err(BillingError::Gateway { transient: false, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_attempts_time_out_and_retry() {
        let mut attempts = 0;
        let call = || {
            attempts += 1;
            std::future::pending::<Result<(), BillingError>>()
        };
        let result: BillingResult<()> =
            call_with_retry("list_active_subscriptions", ATTEMPT_TIMEOUT, 2, call).await;

        assert_eq!(attempts, 3);
        match result {
            Err(BillingError::Gateway { code, transient, .. }) => {
                assert_eq!(code, "timeout");
                assert!(transient);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let mut attempts = 0;
        let result = call_with_retry("get_checkout_session", ATTEMPT_TIMEOUT, 2, || {
            attempts += 1;
            let outcome = if attempts < 2 {
                Err(BillingError::gateway("http_502", "bad gateway", true))
            } else {
                Ok("cs_123")
            };
            async move { outcome }
        })
        .await;

        assert_eq!(attempts, 2);
        assert_eq!(result.ok(), Some("cs_123"));
    }

    #[test]
    fn test_not_found_is_retagged() {
        let err = BillingError::NotFound {
            resource: "object",
            id: "No such subscription".to_string(),
        };
        match tag_not_found("subscription", "sub_123")(err) {
            BillingError::NotFound { resource, id } => {
                assert_eq!(resource, "subscription");
                assert_eq!(id, "sub_123");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let passthrough = tag_not_found("subscription", "sub_123")(BillingError::gateway(
            "http_500", "boom", true,
        ));
        assert!(passthrough.is_transient());
    }
}
