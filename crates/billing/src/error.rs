//! Billing error types

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Network, auth or 5xx failure talking to the payment gateway
    #[error("Gateway error ({code}): {message}")]
    Gateway {
        code: String,
        message: String,
        transient: bool,
    },

    /// The gateway confirmed the object does not exist
    #[error("{resource} not found at gateway: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Invalid checkout session: {0}")]
    InvalidCheckout(String),

    #[error("No local user for gateway customer {0}")]
    UnknownCustomer(String),

    #[error("No catalog plan for price {0}")]
    UnknownPlan(String),

    #[error("Subscription record for user {0} is locked by a concurrent reconciliation")]
    LockContention(Uuid),

    #[error("User {0} has no active subscription")]
    NoActiveSubscription(Uuid),

    #[error("Invalid batch filter: {0}")]
    InvalidFilter(String),

    #[error("Subscription record rejected: {0}")]
    InvalidRecord(String),

    #[error("Invalid webhook payload: {0}")]
    InvalidWebhookPayload(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BillingError {
    pub fn gateway(code: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        BillingError::Gateway {
            code: code.into(),
            message: message.into(),
            transient,
        }
    }

    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::Gateway {
                transient: true,
                ..
            } | BillingError::LockContention(_)
        )
    }

    /// Bad or missing mapping data; retrying will not help
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            BillingError::InvalidCheckout(_)
                | BillingError::UnknownCustomer(_)
                | BillingError::UnknownPlan(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BillingError::NotFound { .. })
    }

    /// Short machine-readable kind used in API responses and batch reports
    pub fn kind(&self) -> &'static str {
        match self {
            BillingError::Gateway { .. } => "gateway_error",
            BillingError::NotFound { .. } => "not_found",
            BillingError::InvalidCheckout(_) => "invalid_checkout",
            BillingError::UnknownCustomer(_) => "unknown_customer",
            BillingError::UnknownPlan(_) => "unknown_plan",
            BillingError::LockContention(_) => "lock_contention",
            BillingError::NoActiveSubscription(_) => "no_active_subscription",
            BillingError::InvalidFilter(_) => "invalid_filter",
            BillingError::InvalidRecord(_) => "invalid_record",
            BillingError::InvalidWebhookPayload(_) => "invalid_webhook_payload",
            BillingError::WebhookSignatureInvalid => "invalid_signature",
            BillingError::Database(_) => "database_error",
            BillingError::Config(_) => "config_error",
        }
    }

    /// Message suitable for end users
    pub fn user_message(&self) -> &'static str {
        if self.is_data_integrity() {
            "We could not complete your subscription. Please contact support."
        } else if self.is_transient() {
            "Unable to refresh your subscription right now. Please try again."
        } else {
            match self {
                BillingError::NoActiveSubscription(_) => "No active subscription found.",
                _ => "Something went wrong with billing. Please try again later.",
            }
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match err {
            stripe::StripeError::Stripe(request_error) => {
                let status = request_error.http_status;
                if status == 404 {
                    // Callers re-tag with the resource they were looking up
                    return BillingError::NotFound {
                        resource: "object",
                        id: request_error.message.clone().unwrap_or_default(),
                    };
                }
                let message = request_error
                    .message
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string());
                let code = request_error
                    .code
                    .as_ref()
                    .map(|c| format!("{c:?}"))
                    .unwrap_or_else(|| format!("http_{status}"));
                let transient = status == 429 || (500..600).contains(&status);
                BillingError::Gateway {
                    code,
                    message,
                    transient,
                }
            }
            stripe::StripeError::Timeout => {
                BillingError::gateway("timeout", "Gateway request timed out", true)
            }
            stripe::StripeError::ClientError(msg) => BillingError::gateway("transport", msg, true),
            other => BillingError::gateway("client", other.to_string(), false),
        }
    }
}
