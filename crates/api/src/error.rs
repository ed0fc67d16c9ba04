//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use billsync_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Missing Stripe-Signature header")]
    MissingSignature,

    #[error("Webhook signing secret is not configured")]
    WebhookNotConfigured,

    #[error("{0}")]
    Validation(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Billing(e) => match e {
                BillingError::Gateway { transient, .. } => {
                    if *transient {
                        StatusCode::SERVICE_UNAVAILABLE
                    } else {
                        StatusCode::BAD_GATEWAY
                    }
                }
                BillingError::NotFound { .. } => StatusCode::NOT_FOUND,
                BillingError::InvalidCheckout(_)
                | BillingError::UnknownCustomer(_)
                | BillingError::UnknownPlan(_) => StatusCode::UNPROCESSABLE_ENTITY,
                BillingError::LockContention(_) | BillingError::NoActiveSubscription(_) => {
                    StatusCode::CONFLICT
                }
                BillingError::InvalidFilter(_) | BillingError::InvalidWebhookPayload(_) => {
                    StatusCode::BAD_REQUEST
                }
                BillingError::WebhookSignatureInvalid => StatusCode::UNAUTHORIZED,
                BillingError::InvalidRecord(_)
                | BillingError::Database(_)
                | BillingError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::MissingSignature | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::WebhookNotConfigured => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Billing(e) => e.kind(),
            ApiError::MissingSignature => "missing_signature",
            ApiError::WebhookNotConfigured => "config_error",
            ApiError::Validation(_) => "validation_error",
        }
    }

    /// Message safe to return to the client
    fn public_message(&self) -> String {
        match self {
            ApiError::Billing(e) if e.is_data_integrity() || e.is_transient() => {
                e.user_message().to_string()
            }
            ApiError::Billing(BillingError::NoActiveSubscription(_)) => {
                "No active subscription found.".to_string()
            }
            _ if self.status().is_server_error() => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        } else {
            tracing::warn!(kind = self.kind(), error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.public_message(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_data_integrity_errors_ask_for_support() {
        let err = ApiError::from(BillingError::UnknownPlan("price_x".to_string()));
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.kind(), "unknown_plan");
        assert!(err.public_message().contains("contact support"));
    }

    #[test]
    fn test_gateway_errors_split_on_transience() {
        let transient = ApiError::from(BillingError::gateway("http_503", "down", true));
        assert_eq!(transient.status(), StatusCode::SERVICE_UNAVAILABLE);

        let rejected = ApiError::from(BillingError::gateway("card_declined", "no", false));
        assert_eq!(rejected.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(rejected.public_message(), "Internal server error");
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let err = ApiError::from(BillingError::Database("relation missing".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.public_message().contains("relation"));
    }

    #[test]
    fn test_conflicts() {
        let id = Uuid::new_v4();
        assert_eq!(
            ApiError::from(BillingError::LockContention(id)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(BillingError::NoActiveSubscription(id)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ApiError::from(BillingError::WebhookSignatureInvalid).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
