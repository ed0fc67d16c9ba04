//! Billing routes
//!
//! User-scoped routes take the user id from the path; authenticating that the
//! caller may act for the user is the job of the layer in front of this router.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use billsync_billing::{
    verify_signature, CancelRequest, CatalogPlan, LocalSubscriptionRecord, ReconciliationResult,
    WebhookEvent, WebhookOutcome,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";
const DEFAULT_SUCCESS_PATH: &str = "/billing/checkout/finalize";
const DEFAULT_CANCEL_PATH: &str = "/pricing";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/plans", get(list_plans))
        .route("/webhook", post(webhook))
        .route("/checkout/finalize", get(finalize_checkout))
        .route("/users/{user_id}/subscription", get(get_subscription))
        .route("/users/{user_id}/refresh", post(refresh))
        .route("/users/{user_id}/checkout", post(start_checkout))
        .route("/users/{user_id}/cancel", post(cancel))
}

/// A subscription record with the permissions it currently grants
#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    #[serde(flatten)]
    pub subscription: LocalSubscriptionRecord,
    pub entitlements: Vec<String>,
}

async fn view(state: &AppState, record: LocalSubscriptionRecord) -> ApiResult<SubscriptionView> {
    let entitlements = state
        .billing
        .engine
        .catalog()
        .entitlements_for(&record)
        .await?;
    Ok(SubscriptionView {
        subscription: record,
        entitlements,
    })
}

async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<CatalogPlan>>> {
    Ok(Json(state.billing.engine.catalog().list().await?))
}

async fn get_subscription(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    let record = state.billing.engine.subscription(user_id).await?;
    Ok(Json(view(&state, record).await?))
}

/// Reconcile one user on demand
async fn refresh(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<ReconciliationResult>> {
    let result = state.billing.engine.try_reconcile(user_id).await?;
    tracing::info!(user_id = %user_id, outcome = %result.outcome, "Manual subscription refresh");
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct StartCheckoutRequest {
    pub plan_id: String,
    pub success_path: Option<String>,
    pub cancel_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartCheckoutResponse {
    pub url: String,
}

async fn start_checkout(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<StartCheckoutRequest>,
) -> ApiResult<Json<StartCheckoutResponse>> {
    let url = state
        .billing
        .checkout
        .start_checkout(
            user_id,
            &request.plan_id,
            request.success_path.as_deref().unwrap_or(DEFAULT_SUCCESS_PATH),
            request.cancel_path.as_deref().unwrap_or(DEFAULT_CANCEL_PATH),
        )
        .await?;
    Ok(Json(StartCheckoutResponse { url }))
}

#[derive(Debug, Deserialize)]
pub struct FinalizeQuery {
    pub session_id: Option<String>,
}

async fn finalize_checkout(
    State(state): State<AppState>,
    Query(query): Query<FinalizeQuery>,
) -> ApiResult<Json<ReconciliationResult>> {
    let session_id = query
        .session_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("session_id is required".to_string()))?;

    let result = state.billing.checkout.finalize_checkout(&session_id).await?;
    Ok(Json(result))
}

async fn cancel(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<SubscriptionView>> {
    let record = state.billing.engine.cancel_for_user(user_id, request).await?;
    Ok(Json(view(&state, record).await?))
}

async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookOutcome>> {
    let secret = state
        .billing
        .webhook_secret
        .as_deref()
        .ok_or(ApiError::WebhookNotConfigured)?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::MissingSignature)?;

    verify_signature(
        &body,
        signature,
        secret,
        OffsetDateTime::now_utc().unix_timestamp(),
    )?;

    let event = WebhookEvent::from_slice(&body)?;
    let outcome = state.billing.webhooks.handle(&event).await?;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use billsync_billing::testing::{
        active_snapshot, MemoryCustomerDirectory, MemoryDedupStore, MemorySubscriptionStore,
        MockGateway, StaticCatalog,
    };
    use billsync_billing::{
        BillingInterval, BillingService, CheckoutConfig, CheckoutSessionDetails, ReconcileConfig,
        SubscriptionStatus,
    };
    use hmac::{Hmac, Mac};
    use serde_json::{json, Value};
    use sha2::Sha256;
    use tower::ServiceExt;

    use super::*;
    use crate::routes::create_router;

    const SECRET: &str = "whsec_test_secret";

    struct TestApp {
        gateway: MockGateway,
        store: MemorySubscriptionStore,
        customers: MemoryCustomerDirectory,
        router: Router,
    }

    fn plan(id: &str, price: &str) -> CatalogPlan {
        CatalogPlan {
            plan_id: id.to_string(),
            remote_price_id: price.to_string(),
            interval: BillingInterval::Month,
            price_cents: 1500,
            active: true,
            featured: false,
            features: vec![format!("{id} features")],
            permissions: vec![format!("{id}.access")],
        }
    }

    fn test_app() -> TestApp {
        let gateway = MockGateway::new();
        let store = MemorySubscriptionStore::new();
        let customers = MemoryCustomerDirectory::new();

        let mut billing = BillingService::new(
            Arc::new(gateway.clone()),
            Arc::new(store.clone()),
            Arc::new(StaticCatalog::new(vec![plan("pro", "price_pro")])),
            Arc::new(customers.clone()),
            Arc::new(MemoryDedupStore::new()),
            ReconcileConfig {
                workers: 2,
                user_timeout: Duration::from_secs(2),
                lock_backoff: Duration::from_millis(1),
            },
            CheckoutConfig {
                base_url: "https://app.test".to_string(),
                ..Default::default()
            },
        );
        billing.webhook_secret = Some(SECRET.to_string());

        TestApp {
            gateway,
            store,
            customers,
            router: create_router(AppState::new(billing)),
        }
    }

    fn sign(payload: &[u8]) -> String {
        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    fn webhook_request(payload: &[u8], signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/billing/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(payload.to_vec())).unwrap()
    }

    #[tokio::test]
    async fn test_webhook_requires_signature() {
        let app = test_app();
        let (status, body) = send(&app.router, webhook_request(b"{}", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "missing_signature");
    }

    #[tokio::test]
    async fn test_webhook_rejects_bad_signature() {
        let app = test_app();
        let payload = br#"{"id":"evt_1","type":"invoice.paid","data":{"object":{}}}"#;
        let forged = format!(
            "t={},v1=00ff",
            OffsetDateTime::now_utc().unix_timestamp()
        );
        let (status, body) = send(&app.router, webhook_request(payload, Some(forged))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["kind"], "invalid_signature");
    }

    #[tokio::test]
    async fn test_webhook_invoice_counted_once() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        app.customers.insert_user(user_id, None, None, Some("cus_1"));

        let payload = serde_json::to_vec(&json!({
            "id": "evt_inv",
            "type": "invoice.paid",
            "data": { "object": { "customer": "cus_1", "amount_paid": 1500 } }
        }))
        .unwrap();

        let (status, body) =
            send(&app.router, webhook_request(&payload, Some(sign(&payload)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "lifetime_value_added");
        assert_eq!(body["amount_cents"], 1500);

        let (status, body) =
            send(&app.router, webhook_request(&payload, Some(sign(&payload)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "duplicate");
        assert_eq!(app.customers.lifetime_value(user_id), 1500);
    }

    #[tokio::test]
    async fn test_webhook_rejects_malformed_event() {
        let app = test_app();
        let payload = br#"{"type":"invoice.paid"}"#;
        let (status, body) =
            send(&app.router, webhook_request(payload, Some(sign(payload)))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["kind"], "invalid_webhook_payload");
    }

    #[tokio::test]
    async fn test_finalize_checkout_binds_subscription() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        app.customers.insert_user(user_id, None, None, Some("cus_1"));
        app.gateway.insert_subscription(active_snapshot(
            "sub_1",
            "cus_1",
            "price_pro",
            OffsetDateTime::now_utc() + time::Duration::days(30),
        ));
        app.gateway.insert_checkout_session(CheckoutSessionDetails {
            session_id: "cs_1".to_string(),
            customer_remote_id: Some("cus_1".to_string()),
            remote_subscription_id: Some("sub_1".to_string()),
            price_id: Some("price_pro".to_string()),
        });

        let (status, body) = send(
            &app.router,
            get("/billing/checkout/finalize?session_id=cs_1"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "updated");
        assert_eq!(
            app.store.record(user_id).unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_finalize_checkout_errors() {
        let app = test_app();

        let (status, _) = send(&app.router, get("/billing/checkout/finalize")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app.router,
            get("/billing/checkout/finalize?session_id=cs_missing"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "not_found");

        app.gateway.insert_checkout_session(CheckoutSessionDetails {
            session_id: "cs_bad".to_string(),
            ..Default::default()
        });
        let (status, body) = send(
            &app.router,
            get("/billing/checkout/finalize?session_id=cs_bad"),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["kind"], "invalid_checkout");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("contact support"));
    }

    #[tokio::test]
    async fn test_refresh_creates_empty_record() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        let (status, body) = send(
            &app.router,
            post_json(&format!("/billing/users/{user_id}/refresh"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "created");
        assert!(app.store.record(user_id).is_some());
    }

    #[tokio::test]
    async fn test_subscription_includes_entitlements() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        let end = OffsetDateTime::now_utc() + time::Duration::days(10);
        let mut record = LocalSubscriptionRecord::new(user_id).rebound("sub_1", "pro");
        record.status = SubscriptionStatus::Active;
        record.current_period_end = Some(end);
        app.store.seed(record);

        let (status, body) = send(
            &app.router,
            get(&format!("/billing/users/{user_id}/subscription")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert_eq!(body["entitlements"], json!(["pro.access"]));
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_conflicts() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        let (status, body) = send(
            &app.router,
            post_json(
                &format!("/billing/users/{user_id}/cancel"),
                json!({ "reason": "done", "feedback": "unused" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["kind"], "no_active_subscription");
    }

    #[tokio::test]
    async fn test_start_checkout_returns_url() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        app.customers.insert_user(user_id, None, None, Some("cus_1"));

        let (status, body) = send(
            &app.router,
            post_json(
                &format!("/billing/users/{user_id}/checkout"),
                json!({ "plan_id": "pro" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().unwrap().starts_with("https://checkout.mock/"));
        assert_eq!(
            app.gateway.checkout_requests()[0].cancel_url,
            "https://app.test/pricing"
        );

        let (status, body) = send(
            &app.router,
            post_json(
                &format!("/billing/users/{user_id}/checkout"),
                json!({ "plan_id": "enterprise" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"]["kind"], "unknown_plan");
    }

    #[tokio::test]
    async fn test_list_plans() {
        let app = test_app();
        let (status, body) = send(&app.router, get("/billing/plans")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["plan_id"], "pro");
    }
}
