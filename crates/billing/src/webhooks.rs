//! Gateway webhook intake
//!
//! Subscription events trigger a reconciliation of the affected user, paid
//! invoices add to the customer's lifetime value, and completed checkouts are
//! finalized. Delivery is at-least-once, so every handler is idempotent:
//! reconciliation by construction, lifetime value through an event-id claim.

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::checkout::CheckoutService;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{ReconciliationEngine, ReconciliationResult};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Check a `t=...,v1=...` signature header against the raw payload
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in webhook signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if now_unix.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        tracing::warn!(
            timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());

    let matched = signatures
        .iter()
        .any(|sig| bool::from(expected.as_bytes().ct_eq(sig.as_bytes())));
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// The structurally validated part of a gateway event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn from_slice(payload: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| BillingError::InvalidWebhookPayload(e.to_string()))
    }

    fn object_str(&self, field: &str) -> Option<&str> {
        self.data.object.get(field).and_then(|v| v.as_str())
    }

    /// `customer` may arrive as an id or an expanded object
    fn customer_id(&self) -> Option<&str> {
        match self.data.object.get("customer")? {
            serde_json::Value::String(id) => Some(id),
            serde_json::Value::Object(obj) => obj.get("id").and_then(|v| v.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Reconciled(ReconciliationResult),
    Finalized(ReconciliationResult),
    LifetimeValueAdded { user_id: Uuid, amount_cents: i64 },
    Duplicate,
    Ignored,
}

/// Claims on already-processed events
#[async_trait]
pub trait EventDedupStore: Send + Sync {
    /// True if this call claimed `key`; false if it was already claimed
    async fn claim(&self, key: &str, event_type: &str) -> BillingResult<bool>;

    /// Give up a claim whose side effect did not happen
    async fn release(&self, key: &str) -> BillingResult<()>;
}

/// Dedup store over `processed_webhook_events`
#[derive(Clone)]
pub struct PgDedupStore {
    pool: PgPool,
}

impl PgDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventDedupStore for PgDedupStore {
    async fn claim(&self, key: &str, event_type: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(event_type)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM processed_webhook_events WHERE event_id = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub struct WebhookHandler {
    engine: Arc<ReconciliationEngine>,
    checkout: CheckoutService,
    dedup: Arc<dyn EventDedupStore>,
}

impl WebhookHandler {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        checkout: CheckoutService,
        dedup: Arc<dyn EventDedupStore>,
    ) -> Self {
        Self {
            engine,
            checkout,
            dedup,
        }
    }

    pub async fn handle(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Handling webhook event");

        if event.event_type.starts_with("customer.subscription.") {
            self.handle_subscription_event(event).await
        } else if event.event_type.starts_with("invoice.") {
            self.handle_invoice_event(event).await
        } else if event.event_type == "checkout.session.completed" {
            let session_id = event.object_str("id").ok_or_else(|| {
                BillingError::InvalidWebhookPayload("checkout session without id".to_string())
            })?;
            let result = self.checkout.finalize_checkout(session_id).await?;
            Ok(WebhookOutcome::Finalized(result))
        } else {
            tracing::debug!(event_type = %event.event_type, "Ignoring webhook event");
            Ok(WebhookOutcome::Ignored)
        }
    }

    async fn user_for_event(&self, event: &WebhookEvent) -> BillingResult<Option<Uuid>> {
        let customer_id = event.customer_id().ok_or_else(|| {
            BillingError::InvalidWebhookPayload(format!("{} without customer", event.event_type))
        })?;
        let user_id = self.engine.customers.user_for_customer(customer_id).await?;
        if user_id.is_none() {
            tracing::warn!(
                event_id = %event.id,
                customer_id,
                "Webhook customer has no local user"
            );
        }
        Ok(user_id)
    }

    async fn handle_subscription_event(
        &self,
        event: &WebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user_id) = self.user_for_event(event).await? else {
            return Ok(WebhookOutcome::Ignored);
        };
        // Errors propagate so the gateway redelivers
        let result = self.engine.try_reconcile(user_id).await?;
        Ok(WebhookOutcome::Reconciled(result))
    }

    async fn handle_invoice_event(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let amount_cents = event
            .data
            .object
            .get("amount_paid")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        if amount_cents <= 0 {
            return Ok(WebhookOutcome::Ignored);
        }

        let Some(user_id) = self.user_for_event(event).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        if !self.dedup.claim(&event.id, &event.event_type).await? {
            tracing::info!(event_id = %event.id, "Duplicate invoice event, skipping");
            return Ok(WebhookOutcome::Duplicate);
        }

        if let Err(e) = self
            .engine
            .customers
            .add_lifetime_value(user_id, amount_cents)
            .await
        {
            if let Err(release_err) = self.dedup.release(&event.id).await {
                tracing::error!(
                    event_id = %event.id,
                    error = %release_err,
                    "Failed to release webhook claim, redelivery will be skipped"
                );
            }
            return Err(e);
        }

        tracing::info!(user_id = %user_id, amount_cents, "Added to lifetime value");
        Ok(WebhookOutcome::LifetimeValueAdded {
            user_id,
            amount_cents,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        format!(
            "t={timestamp},v1={}",
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_valid_signature() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, "whsec_test", 1_700_000_000);
        assert!(verify_signature(payload, &header, "whsec_test", 1_700_000_100).is_ok());
    }

    #[test]
    fn test_signature_rejects_tampered_payload() {
        let header = sign(br#"{"id":"evt_1"}"#, "whsec_test", 1_700_000_000);
        assert!(matches!(
            verify_signature(br#"{"id":"evt_2"}"#, &header, "whsec_test", 1_700_000_000),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_signature_rejects_stale_timestamp() {
        let payload = b"{}";
        let header = sign(payload, "whsec_test", 1_700_000_000);
        assert!(verify_signature(payload, &header, "whsec_test", 1_700_000_301).is_err());
    }

    #[test]
    fn test_signature_rejects_extreme_timestamps() {
        for timestamp in [i64::MIN, i64::MAX] {
            let header = format!("t={timestamp},v1=deadbeef");
            assert!(matches!(
                verify_signature(b"{}", &header, "whsec_test", 1_700_000_000),
                Err(BillingError::WebhookSignatureInvalid)
            ));
        }
        let header = sign(b"{}", "whsec_test", 0);
        assert!(matches!(
            verify_signature(b"{}", &header, "whsec_test", i64::MIN),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn test_signature_accepts_any_v1() {
        let payload = b"{}";
        let good = sign(payload, "whsec_new", 1_700_000_000);
        let good_sig = good.split_once("v1=").unwrap().1;
        let header = format!("t=1700000000,v1=deadbeef,v1={good_sig}");
        assert!(verify_signature(payload, &header, "whsec_new", 1_700_000_000).is_ok());
    }

    #[test]
    fn test_signature_header_must_be_complete() {
        assert!(verify_signature(b"{}", "v1=abc", "whsec", 0).is_err());
        assert!(verify_signature(b"{}", "t=0", "whsec", 0).is_err());
    }

    #[test]
    fn test_event_customer_forms() {
        let event = WebhookEvent::from_slice(
            br#"{"id":"evt_1","type":"invoice.paid","data":{"object":{"customer":"cus_1","amount_paid":900}}}"#,
        )
        .unwrap();
        assert_eq!(event.customer_id(), Some("cus_1"));

        let expanded = WebhookEvent::from_slice(
            br#"{"id":"evt_2","type":"customer.subscription.updated","data":{"object":{"customer":{"id":"cus_2"}}}}"#,
        )
        .unwrap();
        assert_eq!(expanded.customer_id(), Some("cus_2"));

        assert!(matches!(
            WebhookEvent::from_slice(br#"{"type":"x"}"#),
            Err(BillingError::InvalidWebhookPayload(_))
        ));
    }
}
