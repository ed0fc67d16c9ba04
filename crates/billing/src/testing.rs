//! In-memory doubles for the billing traits
//!
//! Available to this crate's tests and, through the `testing` feature, to
//! downstream crates.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{
    with_session_placeholder, BillingGateway, CancellationFeedback, CheckoutSessionDetails,
    CheckoutSessionRequest, NewCustomer, RemoteStatus, RemoteSubscriptionSnapshot,
};
use crate::customer::{BillingCustomer, CustomerDirectory};
use crate::error::{BillingError, BillingResult};
use crate::store::{CandidateQuery, SubscriptionStore};
use crate::subscriptions::LocalSubscriptionRecord;
use crate::webhooks::EventDedupStore;

pub use crate::catalog::StaticCatalog;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Gateway
// =============================================================================

/// How a scripted gateway call should fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// 5xx-style error, retryable
    Transient,
    /// 4xx-style error, not retryable
    Rejected,
    /// Never completes
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelCall {
    pub remote_id: String,
    pub reason: String,
    pub feedback: CancellationFeedback,
    pub immediate: bool,
}

#[derive(Default)]
struct GatewayState {
    subscriptions: HashMap<String, RemoteSubscriptionSnapshot>,
    sessions: HashMap<String, CheckoutSessionDetails>,
    failures: HashMap<String, ScriptedFailure>,
    cancellations: Vec<CancelCall>,
    created_customers: Vec<NewCustomer>,
    checkout_requests: Vec<CheckoutSessionRequest>,
    get_calls: HashMap<String, usize>,
}

/// Scriptable gateway that records every mutating call
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(&self, snapshot: RemoteSubscriptionSnapshot) {
        lock(&self.state)
            .subscriptions
            .insert(snapshot.remote_id.clone(), snapshot);
    }

    pub fn remove_subscription(&self, remote_id: &str) {
        lock(&self.state).subscriptions.remove(remote_id);
    }

    pub fn subscription(&self, remote_id: &str) -> Option<RemoteSubscriptionSnapshot> {
        lock(&self.state).subscriptions.get(remote_id).cloned()
    }

    pub fn insert_checkout_session(&self, details: CheckoutSessionDetails) {
        lock(&self.state)
            .sessions
            .insert(details.session_id.clone(), details);
    }

    /// Make every call touching `id` (subscription, session or customer) fail
    pub fn fail(&self, id: &str, failure: ScriptedFailure) {
        lock(&self.state).failures.insert(id.to_string(), failure);
    }

    pub fn clear_failure(&self, id: &str) {
        lock(&self.state).failures.remove(id);
    }

    pub fn cancellations(&self) -> Vec<CancelCall> {
        lock(&self.state).cancellations.clone()
    }

    pub fn created_customers(&self) -> Vec<NewCustomer> {
        lock(&self.state).created_customers.clone()
    }

    pub fn checkout_requests(&self) -> Vec<CheckoutSessionRequest> {
        lock(&self.state).checkout_requests.clone()
    }

    pub fn get_calls(&self, remote_id: &str) -> usize {
        lock(&self.state)
            .get_calls
            .get(remote_id)
            .copied()
            .unwrap_or(0)
    }

    async fn scripted(&self, id: &str) -> BillingResult<()> {
        let failure = lock(&self.state).failures.get(id).copied();
        match failure {
            None => Ok(()),
            Some(ScriptedFailure::Transient) => Err(BillingError::gateway(
                "http_503",
                format!("gateway unavailable for {id}"),
                true,
            )),
            Some(ScriptedFailure::Rejected) => Err(BillingError::gateway(
                "http_400",
                format!("gateway rejected {id}"),
                false,
            )),
            Some(ScriptedFailure::Hang) => {
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
                Err(BillingError::gateway("timeout", "hung call returned", true))
            }
        }
    }

    fn missing(resource: &'static str, id: &str) -> BillingError {
        BillingError::NotFound {
            resource,
            id: id.to_string(),
        }
    }
}

#[async_trait]
impl BillingGateway for MockGateway {
    async fn create_customer(&self, customer: NewCustomer) -> BillingResult<String> {
        let mut state = lock(&self.state);
        state.created_customers.push(customer);
        Ok(format!("cus_mock_{}", state.created_customers.len()))
    }

    async fn start_checkout_session(
        &self,
        mut request: CheckoutSessionRequest,
    ) -> BillingResult<String> {
        self.scripted(&request.customer_remote_id).await?;
        request.success_url = with_session_placeholder(&request.success_url);
        let mut state = lock(&self.state);
        state.checkout_requests.push(request);
        Ok(format!(
            "https://checkout.mock/pay/cs_mock_{}",
            state.checkout_requests.len()
        ))
    }

    async fn get_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionDetails> {
        self.scripted(session_id).await?;
        lock(&self.state)
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| Self::missing("checkout_session", session_id))
    }

    async fn get_subscription(
        &self,
        remote_id: &str,
    ) -> BillingResult<RemoteSubscriptionSnapshot> {
        *lock(&self.state)
            .get_calls
            .entry(remote_id.to_string())
            .or_default() += 1;
        self.scripted(remote_id).await?;
        lock(&self.state)
            .subscriptions
            .get(remote_id)
            .cloned()
            .ok_or_else(|| Self::missing("subscription", remote_id))
    }

    async fn list_active_subscriptions(
        &self,
        customer_remote_id: &str,
    ) -> BillingResult<Vec<RemoteSubscriptionSnapshot>> {
        self.scripted(customer_remote_id).await?;
        let state = lock(&self.state);
        let mut subs: Vec<RemoteSubscriptionSnapshot> = state
            .subscriptions
            .values()
            .filter(|s| s.customer_remote_id == customer_remote_id)
            .filter(|s| s.status == RemoteStatus::Active)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        Ok(subs)
    }

    async fn cancel_subscription(
        &self,
        remote_id: &str,
        reason: &str,
        feedback: CancellationFeedback,
        immediate: bool,
    ) -> BillingResult<RemoteSubscriptionSnapshot> {
        lock(&self.state).cancellations.push(CancelCall {
            remote_id: remote_id.to_string(),
            reason: reason.to_string(),
            feedback,
            immediate,
        });
        self.scripted(remote_id).await?;

        let mut state = lock(&self.state);
        let sub = state
            .subscriptions
            .get_mut(remote_id)
            .ok_or_else(|| Self::missing("subscription", remote_id))?;
        if immediate {
            sub.status = RemoteStatus::Canceled;
        } else {
            sub.cancel_at_period_end = true;
        }
        Ok(sub.clone())
    }
}

// =============================================================================
// Stores
// =============================================================================

/// Subscription store with the same compare-and-swap semantics as Postgres
#[derive(Clone, Default)]
pub struct MemorySubscriptionStore {
    records: Arc<Mutex<HashMap<Uuid, LocalSubscriptionRecord>>>,
    fail_select: Arc<Mutex<bool>>,
    failing_remote_ids: Arc<Mutex<HashSet<String>>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is, bypassing validation
    pub fn seed(&self, record: LocalSubscriptionRecord) {
        lock(&self.records).insert(record.user_id, record);
    }

    pub fn record(&self, user_id: Uuid) -> Option<LocalSubscriptionRecord> {
        lock(&self.records).get(&user_id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make candidate selection fail, as if the database were unreachable
    pub fn fail_select(&self, fail: bool) {
        *lock(&self.fail_select) = fail;
    }

    /// Make lookups by this gateway subscription id fail
    pub fn fail_remote_lookup(&self, remote_subscription_id: &str) {
        lock(&self.failing_remote_ids).insert(remote_subscription_id.to_string());
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<LocalSubscriptionRecord>> {
        Ok(self.record(user_id))
    }

    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<(LocalSubscriptionRecord, bool)> {
        let mut records = lock(&self.records);
        if let Some(existing) = records.get(&user_id) {
            return Ok((existing.clone(), false));
        }
        let record = LocalSubscriptionRecord::new(user_id);
        records.insert(user_id, record.clone());
        Ok((record, true))
    }

    async fn save(&self, record: &LocalSubscriptionRecord) -> BillingResult<LocalSubscriptionRecord> {
        record.validate()?;
        let mut records = lock(&self.records);
        let current = records
            .get(&record.user_id)
            .ok_or(BillingError::LockContention(record.user_id))?;
        if current.version != record.version {
            return Err(BillingError::LockContention(record.user_id));
        }
        let mut stored = record.clone();
        stored.version += 1;
        records.insert(stored.user_id, stored.clone());
        Ok(stored)
    }

    async fn mark_synced(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        if let Some(record) = lock(&self.records).get_mut(&user_id) {
            record.last_synced_at = Some(at);
        }
        Ok(())
    }

    async fn find_by_remote_id(
        &self,
        remote_subscription_id: &str,
    ) -> BillingResult<Option<LocalSubscriptionRecord>> {
        if lock(&self.failing_remote_ids).contains(remote_subscription_id) {
            return Err(BillingError::Database("connection reset".to_string()));
        }
        Ok(lock(&self.records)
            .values()
            .find(|r| r.remote_subscription_id.as_deref() == Some(remote_subscription_id))
            .cloned())
    }

    async fn select(&self, query: &CandidateQuery) -> BillingResult<Vec<Uuid>> {
        if *lock(&self.fail_select) {
            return Err(BillingError::Database("connection refused".to_string()));
        }
        let mut ids: Vec<Uuid> = lock(&self.records)
            .values()
            .filter(|r| query.matches(r))
            .map(|r| r.user_id)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Clone, Default)]
pub struct MemoryCustomerDirectory {
    customers: Arc<Mutex<HashMap<Uuid, BillingCustomer>>>,
}

impl MemoryCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(
        &self,
        user_id: Uuid,
        name: Option<&str>,
        email: Option<&str>,
        remote_customer_id: Option<&str>,
    ) {
        lock(&self.customers).insert(
            user_id,
            BillingCustomer {
                user_id,
                name: name.map(str::to_string),
                email: email.map(str::to_string),
                remote_customer_id: remote_customer_id.map(str::to_string),
                lifetime_value_cents: 0,
            },
        );
    }

    pub fn lifetime_value(&self, user_id: Uuid) -> i64 {
        lock(&self.customers)
            .get(&user_id)
            .map(|c| c.lifetime_value_cents)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CustomerDirectory for MemoryCustomerDirectory {
    async fn user_for_customer(&self, customer_remote_id: &str) -> BillingResult<Option<Uuid>> {
        Ok(lock(&self.customers)
            .values()
            .find(|c| c.remote_customer_id.as_deref() == Some(customer_remote_id))
            .map(|c| c.user_id))
    }

    async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<Option<BillingCustomer>> {
        Ok(lock(&self.customers).get(&user_id).cloned())
    }

    async fn list_billable_customers(&self) -> BillingResult<Vec<String>> {
        let mut ids: Vec<String> = lock(&self.customers)
            .values()
            .filter_map(|c| c.remote_customer_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn set_remote_customer_id(&self, user_id: Uuid, remote_id: &str) -> BillingResult<()> {
        let mut customers = lock(&self.customers);
        let customer = customers
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::UnknownCustomer(user_id.to_string()))?;
        customer.remote_customer_id = Some(remote_id.to_string());
        Ok(())
    }

    async fn add_lifetime_value(&self, user_id: Uuid, amount_cents: i64) -> BillingResult<()> {
        if let Some(customer) = lock(&self.customers).get_mut(&user_id) {
            customer.lifetime_value_cents += amount_cents;
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryDedupStore {
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        lock(&self.claimed).contains(key)
    }
}

#[async_trait]
impl EventDedupStore for MemoryDedupStore {
    async fn claim(&self, key: &str, _event_type: &str) -> BillingResult<bool> {
        Ok(lock(&self.claimed).insert(key.to_string()))
    }

    async fn release(&self, key: &str) -> BillingResult<()> {
        lock(&self.claimed).remove(key);
        Ok(())
    }
}

/// Active snapshot for `remote_id` owned by `customer`, period ending at `period_end`
pub fn active_snapshot(
    remote_id: &str,
    customer: &str,
    price_id: &str,
    period_end: OffsetDateTime,
) -> RemoteSubscriptionSnapshot {
    RemoteSubscriptionSnapshot {
        remote_id: remote_id.to_string(),
        status: RemoteStatus::Active,
        current_period_start: period_end - time::Duration::days(30),
        current_period_end: period_end,
        cancel_at_period_end: false,
        customer_remote_id: customer.to_string(),
        price_id: Some(price_id.to_string()),
    }
}
