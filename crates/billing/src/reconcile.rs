//! Subscription reconciliation
//!
//! Reads the gateway's view of a user's subscription and overwrites the local
//! record to match it. The gateway is authoritative here; nothing local is ever
//! pushed back except through explicit mutations such as [`ReconciliationEngine::cancel_for_user`].
//!
//! Writes for one user are serialized by an in-process lock and, across
//! processes, by the store's version compare-and-swap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::client::{BillingGateway, CancellationFeedback, RemoteSubscriptionSnapshot};
use crate::customer::CustomerDirectory;
use crate::error::{BillingError, BillingResult};
use crate::store::{CandidateQuery, SubscriptionStore};
use crate::subscriptions::LocalSubscriptionRecord;

pub const DANGLING_CANCEL_REASON: &str = "Dangling active subscription";

/// Remote subscriptions younger than this are left alone by the sweep, since a
/// checkout may not have been finalized yet
const DANGLING_GRACE: time::Duration = time::Duration::hours(1);

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Concurrent users in a batch
    pub workers: usize,
    /// Upper bound for one user's reconciliation, gateway retries included
    pub user_timeout: Duration,
    /// Wait before the single retry when a user's lock is held
    pub lock_backoff: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            user_timeout: Duration::from_secs(45),
            lock_backoff: Duration::from_millis(250),
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();
        let workers: usize =
            crate::client::parse_env("RECONCILE_WORKERS", defaults.workers)?;
        let timeout_secs: u64 = crate::client::parse_env(
            "RECONCILE_USER_TIMEOUT_SECS",
            defaults.user_timeout.as_secs(),
        )?;
        let backoff_ms: u64 = crate::client::parse_env(
            "RECONCILE_LOCK_BACKOFF_MS",
            defaults.lock_backoff.as_millis() as u64,
        )?;

        if workers == 0 {
            return Err(BillingError::Config(
                "RECONCILE_WORKERS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            workers,
            user_timeout: Duration::from_secs(timeout_secs),
            lock_backoff: Duration::from_millis(backoff_ms),
        })
    }
}

// =============================================================================
// Results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Updated,
    Unchanged,
    Created,
    OrphanCancelled,
    Error,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Updated => "updated",
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::OrphanCancelled => "orphan_cancelled",
            ReconcileOutcome::Error => "error",
        }
    }
}

impl std::fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub user_id: Uuid,
    pub outcome: ReconcileOutcome,
    pub detail: Option<String>,
}

impl ReconciliationResult {
    fn new(user_id: Uuid, outcome: ReconcileOutcome, detail: Option<String>) -> Self {
        Self {
            user_id,
            outcome,
            detail,
        }
    }

    pub fn error(user_id: Uuid, error: &BillingError) -> Self {
        Self::new(
            user_id,
            ReconcileOutcome::Error,
            Some(format!("{}: {}", error.kind(), error)),
        )
    }

    pub fn is_error(&self) -> bool {
        self.outcome == ReconcileOutcome::Error
    }
}

/// Outcome counts for a batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub total: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub created: usize,
    pub orphan_cancelled: usize,
    pub errors: usize,
}

impl SyncReport {
    pub fn from_results(results: &[ReconciliationResult]) -> Self {
        let mut report = SyncReport {
            total: results.len(),
            ..Default::default()
        };
        for result in results {
            match result.outcome {
                ReconcileOutcome::Updated => report.updated += 1,
                ReconcileOutcome::Unchanged => report.unchanged += 1,
                ReconcileOutcome::Created => report.created += 1,
                ReconcileOutcome::OrphanCancelled => report.orphan_cancelled += 1,
                ReconcileOutcome::Error => report.errors += 1,
            }
        }
        report
    }

    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }
}

// =============================================================================
// Batch selection
// =============================================================================

/// Population selector for a batch run. Window selectors are mutually exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFilter {
    pub user_ids: Option<Vec<Uuid>>,
    pub active_only: bool,
    /// Period ends within the next N days
    pub days_left: Option<u32>,
    /// Period ended within the last N days
    pub days_ago: Option<u32>,
    /// Period ends between now + day_start and now + day_end days
    pub day_start: Option<i64>,
    pub day_end: Option<i64>,
}

impl BatchFilter {
    pub fn to_query(&self, now: OffsetDateTime) -> BillingResult<CandidateQuery> {
        let has_range = self.day_start.is_some() || self.day_end.is_some();
        let selectors = [self.days_left.is_some(), self.days_ago.is_some(), has_range]
            .into_iter()
            .filter(|set| *set)
            .count();
        if selectors > 1 {
            return Err(BillingError::InvalidFilter(
                "days_left, days_ago and day_start/day_end cannot be combined".to_string(),
            ));
        }

        let window = if let Some(days) = self.days_left {
            Some((now, now + time::Duration::days(i64::from(days))))
        } else if let Some(days) = self.days_ago {
            Some((now - time::Duration::days(i64::from(days)), now))
        } else if has_range {
            let (Some(start), Some(end)) = (self.day_start, self.day_end) else {
                return Err(BillingError::InvalidFilter(
                    "day_start and day_end must be given together".to_string(),
                ));
            };
            if start > end {
                return Err(BillingError::InvalidFilter(format!(
                    "day_start ({start}) is after day_end ({end})"
                )));
            }
            Some((now + time::Duration::days(start), now + time::Duration::days(end)))
        } else {
            None
        };

        Ok(CandidateQuery {
            require_remote_id: self.active_only || window.is_some() || self.user_ids.is_none(),
            user_ids: self.user_ids.clone(),
            period_end_between: window,
        })
    }
}

// =============================================================================
// Per-user locks
// =============================================================================

/// In-process per-user mutexes. Entries nobody holds are pruned on acquire.
#[derive(Default)]
pub(crate) struct UserLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    fn slot(&self, user_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(user_id).or_default().clone()
    }

    /// Take the user's lock, backing off once if it is held
    pub(crate) async fn acquire(
        &self,
        user_id: Uuid,
        backoff: Duration,
    ) -> BillingResult<OwnedMutexGuard<()>> {
        if let Ok(guard) = self.slot(user_id).try_lock_owned() {
            return Ok(guard);
        }

        tracing::debug!(user_id = %user_id, "Subscription lock held, backing off");
        tokio::time::sleep(backoff).await;

        self.slot(user_id)
            .try_lock_owned()
            .map_err(|_| BillingError::LockContention(user_id))
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Cancellation requested by the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    pub feedback: CancellationFeedback,
    /// End now instead of at period end
    #[serde(default)]
    pub immediate: bool,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    pub(crate) store: Arc<dyn SubscriptionStore>,
    pub(crate) gateway: Arc<dyn BillingGateway>,
    pub(crate) catalog: Arc<dyn PlanCatalog>,
    pub(crate) customers: Arc<dyn CustomerDirectory>,
    pub(crate) locks: Arc<UserLocks>,
    pub(crate) config: ReconcileConfig,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        gateway: Arc<dyn BillingGateway>,
        catalog: Arc<dyn PlanCatalog>,
        customers: Arc<dyn CustomerDirectory>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            customers,
            locks: Arc::new(UserLocks::default()),
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn PlanCatalog> {
        &self.catalog
    }

    /// Current record for a user, created empty if missing
    pub async fn subscription(&self, user_id: Uuid) -> BillingResult<LocalSubscriptionRecord> {
        Ok(self.store.get_or_create(user_id).await?.0)
    }

    /// Reconcile one user. Failures are folded into an `error` outcome.
    pub async fn reconcile(&self, user_id: Uuid) -> ReconciliationResult {
        match self.try_reconcile(user_id).await {
            Ok(result) => result,
            Err(e) => {
                if e.is_data_integrity() {
                    tracing::error!(user_id = %user_id, error = %e, "Reconciliation failed");
                } else {
                    tracing::warn!(user_id = %user_id, error = %e, "Reconciliation failed");
                }
                ReconciliationResult::error(user_id, &e)
            }
        }
    }

    /// Reconcile one user, surfacing the failure instead of folding it
    pub async fn try_reconcile(&self, user_id: Uuid) -> BillingResult<ReconciliationResult> {
        let _guard = self.locks.acquire(user_id, self.config.lock_backoff).await?;
        self.reconcile_locked(user_id).await
    }

    /// Reconcile with the user's lock already held
    pub(crate) async fn reconcile_locked(
        &self,
        user_id: Uuid,
    ) -> BillingResult<ReconciliationResult> {
        let (record, created) = self.store.get_or_create(user_id).await?;

        let Some(remote_id) = record.remote_subscription_id.clone() else {
            let outcome = if created {
                ReconcileOutcome::Created
            } else {
                ReconcileOutcome::Unchanged
            };
            return Ok(ReconciliationResult::new(
                user_id,
                outcome,
                Some("no remote subscription bound".to_string()),
            ));
        };

        let snapshot = match self.gateway.get_subscription(&remote_id).await {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() => return self.cancel_orphan(record, &remote_id).await,
            Err(e) => return Err(e),
        };

        let now = OffsetDateTime::now_utc();
        let plan_id = self.resolve_plan(user_id, &snapshot).await?;
        let mut next = record.with_snapshot(&snapshot, plan_id.as_deref());
        let changed = record.differences(&next);

        if changed.is_empty() {
            self.store.mark_synced(user_id, now).await?;
            tracing::debug!(user_id = %user_id, subscription_id = %remote_id, "Subscription unchanged");
            return Ok(ReconciliationResult::new(
                user_id,
                ReconcileOutcome::Unchanged,
                None,
            ));
        }

        next.last_synced_at = Some(now);
        self.store.save(&next).await?;

        let detail = changed.join(", ");
        tracing::info!(
            user_id = %user_id,
            subscription_id = %remote_id,
            status = %next.status,
            changed = %detail,
            "Subscription updated from gateway"
        );
        Ok(ReconciliationResult::new(
            user_id,
            ReconcileOutcome::Updated,
            Some(detail),
        ))
    }

    /// Catalog plan for the snapshot's price, if the price is known
    async fn resolve_plan(
        &self,
        user_id: Uuid,
        snapshot: &RemoteSubscriptionSnapshot,
    ) -> BillingResult<Option<String>> {
        let Some(price_id) = snapshot.price_id.as_deref() else {
            return Ok(None);
        };
        match self.catalog.plan_by_price(price_id).await? {
            Some(plan) => Ok(Some(plan.plan_id)),
            None => {
                tracing::warn!(
                    user_id = %user_id,
                    price_id,
                    "Gateway price not in catalog, keeping current plan"
                );
                Ok(None)
            }
        }
    }

    async fn cancel_orphan(
        &self,
        record: LocalSubscriptionRecord,
        remote_id: &str,
    ) -> BillingResult<ReconciliationResult> {
        let now = OffsetDateTime::now_utc();
        let mut next = record.orphan_cancelled(now);
        next.last_synced_at = Some(now);
        self.store.save(&next).await?;

        tracing::warn!(
            user_id = %record.user_id,
            subscription_id = %remote_id,
            "Remote subscription no longer exists, local record cancelled"
        );
        Ok(ReconciliationResult::new(
            record.user_id,
            ReconcileOutcome::OrphanCancelled,
            Some(format!("remote subscription {remote_id} not found")),
        ))
    }

    async fn reconcile_with_timeout(&self, user_id: Uuid) -> ReconciliationResult {
        match tokio::time::timeout(self.config.user_timeout, self.reconcile(user_id)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    user_id = %user_id,
                    timeout_secs = self.config.user_timeout.as_secs(),
                    "Reconciliation timed out"
                );
                ReconciliationResult::new(
                    user_id,
                    ReconcileOutcome::Error,
                    Some(format!(
                        "timeout: reconciliation exceeded {}s",
                        self.config.user_timeout.as_secs()
                    )),
                )
            }
        }
    }

    /// Reconcile every user selected by `filter` on a bounded worker pool.
    ///
    /// Only a failure to load the candidate set is an error; per-user failures
    /// are reported in the results, which keep candidate order.
    pub async fn reconcile_batch(
        &self,
        filter: &BatchFilter,
    ) -> BillingResult<Vec<ReconciliationResult>> {
        let query = filter.to_query(OffsetDateTime::now_utc())?;
        let user_ids = self.store.select(&query).await?;

        tracing::info!(
            candidates = user_ids.len(),
            workers = self.config.workers,
            "Starting reconciliation batch"
        );

        let results = stream::iter(user_ids)
            .map(|user_id| self.reconcile_with_timeout(user_id))
            .buffered(self.config.workers.max(1))
            .collect::<Vec<_>>()
            .await;

        Ok(results)
    }

    /// Cancel gateway subscriptions that no local record references.
    /// Returns how many were cancelled.
    pub async fn sweep_dangling_remote_subscriptions(&self) -> BillingResult<usize> {
        let customers = self.customers.list_billable_customers().await?;
        let cutoff = OffsetDateTime::now_utc() - DANGLING_GRACE;
        let mut cancelled = 0;

        tracing::info!(customers = customers.len(), "Sweeping dangling subscriptions");

        for customer_id in customers {
            let subscriptions = match self.gateway.list_active_subscriptions(&customer_id).await {
                Ok(subs) => subs,
                Err(e) => {
                    tracing::warn!(
                        customer_id = %customer_id,
                        error = %e,
                        "Could not list subscriptions, skipping customer"
                    );
                    continue;
                }
            };

            for sub in subscriptions {
                if sub.current_period_start > cutoff {
                    continue;
                }
                match self.store.find_by_remote_id(&sub.remote_id).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            customer_id = %customer_id,
                            subscription_id = %sub.remote_id,
                            error = %e,
                            "Could not look up local record, skipping subscription"
                        );
                        continue;
                    }
                }

                match self
                    .gateway
                    .cancel_subscription(
                        &sub.remote_id,
                        DANGLING_CANCEL_REASON,
                        CancellationFeedback::Other,
                        true,
                    )
                    .await
                {
                    Ok(_) => {
                        cancelled += 1;
                        tracing::info!(
                            customer_id = %customer_id,
                            subscription_id = %sub.remote_id,
                            "Cancelled dangling subscription"
                        );
                    }
                    Err(e) => tracing::warn!(
                        customer_id = %customer_id,
                        subscription_id = %sub.remote_id,
                        error = %e,
                        "Failed to cancel dangling subscription"
                    ),
                }
            }
        }

        Ok(cancelled)
    }

    /// User-initiated cancellation, immediate or at period end
    pub async fn cancel_for_user(
        &self,
        user_id: Uuid,
        request: CancelRequest,
    ) -> BillingResult<LocalSubscriptionRecord> {
        let _guard = self.locks.acquire(user_id, self.config.lock_backoff).await?;

        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or(BillingError::NoActiveSubscription(user_id))?;
        let remote_id = match &record.remote_subscription_id {
            Some(id) if record.status.is_paid() => id.clone(),
            _ => return Err(BillingError::NoActiveSubscription(user_id)),
        };

        let snapshot = match self
            .gateway
            .cancel_subscription(&remote_id, &request.reason, request.feedback, request.immediate)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_not_found() => {
                self.cancel_orphan(record, &remote_id).await?;
                return Err(BillingError::NoActiveSubscription(user_id));
            }
            Err(e) => return Err(e),
        };

        let mut next = record.with_snapshot(&snapshot, None);
        next.user_cancelled = true;
        next.last_synced_at = Some(OffsetDateTime::now_utc());
        let saved = self.store.save(&next).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %remote_id,
            immediate = request.immediate,
            feedback = %request.feedback,
            "User cancelled subscription"
        );
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_window_selectors_are_exclusive() {
        let now = datetime!(2026-06-01 0:00 UTC);
        let filter = BatchFilter {
            days_left: Some(7),
            days_ago: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            filter.to_query(now),
            Err(BillingError::InvalidFilter(_))
        ));

        let filter = BatchFilter {
            days_left: Some(7),
            day_start: Some(1),
            day_end: Some(2),
            ..Default::default()
        };
        assert!(filter.to_query(now).is_err());
    }

    #[test]
    fn test_window_bounds() {
        let now = datetime!(2026-06-01 0:00 UTC);

        let q = BatchFilter {
            days_left: Some(7),
            ..Default::default()
        }
        .to_query(now)
        .unwrap();
        assert_eq!(q.period_end_between, Some((now, datetime!(2026-06-08 0:00 UTC))));
        assert!(q.require_remote_id);

        let q = BatchFilter {
            days_ago: Some(2),
            ..Default::default()
        }
        .to_query(now)
        .unwrap();
        assert_eq!(q.period_end_between, Some((datetime!(2026-05-30 0:00 UTC), now)));

        let q = BatchFilter {
            day_start: Some(3),
            day_end: Some(5),
            ..Default::default()
        }
        .to_query(now)
        .unwrap();
        assert_eq!(
            q.period_end_between,
            Some((datetime!(2026-06-04 0:00 UTC), datetime!(2026-06-06 0:00 UTC)))
        );
    }

    #[test]
    fn test_day_range_validation() {
        let now = OffsetDateTime::now_utc();
        let half = BatchFilter {
            day_start: Some(3),
            ..Default::default()
        };
        assert!(half.to_query(now).is_err());

        let inverted = BatchFilter {
            day_start: Some(5),
            day_end: Some(3),
            ..Default::default()
        };
        assert!(inverted.to_query(now).is_err());
    }

    #[test]
    fn test_id_list_without_window_skips_remote_requirement() {
        let ids = vec![Uuid::new_v4()];
        let q = BatchFilter {
            user_ids: Some(ids.clone()),
            ..Default::default()
        }
        .to_query(OffsetDateTime::now_utc())
        .unwrap();
        assert!(!q.require_remote_id);
        assert_eq!(q.user_ids, Some(ids));

        let q = BatchFilter::default()
            .to_query(OffsetDateTime::now_utc())
            .unwrap();
        assert!(q.require_remote_id);
        assert_eq!(q.period_end_between, None);
    }

    #[test]
    fn test_sync_report_counts() {
        let id = Uuid::new_v4();
        let results = vec![
            ReconciliationResult::new(id, ReconcileOutcome::Updated, None),
            ReconciliationResult::new(id, ReconcileOutcome::Unchanged, None),
            ReconciliationResult::new(id, ReconcileOutcome::Unchanged, None),
            ReconciliationResult::error(id, &BillingError::gateway("http_503", "down", true)),
        ];
        let report = SyncReport::from_results(&results);
        assert_eq!(report.total, 4);
        assert_eq!(report.updated, 1);
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.errors, 1);
        assert!(report.has_errors());
        assert!(results[3]
            .detail
            .as_deref()
            .unwrap()
            .starts_with("gateway_error"));
    }

    #[tokio::test]
    async fn test_user_lock_contention_after_backoff() {
        let locks = UserLocks::default();
        let user_id = Uuid::new_v4();
        let held = locks.acquire(user_id, Duration::from_millis(1)).await.unwrap();

        let err = locks
            .acquire(user_id, Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::LockContention(id) if id == user_id));

        drop(held);
        assert!(locks.acquire(user_id, Duration::from_millis(1)).await.is_ok());
        assert!(locks.acquire(Uuid::new_v4(), Duration::from_millis(1)).await.is_ok());
    }
}
