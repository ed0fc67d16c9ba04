//! Subscription invariants
//!
//! Read-only SQL checks over `user_subscriptions`. Run them after a batch sync
//! or a webhook replay to confirm local state is still consistent.
//!
//! Each check returns the violating users with enough context to debug them;
//! none of them writes.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Records in a paid status not synced for this long are reported as stale
const STALE_AFTER_HOURS: i32 = 48;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access or billing is wrong right now
    Critical,
    /// Inconsistent data that needs attention
    High,
    /// Worth investigating
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(checked_at: OffsetDateTime, violations: Vec<InvariantViolation>) -> Self {
        let checks_run = InvariantChecker::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    user_id: Uuid,
    status: String,
    remote_subscription_id: Option<String>,
    plan_id: Option<String>,
    last_synced_at: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct SharedRemoteIdRow {
    remote_subscription_id: String,
    user_ids: Vec<Uuid>,
}

const RECORD_ROW_COLUMNS: &str =
    "s.user_id, s.status, s.remote_subscription_id, s.plan_id, s.last_synced_at";

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(name).await?);
        }

        let summary = InvariantCheckSummary::from_violations(now, violations);
        if summary.healthy {
            tracing::info!(checks = summary.checks_run, "All subscription invariants hold");
        } else {
            tracing::warn!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Subscription invariant violations found"
            );
        }
        Ok(summary)
    }

    async fn fetch_records(&self, condition: &str) -> BillingResult<Vec<RecordRow>> {
        let rows = sqlx::query_as(&format!(
            "SELECT {RECORD_ROW_COLUMNS} FROM user_subscriptions s WHERE {condition} \
             ORDER BY s.user_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Active, trial and past-due records must point at a gateway subscription
    async fn check_paid_status_has_remote_id(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .fetch_records(
                "s.status IN ('active', 'trial', 'past_due') AND s.remote_subscription_id IS NULL",
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_status_has_remote_id".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Record has status '{}' but no remote subscription",
                    row.status
                ),
                context: serde_json::json!({ "status": row.status, "plan_id": row.plan_id }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Only empty and not-yet-synced records may lack a period end
    async fn check_synced_has_period_end(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .fetch_records(
                "s.status NOT IN ('none', 'incomplete') AND s.current_period_end IS NULL",
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "synced_has_period_end".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Record with status '{}' has no period end", row.status),
                context: serde_json::json!({
                    "status": row.status,
                    "remote_subscription_id": row.remote_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// A gateway subscription belongs to at most one user
    async fn check_remote_id_bound_once(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<SharedRemoteIdRow> = sqlx::query_as(
            r#"
            SELECT remote_subscription_id, ARRAY_AGG(user_id ORDER BY user_id) AS user_ids
            FROM user_subscriptions
            WHERE remote_subscription_id IS NOT NULL
            GROUP BY remote_subscription_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "remote_id_bound_once".to_string(),
                description: format!(
                    "Remote subscription {} is bound to {} users",
                    row.remote_subscription_id,
                    row.user_ids.len()
                ),
                context: serde_json::json!({
                    "remote_subscription_id": row.remote_subscription_id,
                }),
                user_ids: row.user_ids,
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Paid records should be reconciled regularly
    async fn check_paid_recently_synced(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .fetch_records(&format!(
                "s.status IN ('active', 'trial', 'past_due') \
                 AND (s.last_synced_at IS NULL \
                      OR s.last_synced_at < NOW() - INTERVAL '{STALE_AFTER_HOURS} hours')"
            ))
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_recently_synced".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Record has not been reconciled in {STALE_AFTER_HOURS} hours"
                ),
                context: serde_json::json!({
                    "status": row.status,
                    "last_synced_at": row.last_synced_at,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Users with a paid status must have a provisioned gateway customer
    async fn check_paid_has_customer(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .fetch_records(
                "s.status IN ('active', 'trial', 'past_due') AND NOT EXISTS ( \
                    SELECT 1 FROM billing_customers c \
                    WHERE c.user_id = s.user_id AND c.remote_customer_id IS NOT NULL)",
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_has_customer".to_string(),
                user_ids: vec![row.user_id],
                description: "Paid record has no gateway customer".to_string(),
                context: serde_json::json!({
                    "status": row.status,
                    "remote_subscription_id": row.remote_subscription_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Bound plans exist in the catalog
    async fn check_plan_in_catalog(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows = self
            .fetch_records(
                "s.plan_id IS NOT NULL AND NOT EXISTS ( \
                    SELECT 1 FROM catalog_plans p WHERE p.plan_id = s.plan_id)",
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "plan_in_catalog".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Record references unknown plan '{}'",
                    row.plan_id.as_deref().unwrap_or_default()
                ),
                context: serde_json::json!({ "plan_id": row.plan_id }),
                severity: ViolationSeverity::Low,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "paid_status_has_remote_id" => self.check_paid_status_has_remote_id().await,
            "synced_has_period_end" => self.check_synced_has_period_end().await,
            "remote_id_bound_once" => self.check_remote_id_bound_once().await,
            "paid_recently_synced" => self.check_paid_recently_synced().await,
            "paid_has_customer" => self.check_paid_has_customer().await,
            "plan_in_catalog" => self.check_plan_in_catalog().await,
            other => Err(BillingError::Config(format!(
                "Unknown invariant check: {other}"
            ))),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "paid_status_has_remote_id",
            "synced_has_period_end",
            "remote_id_bound_once",
            "paid_recently_synced",
            "paid_has_customer",
            "plan_in_catalog",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(invariant: &str, severity: ViolationSeverity) -> InvariantViolation {
        InvariantViolation {
            invariant: invariant.to_string(),
            user_ids: vec![Uuid::new_v4()],
            description: String::new(),
            context: serde_json::Value::Null,
            severity,
        }
    }

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
        assert!(ViolationSeverity::Critical < ViolationSeverity::Low);
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"paid_status_has_remote_id"));
        assert!(checks.contains(&"remote_id_bound_once"));
    }

    #[test]
    fn test_summary_counts_failed_checks_not_violations() {
        let summary = InvariantCheckSummary::from_violations(
            OffsetDateTime::now_utc(),
            vec![
                violation("paid_status_has_remote_id", ViolationSeverity::Critical),
                violation("paid_status_has_remote_id", ViolationSeverity::Critical),
                violation("plan_in_catalog", ViolationSeverity::Low),
            ],
        );
        assert_eq!(summary.checks_run, 6);
        assert_eq!(summary.checks_failed, 2);
        assert_eq!(summary.checks_passed, 4);
        assert!(!summary.healthy);

        let clean = InvariantCheckSummary::from_violations(OffsetDateTime::now_utc(), vec![]);
        assert!(clean.healthy);
        assert_eq!(clean.checks_passed, 6);
    }
}
