//! Subscription record repository
//!
//! Every write is a compare-and-swap on `version`: a save that raced with
//! another writer affects zero rows and is reported as lock contention,
//! leaving the winning write intact.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{LocalSubscriptionRecord, SubscriptionStatus};

/// Which records a batch run should visit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateQuery {
    pub user_ids: Option<Vec<Uuid>>,
    pub require_remote_id: bool,
    /// Inclusive bounds on `current_period_end`
    pub period_end_between: Option<(OffsetDateTime, OffsetDateTime)>,
}

impl CandidateQuery {
    pub fn matches(&self, record: &LocalSubscriptionRecord) -> bool {
        if let Some(ids) = &self.user_ids {
            if !ids.contains(&record.user_id) {
                return false;
            }
        }
        if self.require_remote_id && record.remote_subscription_id.is_none() {
            return false;
        }
        if let Some((from, to)) = self.period_end_between {
            match record.current_period_end {
                Some(end) if end >= from && end <= to => {}
                _ => return false,
            }
        }
        true
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<LocalSubscriptionRecord>>;

    /// Load the record, creating an empty one if missing. The flag is true when
    /// this call created it.
    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<(LocalSubscriptionRecord, bool)>;

    /// Validate and write `record` if its `version` is still current. Returns the
    /// stored record with the bumped version.
    async fn save(&self, record: &LocalSubscriptionRecord) -> BillingResult<LocalSubscriptionRecord>;

    /// Touch `last_synced_at` only
    async fn mark_synced(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<()>;

    async fn find_by_remote_id(
        &self,
        remote_subscription_id: &str,
    ) -> BillingResult<Option<LocalSubscriptionRecord>>;

    /// User ids matching `query`, ordered by user id
    async fn select(&self, query: &CandidateQuery) -> BillingResult<Vec<Uuid>>;
}

#[derive(Debug, sqlx::FromRow)]
struct UserSubscriptionRow {
    user_id: Uuid,
    plan_id: Option<String>,
    remote_subscription_id: Option<String>,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    user_cancelled: bool,
    last_synced_at: Option<OffsetDateTime>,
    version: i64,
}

impl TryFrom<UserSubscriptionRow> for LocalSubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: UserSubscriptionRow) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Database(format!(
                "user {} has unknown subscription status {}",
                row.user_id, row.status
            ))
        })?;
        Ok(LocalSubscriptionRecord {
            user_id: row.user_id,
            plan_id: row.plan_id,
            remote_subscription_id: row.remote_subscription_id,
            status,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            user_cancelled: row.user_cancelled,
            last_synced_at: row.last_synced_at,
            version: row.version,
        })
    }
}

const RECORD_COLUMNS: &str = "user_id, plan_id, remote_subscription_id, status, \
                              current_period_start, current_period_end, cancel_at_period_end, \
                              user_cancelled, last_synced_at, version";

/// Postgres-backed store over `user_subscriptions`
#[derive(Clone)]
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn get(&self, user_id: Uuid) -> BillingResult<Option<LocalSubscriptionRecord>> {
        let row: Option<UserSubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM user_subscriptions WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LocalSubscriptionRecord::try_from).transpose()
    }

    async fn get_or_create(&self, user_id: Uuid) -> BillingResult<(LocalSubscriptionRecord, bool)> {
        let inserted: Option<UserSubscriptionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO user_subscriptions (user_id, status)
            VALUES ($1, 'none')
            ON CONFLICT (user_id) DO NOTHING
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            tracing::debug!(user_id = %user_id, "Created empty subscription record");
            return Ok((row.try_into()?, true));
        }

        let existing = self.get(user_id).await?.ok_or_else(|| {
            BillingError::Database(format!("subscription record for {user_id} vanished"))
        })?;
        Ok((existing, false))
    }

    async fn save(&self, record: &LocalSubscriptionRecord) -> BillingResult<LocalSubscriptionRecord> {
        record.validate()?;

        let row: Option<UserSubscriptionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE user_subscriptions SET
                plan_id = $2,
                remote_subscription_id = $3,
                status = $4,
                current_period_start = $5,
                current_period_end = $6,
                cancel_at_period_end = $7,
                user_cancelled = $8,
                last_synced_at = $9,
                version = version + 1,
                updated_at = NOW()
            WHERE user_id = $1 AND version = $10
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(record.user_id)
        .bind(&record.plan_id)
        .bind(&record.remote_subscription_id)
        .bind(record.status.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(record.user_cancelled)
        .bind(record.last_synced_at)
        .bind(record.version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                tracing::warn!(
                    user_id = %record.user_id,
                    expected_version = record.version,
                    "Subscription record modified concurrently, write rejected"
                );
                Err(BillingError::LockContention(record.user_id))
            }
        }
    }

    async fn mark_synced(&self, user_id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        sqlx::query("UPDATE user_subscriptions SET last_synced_at = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_by_remote_id(
        &self,
        remote_subscription_id: &str,
    ) -> BillingResult<Option<LocalSubscriptionRecord>> {
        let row: Option<UserSubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {RECORD_COLUMNS} FROM user_subscriptions WHERE remote_subscription_id = $1"
        ))
        .bind(remote_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(LocalSubscriptionRecord::try_from).transpose()
    }

    async fn select(&self, query: &CandidateQuery) -> BillingResult<Vec<Uuid>> {
        let (from, to) = match query.period_end_between {
            Some((from, to)) => (Some(from), Some(to)),
            None => (None, None),
        };

        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM user_subscriptions
            WHERE ($1::uuid[] IS NULL OR user_id = ANY($1))
              AND (NOT $2 OR remote_subscription_id IS NOT NULL)
              AND ($3::timestamptz IS NULL OR current_period_end >= $3)
              AND ($4::timestamptz IS NULL OR current_period_end <= $4)
            ORDER BY user_id
            "#,
        )
        .bind(query.user_ids.as_deref())
        .bind(query.require_remote_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_candidate_query_window_is_inclusive() {
        let from = datetime!(2026-05-01 0:00 UTC);
        let to = datetime!(2026-05-08 0:00 UTC);
        let query = CandidateQuery {
            user_ids: None,
            require_remote_id: true,
            period_end_between: Some((from, to)),
        };

        let mut record = LocalSubscriptionRecord::new(Uuid::new_v4()).rebound("sub_1", "pro");
        record.current_period_end = Some(to);
        assert!(query.matches(&record));

        record.current_period_end = Some(from);
        assert!(query.matches(&record));

        record.current_period_end = Some(datetime!(2026-05-09 0:00 UTC));
        assert!(!query.matches(&record));

        record.current_period_end = None;
        assert!(!query.matches(&record));
    }

    #[test]
    fn test_candidate_query_requires_remote_id() {
        let query = CandidateQuery {
            require_remote_id: true,
            ..Default::default()
        };
        let record = LocalSubscriptionRecord::new(Uuid::new_v4());
        assert!(!query.matches(&record));
        assert!(CandidateQuery::default().matches(&record));
    }

    #[test]
    fn test_candidate_query_id_list() {
        let keep = Uuid::new_v4();
        let query = CandidateQuery {
            user_ids: Some(vec![keep]),
            ..Default::default()
        };
        assert!(query.matches(&LocalSubscriptionRecord::new(keep)));
        assert!(!query.matches(&LocalSubscriptionRecord::new(Uuid::new_v4())));
    }
}
