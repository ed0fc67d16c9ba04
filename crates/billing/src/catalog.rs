//! Plan catalog
//!
//! Plans, their gateway prices, and the features/permissions each plan grants.
//! The catalog is read-only to the billing core.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::LocalSubscriptionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Month,
    Year,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Month => "month",
            BillingInterval::Year => "year",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "month" => Some(BillingInterval::Month),
            "year" => Some(BillingInterval::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPlan {
    pub plan_id: String,
    pub remote_price_id: String,
    pub interval: BillingInterval,
    pub price_cents: i64,
    pub active: bool,
    pub featured: bool,
    /// Marketing feature list
    pub features: Vec<String>,
    /// Permission codenames granted while the subscription is live
    pub permissions: Vec<String>,
}

#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn plan(&self, plan_id: &str) -> BillingResult<Option<CatalogPlan>>;

    async fn plan_by_price(&self, price_id: &str) -> BillingResult<Option<CatalogPlan>>;

    /// Active plans, featured first
    async fn list(&self) -> BillingResult<Vec<CatalogPlan>>;

    /// Permissions the record currently grants. Only active and trial
    /// subscriptions grant anything.
    async fn entitlements_for(
        &self,
        record: &LocalSubscriptionRecord,
    ) -> BillingResult<Vec<String>> {
        if !record.status.grants_entitlements() {
            return Ok(Vec::new());
        }
        let Some(plan_id) = record.plan_id.as_deref() else {
            return Ok(Vec::new());
        };
        Ok(self
            .plan(plan_id)
            .await?
            .map(|plan| plan.permissions)
            .unwrap_or_default())
    }
}

/// Catalog held in memory, loaded once at startup
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    plans: Vec<CatalogPlan>,
}

impl StaticCatalog {
    pub fn new(plans: Vec<CatalogPlan>) -> Self {
        Self { plans }
    }
}

#[async_trait]
impl PlanCatalog for StaticCatalog {
    async fn plan(&self, plan_id: &str) -> BillingResult<Option<CatalogPlan>> {
        Ok(self.plans.iter().find(|p| p.plan_id == plan_id).cloned())
    }

    async fn plan_by_price(&self, price_id: &str) -> BillingResult<Option<CatalogPlan>> {
        Ok(self
            .plans
            .iter()
            .find(|p| p.remote_price_id == price_id)
            .cloned())
    }

    async fn list(&self) -> BillingResult<Vec<CatalogPlan>> {
        let mut plans: Vec<CatalogPlan> = self.plans.iter().filter(|p| p.active).cloned().collect();
        plans.sort_by(|a, b| {
            b.featured
                .cmp(&a.featured)
                .then(a.price_cents.cmp(&b.price_cents))
        });
        Ok(plans)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CatalogPlanRow {
    plan_id: String,
    remote_price_id: String,
    interval: String,
    price_cents: i64,
    active: bool,
    featured: bool,
    features: Vec<String>,
    permissions: Vec<String>,
}

impl TryFrom<CatalogPlanRow> for CatalogPlan {
    type Error = BillingError;

    fn try_from(row: CatalogPlanRow) -> Result<Self, Self::Error> {
        let interval = BillingInterval::parse(&row.interval).ok_or_else(|| {
            BillingError::Database(format!(
                "plan {} has unknown interval {}",
                row.plan_id, row.interval
            ))
        })?;
        Ok(CatalogPlan {
            plan_id: row.plan_id,
            remote_price_id: row.remote_price_id,
            interval,
            price_cents: row.price_cents,
            active: row.active,
            featured: row.featured,
            features: row.features,
            permissions: row.permissions,
        })
    }
}

/// Catalog backed by the `catalog_plans` table
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const PLAN_COLUMNS: &str = "plan_id, remote_price_id, interval, price_cents, active, featured, \
                            features, permissions";

#[async_trait]
impl PlanCatalog for PgCatalog {
    async fn plan(&self, plan_id: &str) -> BillingResult<Option<CatalogPlan>> {
        let row: Option<CatalogPlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM catalog_plans WHERE plan_id = $1"
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CatalogPlan::try_from).transpose()
    }

    async fn plan_by_price(&self, price_id: &str) -> BillingResult<Option<CatalogPlan>> {
        let row: Option<CatalogPlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM catalog_plans WHERE remote_price_id = $1"
        ))
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CatalogPlan::try_from).transpose()
    }

    async fn list(&self) -> BillingResult<Vec<CatalogPlan>> {
        let rows: Vec<CatalogPlanRow> = sqlx::query_as(&format!(
            "SELECT {PLAN_COLUMNS} FROM catalog_plans WHERE active \
             ORDER BY featured DESC, price_cents ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CatalogPlan::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::SubscriptionStatus;
    use uuid::Uuid;

    fn plan(id: &str, price: &str, cents: i64, featured: bool, active: bool) -> CatalogPlan {
        CatalogPlan {
            plan_id: id.to_string(),
            remote_price_id: price.to_string(),
            interval: BillingInterval::Month,
            price_cents: cents,
            active,
            featured,
            features: vec![],
            permissions: vec![format!("{id}.access")],
        }
    }

    fn catalog() -> StaticCatalog {
        StaticCatalog::new(vec![
            plan("basic", "price_basic", 900, false, true),
            plan("pro", "price_pro", 2900, true, true),
            plan("legacy", "price_legacy", 500, false, false),
        ])
    }

    #[tokio::test]
    async fn test_lookup_by_price() {
        let catalog = catalog();
        let found = catalog.plan_by_price("price_pro").await.unwrap();
        assert_eq!(found.map(|p| p.plan_id), Some("pro".to_string()));
        assert!(catalog.plan_by_price("price_unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_hides_inactive_and_puts_featured_first() {
        let ids: Vec<String> = catalog()
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.plan_id)
            .collect();
        assert_eq!(ids, vec!["pro", "basic"]);
    }

    #[tokio::test]
    async fn test_entitlements_only_for_live_statuses() {
        let catalog = catalog();
        let mut record = LocalSubscriptionRecord::new(Uuid::new_v4()).rebound("sub_1", "pro");

        record.status = SubscriptionStatus::Active;
        assert_eq!(
            catalog.entitlements_for(&record).await.unwrap(),
            vec!["pro.access".to_string()]
        );

        record.status = SubscriptionStatus::Trial;
        assert_eq!(catalog.entitlements_for(&record).await.unwrap().len(), 1);

        for status in [
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Paused,
            SubscriptionStatus::Canceled,
            SubscriptionStatus::Incomplete,
        ] {
            record.status = status;
            assert!(catalog.entitlements_for(&record).await.unwrap().is_empty());
        }
    }
}
