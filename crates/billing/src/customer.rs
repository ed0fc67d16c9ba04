//! Billing customers
//!
//! Maps local users to gateway customers and provisions the gateway side on demand.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::client::{BillingGateway, NewCustomer};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct BillingCustomer {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub email: Option<String>,
    pub remote_customer_id: Option<String>,
    pub lifetime_value_cents: i64,
}

#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn user_for_customer(&self, customer_remote_id: &str) -> BillingResult<Option<Uuid>>;

    async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<Option<BillingCustomer>>;

    /// Remote ids of every customer that has been provisioned at the gateway
    async fn list_billable_customers(&self) -> BillingResult<Vec<String>>;

    async fn set_remote_customer_id(&self, user_id: Uuid, remote_id: &str) -> BillingResult<()>;

    async fn add_lifetime_value(&self, user_id: Uuid, amount_cents: i64) -> BillingResult<()>;
}

/// Postgres-backed directory over `billing_customers`
#[derive(Clone)]
pub struct PgCustomerDirectory {
    pool: PgPool,
}

impl PgCustomerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CustomerDirectory for PgCustomerDirectory {
    async fn user_for_customer(&self, customer_remote_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT user_id FROM billing_customers WHERE remote_customer_id = $1")
                .bind(customer_remote_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<Option<BillingCustomer>> {
        let customer = sqlx::query_as(
            r#"
            SELECT user_id, name, email, remote_customer_id, lifetime_value_cents
            FROM billing_customers
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    async fn list_billable_customers(&self) -> BillingResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT remote_customer_id FROM billing_customers
            WHERE remote_customer_id IS NOT NULL
            ORDER BY remote_customer_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn set_remote_customer_id(&self, user_id: Uuid, remote_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing_customers
            SET remote_customer_id = $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(remote_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::UnknownCustomer(user_id.to_string()));
        }
        Ok(())
    }

    async fn add_lifetime_value(&self, user_id: Uuid, amount_cents: i64) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_customers
            SET lifetime_value_cents = lifetime_value_cents + $2, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(amount_cents)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Gateway customer provisioning
#[derive(Clone)]
pub struct CustomerService {
    gateway: Arc<dyn BillingGateway>,
    customers: Arc<dyn CustomerDirectory>,
}

impl CustomerService {
    pub fn new(gateway: Arc<dyn BillingGateway>, customers: Arc<dyn CustomerDirectory>) -> Self {
        Self { gateway, customers }
    }

    /// Return the user's gateway customer id, creating the gateway customer the
    /// first time. An existing id is returned unchanged.
    pub async fn ensure_remote_customer(&self, user_id: Uuid) -> BillingResult<String> {
        let customer = self
            .customers
            .customer_for_user(user_id)
            .await?
            .ok_or_else(|| BillingError::UnknownCustomer(user_id.to_string()))?;

        if let Some(remote_id) = customer.remote_customer_id {
            return Ok(remote_id);
        }

        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());

        let remote_id = self
            .gateway
            .create_customer(NewCustomer {
                name: customer.name,
                email: customer.email,
                metadata,
            })
            .await?;

        self.customers
            .set_remote_customer_id(user_id, &remote_id)
            .await?;

        tracing::info!(user_id = %user_id, customer_id = %remote_id, "Provisioned billing customer");
        Ok(remote_id)
    }
}
