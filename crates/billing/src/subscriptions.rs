//! Local subscription record and its mapping from gateway snapshots

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{RemoteStatus, RemoteSubscriptionSnapshot};
use crate::error::{BillingError, BillingResult};

/// Local subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Trial,
    Active,
    PastDue,
    Canceled,
    Paused,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Paused => "paused",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Some(match value {
            "none" => SubscriptionStatus::None,
            "trial" => SubscriptionStatus::Trial,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "paused" => SubscriptionStatus::Paused,
            "incomplete" => SubscriptionStatus::Incomplete,
            _ => return None,
        })
    }

    pub fn from_remote(status: RemoteStatus) -> Self {
        match status {
            RemoteStatus::Trialing => SubscriptionStatus::Trial,
            RemoteStatus::Active => SubscriptionStatus::Active,
            RemoteStatus::PastDue | RemoteStatus::Unpaid => SubscriptionStatus::PastDue,
            RemoteStatus::Canceled | RemoteStatus::IncompleteExpired => {
                SubscriptionStatus::Canceled
            }
            RemoteStatus::Paused => SubscriptionStatus::Paused,
            RemoteStatus::Incomplete => SubscriptionStatus::Incomplete,
        }
    }

    /// Statuses that must reference a gateway subscription
    pub fn is_paid(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trial | SubscriptionStatus::PastDue
        )
    }

    pub fn grants_entitlements(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trial)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-user subscription state, kept in line with the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalSubscriptionRecord {
    pub user_id: Uuid,
    pub plan_id: Option<String>,
    pub remote_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub user_cancelled: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_synced_at: Option<OffsetDateTime>,
    /// Optimistic concurrency token, bumped on every successful save
    pub version: i64,
}

impl LocalSubscriptionRecord {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            plan_id: None,
            remote_subscription_id: None,
            status: SubscriptionStatus::None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            user_cancelled: false,
            last_synced_at: None,
            version: 0,
        }
    }

    /// Check the record invariants before it is written
    pub fn validate(&self) -> BillingResult<()> {
        if self.status.is_paid() && self.remote_subscription_id.is_none() {
            return Err(BillingError::InvalidRecord(format!(
                "user {} has status {} without a remote subscription",
                self.user_id, self.status
            )));
        }
        if self.remote_subscription_id.is_none()
            && !matches!(
                self.status,
                SubscriptionStatus::None
                    | SubscriptionStatus::Incomplete
                    | SubscriptionStatus::Canceled
            )
        {
            return Err(BillingError::InvalidRecord(format!(
                "user {} has status {} but no remote subscription",
                self.user_id, self.status
            )));
        }
        if self.current_period_end.is_none()
            && !matches!(
                self.status,
                SubscriptionStatus::None | SubscriptionStatus::Incomplete
            )
        {
            return Err(BillingError::InvalidRecord(format!(
                "user {} has status {} without a period end",
                self.user_id, self.status
            )));
        }
        Ok(())
    }

    /// Copy of this record with every gateway-owned field taken from `snapshot`.
    ///
    /// `plan_id` is the catalog plan the snapshot's price resolved to; `None`
    /// keeps the current plan.
    pub fn with_snapshot(
        &self,
        snapshot: &RemoteSubscriptionSnapshot,
        plan_id: Option<&str>,
    ) -> Self {
        Self {
            plan_id: plan_id.map(str::to_string).or_else(|| self.plan_id.clone()),
            remote_subscription_id: Some(snapshot.remote_id.clone()),
            status: SubscriptionStatus::from_remote(snapshot.status),
            current_period_start: Some(snapshot.current_period_start),
            current_period_end: Some(snapshot.current_period_end),
            cancel_at_period_end: snapshot.cancel_at_period_end,
            ..self.clone()
        }
    }

    /// Copy of this record after the gateway reported its subscription gone
    pub fn orphan_cancelled(&self, now: OffsetDateTime) -> Self {
        Self {
            remote_subscription_id: None,
            status: SubscriptionStatus::Canceled,
            user_cancelled: false,
            current_period_end: Some(self.current_period_end.unwrap_or(now)),
            ..self.clone()
        }
    }

    /// Copy of this record bound to a freshly checked-out subscription
    pub fn rebound(&self, remote_id: &str, plan_id: &str) -> Self {
        Self {
            plan_id: Some(plan_id.to_string()),
            remote_subscription_id: Some(remote_id.to_string()),
            status: SubscriptionStatus::Incomplete,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            user_cancelled: false,
            ..self.clone()
        }
    }

    /// Names of the reconciled fields that differ. Bookkeeping fields
    /// (`last_synced_at`, `version`) are not compared.
    pub fn differences(&self, other: &Self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.plan_id != other.plan_id {
            fields.push("plan_id");
        }
        if self.remote_subscription_id != other.remote_subscription_id {
            fields.push("remote_subscription_id");
        }
        if self.status != other.status {
            fields.push("status");
        }
        if self.current_period_start != other.current_period_start {
            fields.push("current_period_start");
        }
        if self.current_period_end != other.current_period_end {
            fields.push("current_period_end");
        }
        if self.cancel_at_period_end != other.cancel_at_period_end {
            fields.push("cancel_at_period_end");
        }
        if self.user_cancelled != other.user_cancelled {
            fields.push("user_cancelled");
        }
        fields
    }
}
