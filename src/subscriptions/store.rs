use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::QuotaResult;

use super::models::{
    InstanceStatus, NewSubscriptionInstance, NewSubscriptionPlan, NewUsageEntry, PlanStatus,
    QuotaNotification, SubscriptionInstance, SubscriptionPlan, UsageEntry, UsageFilter,
};

/// key: ledger-store -> durable plans, instances, usage
///
/// Balance authority lives on the instance rows. The usage ledger is an audit
/// trail and never feeds back into remaining quota.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert_plan(
        &self,
        plan: &NewSubscriptionPlan,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionPlan>;

    async fn plan(&self, plan_id: i64) -> QuotaResult<Option<SubscriptionPlan>>;

    /// Plans ordered by price, optionally filtered by status.
    async fn list_plans(&self, status: Option<PlanStatus>) -> QuotaResult<Vec<SubscriptionPlan>>;

    /// Replaces the plan definition. Existing instances keep the quota and
    /// window they were purchased with. `None` when the plan is missing or
    /// deleted.
    async fn update_plan(
        &self,
        plan_id: i64,
        plan: &NewSubscriptionPlan,
        now: DateTime<Utc>,
    ) -> QuotaResult<Option<SubscriptionPlan>>;

    /// Soft delete: the plan leaves the catalog, instances referencing it stay.
    async fn delete_plan(&self, plan_id: i64, now: DateTime<Utc>) -> QuotaResult<bool>;

    async fn set_plan_status(
        &self,
        plan_id: i64,
        status: PlanStatus,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool>;

    async fn insert_instance(
        &self,
        instance: &NewSubscriptionInstance,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionInstance>;

    async fn instance(&self, instance_id: i64) -> QuotaResult<Option<SubscriptionInstance>>;

    /// Instances of `user_id` whose stored status is still active, ordered by
    /// end time then id. Rows past their window are included so the caller can
    /// reconcile them.
    async fn find_active_instances(&self, user_id: i64) -> QuotaResult<Vec<SubscriptionInstance>>;

    /// Every instance whose stored status is still active.
    async fn list_active_instances(&self) -> QuotaResult<Vec<SubscriptionInstance>>;

    async fn list_instances_created_between(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> QuotaResult<Vec<SubscriptionInstance>>;

    /// Atomically moves `amount` from remaining to consumed for one resource.
    /// Returns `false` without touching anything when the instance is not
    /// effectively active at `now` or the remaining balance is below `amount`.
    async fn conditional_decrement(
        &self,
        instance_id: i64,
        resource: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool>;

    /// Compare-and-set on the stored status. Returns whether a row changed.
    async fn transition_status(
        &self,
        instance_id: i64,
        from: InstanceStatus,
        to: InstanceStatus,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool>;

    /// Flips every stored-active row with `end_at <= now` to expired.
    async fn bulk_expire(&self, now: DateTime<Utc>) -> QuotaResult<u64>;

    async fn append_usage(&self, entry: &NewUsageEntry) -> QuotaResult<UsageEntry>;

    async fn usage_entries(&self, filter: &UsageFilter) -> QuotaResult<Vec<UsageEntry>>;

    async fn purge_usage_older_than(&self, cutoff: DateTime<Utc>) -> QuotaResult<u64>;

    /// Persists the notification unless one with the same instance, resource
    /// and band was recorded within `cooldown`. Returns whether it was stored.
    async fn record_notification_if_absent(
        &self,
        notification: &QuotaNotification,
        cooldown: Duration,
    ) -> QuotaResult<bool>;
}
