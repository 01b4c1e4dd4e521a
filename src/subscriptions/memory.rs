use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{QuotaError, QuotaResult};

use super::expiry::transition_allowed;
use super::models::{
    AlertBand, InstanceStatus, NewSubscriptionInstance, NewSubscriptionPlan, NewUsageEntry,
    PlanStatus, QuotaMap, QuotaNotification, SubscriptionInstance, SubscriptionPlan, UsageEntry,
    UsageFilter,
};
use super::store::LedgerStore;

const DEFAULT_LOCK_TIMEOUT: StdDuration = StdDuration::from_secs(2);

type NotificationKey = (i64, String, AlertBand);

struct PlanRecord {
    plan: SubscriptionPlan,
    deleted_at: Option<DateTime<Utc>>,
}

/// key: ledger-store-memory -> in-process store
///
/// `instances` holds the committed rows and is what readers see; map guards
/// are never held across an await. Each instance also has a balance lock that
/// serializes decrements on it while other instances proceed in parallel.
pub struct MemoryLedgerStore {
    plans: DashMap<i64, PlanRecord>,
    instances: DashMap<i64, SubscriptionInstance>,
    balance_locks: DashMap<i64, Arc<Mutex<()>>>,
    usage: Mutex<Vec<UsageEntry>>,
    notifications: Mutex<Vec<QuotaNotification>>,
    last_notified: DashMap<NotificationKey, DateTime<Utc>>,
    next_plan_id: AtomicI64,
    next_instance_id: AtomicI64,
    next_usage_id: AtomicI64,
    fail_usage_appends: AtomicBool,
    lock_timeout: StdDuration,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: StdDuration) -> Self {
        Self {
            plans: DashMap::new(),
            instances: DashMap::new(),
            balance_locks: DashMap::new(),
            usage: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            last_notified: DashMap::new(),
            next_plan_id: AtomicI64::new(1),
            next_instance_id: AtomicI64::new(1),
            next_usage_id: AtomicI64::new(1),
            fail_usage_appends: AtomicBool::new(false),
            lock_timeout,
        }
    }

    /// Makes every subsequent ledger append fail with `StoreUnavailable`.
    pub fn set_fail_usage_appends(&self, fail: bool) {
        self.fail_usage_appends.store(fail, Ordering::SeqCst);
    }

    /// Holds the balance lock of an instance until the guard is dropped.
    pub async fn lock_instance(&self, instance_id: i64) -> Option<OwnedMutexGuard<()>> {
        let lock = self.balance_lock(instance_id)?;
        Some(lock.lock_owned().await)
    }

    pub async fn recorded_notifications(&self) -> Vec<QuotaNotification> {
        self.notifications.lock().await.clone()
    }

    fn balance_lock(&self, instance_id: i64) -> Option<Arc<Mutex<()>>> {
        self.balance_locks
            .get(&instance_id)
            .map(|entry| entry.value().clone())
    }

    fn live_plan(&self, plan_id: i64) -> Option<SubscriptionPlan> {
        self.plans
            .get(&plan_id)
            .filter(|record| record.deleted_at.is_none())
            .map(|record| record.plan.clone())
    }

    fn snapshot_where<F>(&self, predicate: F) -> Vec<SubscriptionInstance>
    where
        F: Fn(&SubscriptionInstance) -> bool,
    {
        let mut matched: Vec<SubscriptionInstance> = self
            .instances
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        matched.sort_by(|a, b| a.end_at.cmp(&b.end_at).then(a.id.cmp(&b.id)));
        matched
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_plan(
        &self,
        plan: &NewSubscriptionPlan,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionPlan> {
        let record = SubscriptionPlan {
            id: self.next_plan_id.fetch_add(1, Ordering::SeqCst),
            name: plan.name.clone(),
            description: plan.description.clone(),
            price_cents: plan.price_cents,
            duration_days: plan.duration_days,
            status: plan.status,
            resource_quotas: plan.resource_quotas.clone(),
            created_at: now,
            updated_at: now,
        };
        self.plans.insert(
            record.id,
            PlanRecord {
                plan: record.clone(),
                deleted_at: None,
            },
        );
        Ok(record)
    }

    async fn plan(&self, plan_id: i64) -> QuotaResult<Option<SubscriptionPlan>> {
        Ok(self.live_plan(plan_id))
    }

    async fn list_plans(&self, status: Option<PlanStatus>) -> QuotaResult<Vec<SubscriptionPlan>> {
        let mut plans: Vec<SubscriptionPlan> = self
            .plans
            .iter()
            .filter(|entry| entry.deleted_at.is_none())
            .map(|entry| entry.plan.clone())
            .filter(|plan| status.map_or(true, |status| plan.status == status))
            .collect();
        plans.sort_by(|a, b| a.price_cents.cmp(&b.price_cents).then(a.id.cmp(&b.id)));
        Ok(plans)
    }

    async fn update_plan(
        &self,
        plan_id: i64,
        plan: &NewSubscriptionPlan,
        now: DateTime<Utc>,
    ) -> QuotaResult<Option<SubscriptionPlan>> {
        let Some(mut record) = self.plans.get_mut(&plan_id) else {
            return Ok(None);
        };
        if record.deleted_at.is_some() {
            return Ok(None);
        }
        let current = &mut record.plan;
        current.name = plan.name.clone();
        current.description = plan.description.clone();
        current.price_cents = plan.price_cents;
        current.duration_days = plan.duration_days;
        current.status = plan.status;
        current.resource_quotas = plan.resource_quotas.clone();
        current.updated_at = now;
        Ok(Some(current.clone()))
    }

    async fn delete_plan(&self, plan_id: i64, now: DateTime<Utc>) -> QuotaResult<bool> {
        match self.plans.get_mut(&plan_id) {
            Some(mut record) if record.deleted_at.is_none() => {
                record.deleted_at = Some(now);
                record.plan.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_plan_status(
        &self,
        plan_id: i64,
        status: PlanStatus,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool> {
        match self.plans.get_mut(&plan_id) {
            Some(mut record) if record.deleted_at.is_none() => {
                record.plan.status = status;
                record.plan.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_instance(
        &self,
        instance: &NewSubscriptionInstance,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionInstance> {
        let plan_name = self
            .live_plan(instance.plan_id)
            .map(|plan| plan.name)
            .ok_or(QuotaError::NotFound("plan", instance.plan_id))?;

        let record = SubscriptionInstance {
            id: self.next_instance_id.fetch_add(1, Ordering::SeqCst),
            user_id: instance.user_id,
            plan_id: instance.plan_id,
            plan_name,
            status: InstanceStatus::Active,
            start_at: instance.start_at,
            end_at: instance.end_at,
            granted: instance.quotas.clone(),
            remaining: instance.quotas.clone(),
            consumed: QuotaMap::new(),
            purchase_price_cents: instance.purchase_price_cents,
            payment_method: instance.payment_method.clone(),
            payment_ref: instance.payment_ref.clone(),
            created_at: now,
            updated_at: now,
        };
        self.balance_locks
            .insert(record.id, Arc::new(Mutex::new(())));
        self.instances.insert(record.id, record.clone());
        Ok(record)
    }

    async fn instance(&self, instance_id: i64) -> QuotaResult<Option<SubscriptionInstance>> {
        Ok(self
            .instances
            .get(&instance_id)
            .map(|entry| entry.value().clone()))
    }

    async fn find_active_instances(&self, user_id: i64) -> QuotaResult<Vec<SubscriptionInstance>> {
        Ok(self.snapshot_where(|instance| {
            instance.user_id == user_id && instance.status == InstanceStatus::Active
        }))
    }

    async fn list_active_instances(&self) -> QuotaResult<Vec<SubscriptionInstance>> {
        Ok(self.snapshot_where(|instance| instance.status == InstanceStatus::Active))
    }

    async fn list_instances_created_between(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> QuotaResult<Vec<SubscriptionInstance>> {
        Ok(self.snapshot_where(|instance| {
            start.map_or(true, |start| instance.created_at >= start)
                && end.map_or(true, |end| instance.created_at <= end)
        }))
    }

    async fn conditional_decrement(
        &self,
        instance_id: i64,
        resource: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool> {
        let Some(lock) = self.balance_lock(instance_id) else {
            return Ok(false);
        };
        let _held = tokio::time::timeout(self.lock_timeout, lock.lock())
            .await
            .map_err(|_| QuotaError::LockTimeout(instance_id))?;

        let Some(mut instance) = self.instances.get_mut(&instance_id) else {
            return Ok(false);
        };
        if !instance.is_effectively_active(now) {
            return Ok(false);
        }
        let remaining = instance.remaining.get(resource).copied().unwrap_or(0);
        if remaining < amount {
            debug!(
                instance = instance_id,
                resource,
                remaining,
                amount,
                "conditional decrement rejected"
            );
            return Ok(false);
        }

        instance.remaining.insert(resource.to_string(), remaining - amount);
        *instance.consumed.entry(resource.to_string()).or_insert(0) += amount;
        instance.updated_at = now;
        Ok(true)
    }

    async fn transition_status(
        &self,
        instance_id: i64,
        from: InstanceStatus,
        to: InstanceStatus,
        now: DateTime<Utc>,
    ) -> QuotaResult<bool> {
        if !transition_allowed(from, to) {
            return Ok(false);
        }
        let Some(mut instance) = self.instances.get_mut(&instance_id) else {
            return Ok(false);
        };
        if instance.status != from {
            return Ok(false);
        }
        instance.status = to;
        instance.updated_at = now;
        Ok(true)
    }

    async fn bulk_expire(&self, now: DateTime<Utc>) -> QuotaResult<u64> {
        let mut flipped = 0;
        for mut entry in self.instances.iter_mut() {
            let instance = entry.value_mut();
            if instance.status == InstanceStatus::Active && instance.is_expired(now) {
                instance.status = InstanceStatus::Expired;
                instance.updated_at = now;
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn append_usage(&self, entry: &NewUsageEntry) -> QuotaResult<UsageEntry> {
        if self.fail_usage_appends.load(Ordering::SeqCst) {
            return Err(QuotaError::StoreUnavailable(
                "usage ledger rejected the append".to_string(),
            ));
        }
        let record = UsageEntry {
            id: self.next_usage_id.fetch_add(1, Ordering::SeqCst),
            user_id: entry.user_id,
            instance_id: entry.instance_id,
            resource: entry.resource.clone(),
            usage_count: entry.usage_count,
            tokens_used: entry.tokens_used,
            request_id: entry.request_id.clone(),
            created_at: entry.created_at,
        };
        self.usage.lock().await.push(record.clone());
        Ok(record)
    }

    async fn usage_entries(&self, filter: &UsageFilter) -> QuotaResult<Vec<UsageEntry>> {
        let usage = self.usage.lock().await;
        let mut entries: Vec<UsageEntry> = usage
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(entries)
    }

    async fn purge_usage_older_than(&self, cutoff: DateTime<Utc>) -> QuotaResult<u64> {
        let mut usage = self.usage.lock().await;
        let before = usage.len();
        usage.retain(|entry| entry.created_at >= cutoff);
        Ok((before - usage.len()) as u64)
    }

    async fn record_notification_if_absent(
        &self,
        notification: &QuotaNotification,
        cooldown: Duration,
    ) -> QuotaResult<bool> {
        let key = (
            notification.instance_id,
            notification.resource.clone(),
            notification.band,
        );
        let threshold = notification.observed_at - cooldown;
        match self.last_notified.entry(key) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() >= threshold {
                    return Ok(false);
                }
                occupied.insert(notification.observed_at);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(notification.observed_at);
            }
        }
        self.notifications.lock().await.push(notification.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_store(remaining: i64) -> (MemoryLedgerStore, SubscriptionInstance) {
        let store = MemoryLedgerStore::with_lock_timeout(StdDuration::from_millis(50));
        let now = Utc::now();
        let plan = store
            .insert_plan(
                &NewSubscriptionPlan {
                    name: "Starter".to_string(),
                    description: None,
                    price_cents: 990,
                    duration_days: 30,
                    status: PlanStatus::Enabled,
                    resource_quotas: QuotaMap::from([("gpt-4".to_string(), remaining)]),
                },
                now,
            )
            .await
            .unwrap();
        let instance = store
            .insert_instance(
                &NewSubscriptionInstance {
                    user_id: 1,
                    plan_id: plan.id,
                    start_at: now - Duration::minutes(1),
                    end_at: now + Duration::days(30),
                    quotas: plan.resource_quotas.clone(),
                    purchase_price_cents: plan.price_cents,
                    payment_method: None,
                    payment_ref: None,
                },
                now,
            )
            .await
            .unwrap();
        (store, instance)
    }

    #[tokio::test]
    async fn conditional_decrement_refuses_overdraw() {
        let (store, instance) = seeded_store(10).await;
        let now = Utc::now();

        assert!(store
            .conditional_decrement(instance.id, "gpt-4", 6, now)
            .await
            .unwrap());
        assert!(!store
            .conditional_decrement(instance.id, "gpt-4", 6, now)
            .await
            .unwrap());
        assert!(!store
            .conditional_decrement(instance.id, "claude-3", 1, now)
            .await
            .unwrap());

        let stored = store.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(stored.remaining["gpt-4"], 4);
        assert_eq!(stored.consumed["gpt-4"], 6);
    }

    #[tokio::test]
    async fn held_lock_times_out_without_side_effects() {
        let (store, instance) = seeded_store(10).await;
        let guard = store.lock_instance(instance.id).await.unwrap();

        let err = store
            .conditional_decrement(instance.id, "gpt-4", 1, Utc::now())
            .await
            .expect_err("lock is held elsewhere");
        assert!(matches!(err, QuotaError::LockTimeout(id) if id == instance.id));
        drop(guard);

        let stored = store.instance(instance.id).await.unwrap().unwrap();
        assert_eq!(stored.remaining["gpt-4"], 10);
        assert!(stored.consumed.is_empty());
    }

    #[tokio::test]
    async fn transition_status_is_compare_and_set() {
        let (store, instance) = seeded_store(10).await;
        let now = Utc::now();
        assert!(store
            .transition_status(instance.id, InstanceStatus::Active, InstanceStatus::Expired, now)
            .await
            .unwrap());
        assert!(!store
            .transition_status(instance.id, InstanceStatus::Active, InstanceStatus::Expired, now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn reads_do_not_wait_on_a_held_balance_lock() {
        let (store, instance) = seeded_store(10).await;
        let _guard = store.lock_instance(instance.id).await.unwrap();

        let listed = tokio::time::timeout(
            StdDuration::from_millis(20),
            store.find_active_instances(instance.user_id),
        )
        .await
        .expect("reads must not queue behind a writer")
        .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].remaining["gpt-4"], 10);
    }
}
