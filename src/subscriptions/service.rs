use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config;
use crate::error::{QuotaError, QuotaResult};

use super::expiry::{cancel_instance, expire_sweep, reconcile_instance};
use super::models::{
    ConsumeOutcome, ConsumeRequest, InstanceStatus, NewSubscriptionInstance, NewSubscriptionPlan,
    NewUsageEntry, PlanStatus, QuotaInfo, SubscriptionInstance, SubscriptionPlan, UsageEntry,
    UsageFilter,
};
use super::monitor::{self, AlertThresholds, MonitorReport};
use super::reports::{self, DailyUsage, ResourceUsage, SalesReport, SystemStats};
use super::selector::{select_candidate, SelectionPolicy};
use super::store::LedgerStore;

/// key: quota-engine-config -> tunables for selection, alerts and retention
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub selection_policy: SelectionPolicy,
    pub thresholds: AlertThresholds,
    pub alert_cooldown: Duration,
    pub max_consume_attempts: u32,
    pub usage_retention_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            selection_policy: SelectionPolicy::default(),
            thresholds: AlertThresholds::default(),
            alert_cooldown: Duration::hours(24),
            max_consume_attempts: 3,
            usage_retention_days: 90,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self {
            selection_policy: *config::SUBSCRIPTION_SELECTION_POLICY,
            thresholds: *config::QUOTA_ALERT_THRESHOLDS,
            alert_cooldown: Duration::seconds(
                i64::try_from(*config::QUOTA_ALERT_COOLDOWN_SECS)
                    .unwrap_or(i64::MAX)
                    .min(i64::MAX / 1_000),
            ),
            max_consume_attempts: *config::CONSUME_MAX_ATTEMPTS,
            usage_retention_days: *config::USAGE_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: i64,
    pub plan_id: i64,
    #[serde(default)]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub payment_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub quota: QuotaInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub instance_id: i64,
    pub plan_id: i64,
    pub plan_name: String,
    pub status: InstanceStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub remaining_days: i64,
    pub quotas: BTreeMap<String, QuotaInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub user_id: i64,
    pub active_count: usize,
    pub nearest_expiry: Option<DateTime<Utc>>,
    pub quotas: BTreeMap<String, QuotaInfo>,
    pub instances: Vec<InstanceSummary>,
}

/// key: quota-engine -> selection, consumption, sweeps and rollups
#[derive(Clone)]
pub struct QuotaEngine {
    store: Arc<dyn LedgerStore>,
    config: EngineConfig,
}

impl QuotaEngine {
    pub fn new(store: Arc<dyn LedgerStore>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn validate_plan(plan: &NewSubscriptionPlan) -> QuotaResult<()> {
        if plan.name.trim().is_empty() {
            return Err(QuotaError::validation("plan name must not be empty"));
        }
        if plan.price_cents < 0 {
            return Err(QuotaError::validation("plan price must not be negative"));
        }
        if plan.duration_days <= 0 {
            return Err(QuotaError::validation("plan duration must be at least one day"));
        }
        if plan.resource_quotas.is_empty() {
            return Err(QuotaError::validation("plan must grant at least one resource"));
        }
        for (resource, quota) in &plan.resource_quotas {
            if resource.trim().is_empty() {
                return Err(QuotaError::validation("resource names must not be empty"));
            }
            if *quota < 0 {
                return Err(QuotaError::validation(format!(
                    "quota for `{resource}` must not be negative"
                )));
            }
        }
        Ok(())
    }

    pub async fn create_plan(
        &self,
        plan: &NewSubscriptionPlan,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionPlan> {
        Self::validate_plan(plan)?;
        let created = self.store.insert_plan(plan, now).await?;
        info!(plan = created.id, name = %created.name, "subscription plan created");
        Ok(created)
    }

    pub async fn plan(&self, plan_id: i64) -> QuotaResult<SubscriptionPlan> {
        self.store
            .plan(plan_id)
            .await?
            .ok_or(QuotaError::NotFound("plan", plan_id))
    }

    pub async fn list_plans(&self, status: Option<PlanStatus>) -> QuotaResult<Vec<SubscriptionPlan>> {
        self.store.list_plans(status).await
    }

    /// Edits a plan in place. Instances already purchased keep their own
    /// window and quota snapshot.
    pub async fn update_plan(
        &self,
        plan_id: i64,
        plan: &NewSubscriptionPlan,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionPlan> {
        Self::validate_plan(plan)?;
        let updated = self
            .store
            .update_plan(plan_id, plan, now)
            .await?
            .ok_or(QuotaError::NotFound("plan", plan_id))?;
        info!(plan = plan_id, name = %updated.name, "subscription plan updated");
        Ok(updated)
    }

    pub async fn delete_plan(&self, plan_id: i64, now: DateTime<Utc>) -> QuotaResult<()> {
        if !self.store.delete_plan(plan_id, now).await? {
            return Err(QuotaError::NotFound("plan", plan_id));
        }
        info!(plan = plan_id, "subscription plan deleted");
        Ok(())
    }

    pub async fn set_plan_status(
        &self,
        plan_id: i64,
        status: PlanStatus,
        now: DateTime<Utc>,
    ) -> QuotaResult<()> {
        if !self.store.set_plan_status(plan_id, status, now).await? {
            return Err(QuotaError::NotFound("plan", plan_id));
        }
        info!(plan = plan_id, status = status.as_str(), "subscription plan status updated");
        Ok(())
    }

    /// Creates an active instance whose window and quota are fixed from the
    /// plan as it stands at `now`.
    pub async fn purchase(
        &self,
        request: &PurchaseRequest,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionInstance> {
        let plan = self.plan(request.plan_id).await?;
        if !plan.is_enabled() {
            return Err(QuotaError::validation(format!(
                "plan {} is not available for purchase",
                plan.id
            )));
        }

        let instance = self
            .store
            .insert_instance(
                &NewSubscriptionInstance {
                    user_id: request.user_id,
                    plan_id: plan.id,
                    start_at: now,
                    end_at: now + Duration::days(i64::from(plan.duration_days)),
                    quotas: plan.resource_quotas.clone(),
                    purchase_price_cents: plan.price_cents,
                    payment_method: request.payment_method.clone(),
                    payment_ref: request.payment_ref.clone(),
                },
                now,
            )
            .await?;
        info!(
            user_id = instance.user_id,
            instance = instance.id,
            plan = %instance.plan_name,
            end_at = %instance.end_at,
            "subscription purchased"
        );
        Ok(instance)
    }

    pub async fn cancel(&self, instance_id: i64, now: DateTime<Utc>) -> QuotaResult<bool> {
        // A lapsed instance settles as expired, not canceled.
        let instance = self.instance(instance_id, now).await?;
        if instance.status.is_terminal() {
            return Ok(false);
        }
        cancel_instance(self.store.as_ref(), instance_id, now).await
    }

    /// Reads one instance, applying the lazy expiry transition first.
    pub async fn instance(
        &self,
        instance_id: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionInstance> {
        let mut instance = self
            .store
            .instance(instance_id)
            .await?
            .ok_or(QuotaError::NotFound("instance", instance_id))?;
        reconcile_instance(self.store.as_ref(), &mut instance, now).await?;
        Ok(instance)
    }

    /// Effective-active instances of a user. Any lapsed instance met on the
    /// way is expired in the store and left out.
    pub async fn effective_instances(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<Vec<SubscriptionInstance>> {
        let stored = self.store.find_active_instances(user_id).await?;
        let mut instances = Vec::with_capacity(stored.len());
        for mut instance in stored {
            reconcile_instance(self.store.as_ref(), &mut instance, now).await?;
            if instance.is_effectively_active(now) {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    pub async fn select_instance(
        &self,
        user_id: i64,
        resource: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<Option<SubscriptionInstance>> {
        let instances = self.effective_instances(user_id, now).await?;
        Ok(
            select_candidate(&instances, resource, amount, self.config.selection_policy, now)
                .cloned(),
        )
    }

    /// key: consumption-transactor -> decrement then ledger append
    ///
    /// `InsufficientQuota` means nothing was applied. Once the decrement lands
    /// the debit stands even if the ledger append fails.
    pub async fn consume(
        &self,
        instance: &SubscriptionInstance,
        request: &ConsumeRequest,
        now: DateTime<Utc>,
    ) -> QuotaResult<ConsumeOutcome> {
        validate_request(request)?;
        if request.user_id != instance.user_id {
            return Err(QuotaError::validation(format!(
                "instance {} does not belong to user {}",
                instance.id, request.user_id
            )));
        }
        if !instance.is_effectively_active(now) {
            return Err(QuotaError::InsufficientQuota);
        }

        let applied = self
            .store
            .conditional_decrement(instance.id, &request.resource, request.amount, now)
            .await?;
        if !applied {
            return Err(QuotaError::InsufficientQuota);
        }

        let mut notes = vec![format!(
            "subscription:{}:{}@instance:{}",
            request.resource, request.amount, instance.id
        )];
        let entry = NewUsageEntry {
            user_id: request.user_id,
            instance_id: instance.id,
            resource: request.resource.clone(),
            usage_count: request.amount,
            tokens_used: request.tokens_used,
            request_id: request.request_id.clone(),
            created_at: now,
        };
        let ledger_recorded = match self.store.append_usage(&entry).await {
            Ok(_) => true,
            Err(err) => {
                error!(
                    ?err,
                    user_id = request.user_id,
                    instance = instance.id,
                    resource = %request.resource,
                    amount = request.amount,
                    request_id = ?request.request_id,
                    "usage ledger append failed after decrement"
                );
                notes.push("ledger:append_failed".to_string());
                false
            }
        };

        info!(
            user_id = request.user_id,
            instance = instance.id,
            resource = %request.resource,
            amount = request.amount,
            "subscription quota consumed"
        );
        Ok(ConsumeOutcome {
            consumed: true,
            instance_id: Some(instance.id),
            amount_consumed: request.amount,
            ledger_recorded,
            notes,
        })
    }

    /// key: consumption-transactor -> select and draw with retry
    ///
    /// Running out of quota is a `consumed == false` outcome. Lock timeouts and
    /// store failures surface as errors with nothing applied.
    pub async fn try_consume(
        &self,
        request: &ConsumeRequest,
        now: DateTime<Utc>,
    ) -> QuotaResult<ConsumeOutcome> {
        validate_request(request)?;
        let attempts = self.config.max_consume_attempts.max(1);
        let mut notes = Vec::new();

        for attempt in 1..=attempts {
            let Some(instance) = self
                .select_instance(request.user_id, &request.resource, request.amount, now)
                .await?
            else {
                debug!(
                    user_id = request.user_id,
                    resource = %request.resource,
                    amount = request.amount,
                    "no subscription instance covers request"
                );
                notes.push(format!(
                    "subscription:unavailable:{}:{}",
                    request.resource, request.amount
                ));
                return Ok(declined(notes));
            };

            match self.consume(&instance, request, now).await {
                Ok(mut outcome) => {
                    notes.append(&mut outcome.notes);
                    outcome.notes = notes;
                    return Ok(outcome);
                }
                Err(QuotaError::InsufficientQuota) => {
                    debug!(
                        user_id = request.user_id,
                        instance = instance.id,
                        attempt,
                        "instance drained between selection and decrement"
                    );
                    notes.push(format!("subscription:contended:instance:{}", instance.id));
                }
                Err(err) => return Err(err),
            }
        }

        notes.push(format!("subscription:exhausted_attempts:{attempts}"));
        Ok(declined(notes))
    }

    /// Per-resource totals across the user's effective-active instances.
    pub async fn quota_summary(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<BTreeMap<String, QuotaInfo>> {
        let instances = self.effective_instances(user_id, now).await?;
        Ok(aggregate_quotas(&instances))
    }

    pub async fn check_available(
        &self,
        user_id: i64,
        resource: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<Availability> {
        if amount <= 0 {
            return Err(QuotaError::validation("amount must be positive"));
        }
        let instances = self.effective_instances(user_id, now).await?;
        let mut quota = QuotaInfo::default();
        for instance in &instances {
            quota.absorb(instance.quota_info(resource));
        }
        let available =
            select_candidate(&instances, resource, amount, self.config.selection_policy, now)
                .is_some();
        Ok(Availability { available, quota })
    }

    pub async fn subscription_summary(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> QuotaResult<SubscriptionSummary> {
        let instances = self.effective_instances(user_id, now).await?;
        let summaries = instances
            .iter()
            .map(|instance| InstanceSummary {
                instance_id: instance.id,
                plan_id: instance.plan_id,
                plan_name: instance.plan_name.clone(),
                status: instance.effective_status(now),
                start_at: instance.start_at,
                end_at: instance.end_at,
                remaining_days: instance.remaining_days(now),
                quotas: instance
                    .resources()
                    .map(|resource| (resource.to_string(), instance.quota_info(resource)))
                    .collect(),
            })
            .collect();

        Ok(SubscriptionSummary {
            user_id,
            active_count: instances.len(),
            nearest_expiry: instances.iter().map(|instance| instance.end_at).min(),
            quotas: aggregate_quotas(&instances),
            instances: summaries,
        })
    }

    pub async fn run_expiry_sweep(&self, now: DateTime<Utc>) -> QuotaResult<u64> {
        expire_sweep(self.store.as_ref(), now).await
    }

    pub async fn run_monitor_sweep(&self, now: DateTime<Utc>) -> QuotaResult<MonitorReport> {
        monitor::run_sweep(
            self.store.as_ref(),
            &self.config.thresholds,
            self.config.alert_cooldown,
            now,
        )
        .await
    }

    /// Purges ledger rows older than the configured retention horizon.
    pub async fn run_retention_sweep(&self, now: DateTime<Utc>) -> QuotaResult<u64> {
        if self.config.usage_retention_days <= 0 {
            return Err(QuotaError::validation("usage retention days must be positive"));
        }
        let cutoff = now - Duration::days(self.config.usage_retention_days);
        let purged = self.store.purge_usage_older_than(cutoff).await?;
        info!(purged, cutoff = %cutoff, "usage ledger retention sweep completed");
        Ok(purged)
    }

    pub async fn sales_report(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> QuotaResult<SalesReport> {
        let instances = self.store.list_instances_created_between(start, end).await?;
        Ok(reports::sales_report(&instances, start, end, now))
    }

    pub async fn system_stats(&self) -> QuotaResult<SystemStats> {
        let instances = self.store.list_instances_created_between(None, None).await?;
        Ok(reports::system_stats(&instances))
    }

    pub async fn usage_by_resource(
        &self,
        user_id: Option<i64>,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> QuotaResult<BTreeMap<String, ResourceUsage>> {
        let entries = self
            .store
            .usage_entries(&UsageFilter {
                user_id,
                start,
                end,
                ..UsageFilter::default()
            })
            .await?;
        Ok(reports::usage_by_resource(&entries))
    }

    /// Ledger rows of one instance, newest first.
    pub async fn usage_for_instance(&self, instance_id: i64) -> QuotaResult<Vec<UsageEntry>> {
        self.store
            .usage_entries(&UsageFilter {
                instance_id: Some(instance_id),
                ..UsageFilter::default()
            })
            .await
    }

    pub async fn daily_usage(
        &self,
        user_id: Option<i64>,
        days: u32,
        now: DateTime<Utc>,
    ) -> QuotaResult<Vec<DailyUsage>> {
        let start = reports::daily_window_start(now, days);
        let entries = self
            .store
            .usage_entries(&UsageFilter {
                user_id,
                start: Some(start),
                end: Some(now),
                ..UsageFilter::default()
            })
            .await?;
        Ok(reports::daily_usage(&entries, days, now))
    }

    pub async fn top_resources(
        &self,
        user_id: Option<i64>,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> QuotaResult<Vec<ResourceUsage>> {
        let entries = self
            .store
            .usage_entries(&UsageFilter {
                user_id,
                start,
                end,
                ..UsageFilter::default()
            })
            .await?;
        Ok(reports::top_resources(&entries, limit))
    }

    pub async fn usage_since(
        &self,
        user_id: i64,
        resource: Option<&str>,
        since: DateTime<Utc>,
    ) -> QuotaResult<i64> {
        let entries = self
            .store
            .usage_entries(&UsageFilter {
                user_id: Some(user_id),
                resource: resource.map(str::to_string),
                start: Some(since),
                ..UsageFilter::default()
            })
            .await?;
        Ok(reports::total_count(&entries))
    }

    pub async fn usage_today(
        &self,
        user_id: i64,
        resource: Option<&str>,
        now: DateTime<Utc>,
    ) -> QuotaResult<i64> {
        self.usage_since(user_id, resource, reports::day_start(now)).await
    }

    pub async fn usage_this_month(
        &self,
        user_id: i64,
        resource: Option<&str>,
        now: DateTime<Utc>,
    ) -> QuotaResult<i64> {
        self.usage_since(user_id, resource, reports::month_start(now)).await
    }
}

fn validate_request(request: &ConsumeRequest) -> QuotaResult<()> {
    if request.amount <= 0 {
        return Err(QuotaError::validation("amount must be positive"));
    }
    if request.resource.trim().is_empty() {
        return Err(QuotaError::validation("resource must not be empty"));
    }
    if matches!(request.tokens_used, Some(tokens) if tokens < 0) {
        return Err(QuotaError::validation("tokens_used must not be negative"));
    }
    Ok(())
}

fn declined(notes: Vec<String>) -> ConsumeOutcome {
    ConsumeOutcome {
        notes,
        ..ConsumeOutcome::declined(String::new())
    }
}

fn aggregate_quotas(instances: &[SubscriptionInstance]) -> BTreeMap<String, QuotaInfo> {
    let mut totals: BTreeMap<String, QuotaInfo> = BTreeMap::new();
    for instance in instances {
        for resource in instance.resources() {
            totals
                .entry(resource.to_string())
                .or_default()
                .absorb(instance.quota_info(resource));
        }
    }
    totals
}
