use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource name -> quota count.
pub type QuotaMap = BTreeMap<String, i64>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Enabled,
    Disabled,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Enabled => "enabled",
            PlanStatus::Disabled => "disabled",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "enabled" => PlanStatus::Enabled,
            _ => PlanStatus::Disabled,
        }
    }
}

/// key: subscription-plan-model -> catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub price_cents: i64,
    pub duration_days: i32,
    pub status: PlanStatus,
    pub resource_quotas: QuotaMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionPlan {
    pub fn quota_for(&self, resource: &str) -> i64 {
        self.resource_quotas.get(resource).copied().unwrap_or(0)
    }

    pub fn has_resource(&self, resource: &str) -> bool {
        self.resource_quotas.contains_key(resource)
    }

    pub fn total_quota(&self) -> i64 {
        self.resource_quotas.values().sum()
    }

    pub fn is_enabled(&self) -> bool {
        self.status == PlanStatus::Enabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubscriptionPlan {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price_cents: i64,
    pub duration_days: i32,
    #[serde(default = "default_plan_status")]
    pub status: PlanStatus,
    pub resource_quotas: QuotaMap,
}

fn default_plan_status() -> PlanStatus {
    PlanStatus::Enabled
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Active,
    Expired,
    Canceled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Active => "active",
            InstanceStatus::Expired => "expired",
            InstanceStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "active" => InstanceStatus::Active,
            "canceled" => InstanceStatus::Canceled,
            _ => InstanceStatus::Expired,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InstanceStatus::Active)
    }
}

/// key: subscription-instance-model -> purchased, time-boxed grant
///
/// `status` is the persisted value and is only refreshed lazily; decisions go
/// through [`SubscriptionInstance::is_effectively_active`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInstance {
    pub id: i64,
    pub user_id: i64,
    pub plan_id: i64,
    pub plan_name: String,
    pub status: InstanceStatus,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    /// Quota copied from the plan at purchase time.
    pub granted: QuotaMap,
    pub remaining: QuotaMap,
    pub consumed: QuotaMap,
    pub purchase_price_cents: i64,
    pub payment_method: Option<String>,
    pub payment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionInstance {
    pub fn is_effectively_active(&self, now: DateTime<Utc>) -> bool {
        self.status == InstanceStatus::Active && self.start_at <= now && now < self.end_at
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.end_at <= now
    }

    pub fn effective_status(&self, now: DateTime<Utc>) -> InstanceStatus {
        match self.status {
            InstanceStatus::Active if self.is_expired(now) => InstanceStatus::Expired,
            status => status,
        }
    }

    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        if self.is_expired(now) {
            return 0;
        }
        (self.end_at - now).num_days()
    }

    pub fn quota_info(&self, resource: &str) -> QuotaInfo {
        let total = self.granted.get(resource).copied().unwrap_or(0);
        let used = self.consumed.get(resource).copied().unwrap_or(0);
        QuotaInfo {
            total,
            used,
            remaining: (total - used).max(0),
        }
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.granted.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscriptionInstance {
    pub user_id: i64,
    pub plan_id: i64,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub quotas: QuotaMap,
    pub purchase_price_cents: i64,
    pub payment_method: Option<String>,
    pub payment_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaInfo {
    pub total: i64,
    pub used: i64,
    pub remaining: i64,
}

impl QuotaInfo {
    pub fn absorb(&mut self, other: QuotaInfo) {
        self.total += other.total;
        self.used += other.used;
        self.remaining += other.remaining;
    }
}

/// key: usage-ledger-model -> append-only audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEntry {
    pub id: i64,
    pub user_id: i64,
    pub instance_id: i64,
    pub resource: String,
    pub usage_count: i64,
    pub tokens_used: Option<i64>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageEntry {
    pub user_id: i64,
    pub instance_id: i64,
    pub resource: String,
    pub usage_count: i64,
    pub tokens_used: Option<i64>,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub user_id: Option<i64>,
    pub instance_id: Option<i64>,
    pub resource: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl UsageFilter {
    pub fn matches(&self, entry: &UsageEntry) -> bool {
        self.user_id.map_or(true, |id| entry.user_id == id)
            && self.instance_id.map_or(true, |id| entry.instance_id == id)
            && self
                .resource
                .as_deref()
                .map_or(true, |resource| entry.resource == resource)
            && self.start.map_or(true, |start| entry.created_at >= start)
            && self.end.map_or(true, |end| entry.created_at <= end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeRequest {
    pub user_id: i64,
    pub resource: String,
    pub amount: i64,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<i64>,
}

/// Result of a subscription draw. `consumed == false` is a normal outcome:
/// the caller falls back to non-subscription billing.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeOutcome {
    pub consumed: bool,
    pub instance_id: Option<i64>,
    pub amount_consumed: i64,
    pub ledger_recorded: bool,
    pub notes: Vec<String>,
}

impl ConsumeOutcome {
    pub fn declined(note: String) -> Self {
        Self {
            consumed: false,
            instance_id: None,
            amount_consumed: 0,
            ledger_recorded: false,
            notes: vec![note],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertBand {
    Notice,
    High,
    Critical,
}

impl AlertBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertBand::Notice => "notice",
            AlertBand::High => "high",
            AlertBand::Critical => "critical",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "notice" => Some(AlertBand::Notice),
            "high" => Some(AlertBand::High),
            "critical" => Some(AlertBand::Critical),
            _ => None,
        }
    }
}

/// key: quota-notification-model -> threshold crossing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaNotification {
    pub user_id: i64,
    pub instance_id: i64,
    pub plan_name: String,
    pub resource: String,
    pub band: AlertBand,
    pub usage_percentage: f64,
    pub remaining: i64,
    pub total: i64,
    pub observed_at: DateTime<Utc>,
}
