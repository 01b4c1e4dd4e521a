use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;

use super::models::{InstanceStatus, SubscriptionInstance, UsageEntry};

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PlanSalesStats {
    pub plan_id: i64,
    pub plan_name: String,
    pub total_sales: i64,
    pub total_revenue_cents: i64,
    pub active_count: i64,
    pub expired_count: i64,
    pub canceled_count: i64,
}

impl PlanSalesStats {
    fn record(&mut self, instance: &SubscriptionInstance, status: InstanceStatus) {
        self.total_sales += 1;
        self.total_revenue_cents += instance.purchase_price_cents;
        match status {
            InstanceStatus::Active => self.active_count += 1,
            InstanceStatus::Expired => self.expired_count += 1,
            InstanceStatus::Canceled => self.canceled_count += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SalesReport {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub total_sales: i64,
    pub total_revenue_cents: i64,
    pub total_active: i64,
    pub total_expired: i64,
    pub total_canceled: i64,
    pub plans: BTreeMap<String, PlanSalesStats>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusCount {
    pub status: InstanceStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub total_subscriptions: i64,
    pub total_revenue_cents: i64,
    pub status_counts: Vec<StatusCount>,
    pub plans: BTreeMap<String, PlanSalesStats>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ResourceUsage {
    pub resource: String,
    pub total_count: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub resource: String,
    pub total_count: i64,
    pub total_tokens: i64,
}

fn plan_bucket<'a>(
    plans: &'a mut BTreeMap<String, PlanSalesStats>,
    instance: &SubscriptionInstance,
) -> &'a mut PlanSalesStats {
    plans
        .entry(instance.plan_name.clone())
        .or_insert_with(|| PlanSalesStats {
            plan_id: instance.plan_id,
            plan_name: instance.plan_name.clone(),
            ..PlanSalesStats::default()
        })
}

/// Per-plan sales over instances purchased in the window. Status is derived at
/// `now`, so lapsed-but-unswept instances count as expired.
pub fn sales_report(
    instances: &[SubscriptionInstance],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SalesReport {
    let mut plans = BTreeMap::new();
    for instance in instances {
        plan_bucket(&mut plans, instance).record(instance, instance.effective_status(now));
    }

    let mut report = SalesReport {
        start,
        end,
        total_sales: 0,
        total_revenue_cents: 0,
        total_active: 0,
        total_expired: 0,
        total_canceled: 0,
        plans,
    };
    for stats in report.plans.values() {
        report.total_sales += stats.total_sales;
        report.total_revenue_cents += stats.total_revenue_cents;
        report.total_active += stats.active_count;
        report.total_expired += stats.expired_count;
        report.total_canceled += stats.canceled_count;
    }
    report
}

/// Counts by stored status, as persisted.
pub fn system_stats(instances: &[SubscriptionInstance]) -> SystemStats {
    let mut plans = BTreeMap::new();
    let mut by_status: BTreeMap<&'static str, StatusCount> = BTreeMap::new();
    for instance in instances {
        plan_bucket(&mut plans, instance).record(instance, instance.status);
        by_status
            .entry(instance.status.as_str())
            .or_insert(StatusCount {
                status: instance.status,
                count: 0,
            })
            .count += 1;
    }

    SystemStats {
        total_subscriptions: instances.len() as i64,
        total_revenue_cents: instances.iter().map(|i| i.purchase_price_cents).sum(),
        status_counts: by_status.into_values().collect(),
        plans,
    }
}

pub fn usage_by_resource(entries: &[UsageEntry]) -> BTreeMap<String, ResourceUsage> {
    let mut usage: BTreeMap<String, ResourceUsage> = BTreeMap::new();
    for entry in entries {
        let bucket = usage
            .entry(entry.resource.clone())
            .or_insert_with(|| ResourceUsage {
                resource: entry.resource.clone(),
                ..ResourceUsage::default()
            });
        bucket.total_count += entry.usage_count;
        bucket.total_tokens += entry.tokens_used.unwrap_or(0);
    }
    usage
}

/// Resources by total count, highest first; ties by name.
pub fn top_resources(entries: &[UsageEntry], limit: usize) -> Vec<ResourceUsage> {
    let mut ranked: Vec<ResourceUsage> = usage_by_resource(entries).into_values().collect();
    ranked.sort_by(|a, b| {
        b.total_count
            .cmp(&a.total_count)
            .then_with(|| a.resource.cmp(&b.resource))
    });
    ranked.truncate(limit);
    ranked
}

/// Usage grouped by UTC day and resource for the last `days` days including
/// today, newest day first.
pub fn daily_usage(entries: &[UsageEntry], days: u32, now: DateTime<Utc>) -> Vec<DailyUsage> {
    let window_start = daily_window_start(now, days);
    let mut grouped: BTreeMap<(NaiveDate, String), DailyUsage> = BTreeMap::new();
    for entry in entries.iter().filter(|entry| entry.created_at >= window_start) {
        let date = entry.created_at.date_naive();
        let bucket = grouped
            .entry((date, entry.resource.clone()))
            .or_insert_with(|| DailyUsage {
                date,
                resource: entry.resource.clone(),
                total_count: 0,
                total_tokens: 0,
            });
        bucket.total_count += entry.usage_count;
        bucket.total_tokens += entry.tokens_used.unwrap_or(0);
    }

    let mut rows: Vec<DailyUsage> = grouped.into_values().collect();
    rows.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.resource.cmp(&b.resource)));
    rows
}

pub fn total_count(entries: &[UsageEntry]) -> i64 {
    entries.iter().map(|entry| entry.usage_count).sum()
}

/// Longest daily rollup window, in days.
pub const MAX_DAILY_WINDOW_DAYS: u32 = 366;

/// Start of the UTC day `days - 1` days before `now`. `days` is clamped to
/// `1..=MAX_DAILY_WINDOW_DAYS`.
pub fn daily_window_start(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    let days = days.clamp(1, MAX_DAILY_WINDOW_DAYS);
    day_start(now) - Duration::days(i64::from(days) - 1)
}

pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}
