use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::QuotaResult;

use super::expiry::reconcile_instance;
use super::models::{AlertBand, QuotaInfo, QuotaNotification, SubscriptionInstance};
use super::store::LedgerStore;

/// Usage percentages at which each band starts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    pub critical: f64,
    pub high: f64,
    pub notice: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            critical: 90.0,
            high: 80.0,
            notice: 70.0,
        }
    }
}

impl AlertThresholds {
    /// Parses `critical,high,notice`, e.g. `90,80,70`. Values must be
    /// strictly descending and within 0..=100.
    pub fn parse(value: &str) -> Option<Self> {
        let parts = value
            .split(',')
            .map(|raw| raw.trim().parse::<f64>().ok())
            .collect::<Option<Vec<_>>>()?;
        let [critical, high, notice] = parts.as_slice() else {
            return None;
        };
        let thresholds = Self {
            critical: *critical,
            high: *high,
            notice: *notice,
        };
        let ordered = thresholds.critical > thresholds.high && thresholds.high > thresholds.notice;
        let bounded = thresholds.notice >= 0.0 && thresholds.critical <= 100.0;
        (ordered && bounded).then_some(thresholds)
    }

    pub fn classify(&self, usage_percentage: f64) -> Option<AlertBand> {
        if usage_percentage >= self.critical {
            Some(AlertBand::Critical)
        } else if usage_percentage >= self.high {
            Some(AlertBand::High)
        } else if usage_percentage >= self.notice {
            Some(AlertBand::Notice)
        } else {
            None
        }
    }
}

pub fn usage_percentage(info: &QuotaInfo) -> Option<f64> {
    if info.total <= 0 {
        return None;
    }
    Some(info.used as f64 / info.total as f64 * 100.0)
}

/// Threshold crossings for one instance, one per granted resource at most.
pub fn evaluate_instance(
    instance: &SubscriptionInstance,
    thresholds: &AlertThresholds,
    now: DateTime<Utc>,
) -> Vec<QuotaNotification> {
    instance
        .resources()
        .filter_map(|resource| {
            let info = instance.quota_info(resource);
            let percentage = usage_percentage(&info)?;
            let band = thresholds.classify(percentage)?;
            Some(QuotaNotification {
                user_id: instance.user_id,
                instance_id: instance.id,
                plan_name: instance.plan_name.clone(),
                resource: resource.to_string(),
                band,
                usage_percentage: percentage,
                remaining: info.remaining,
                total: info.total,
                observed_at: now,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub evaluated_at: DateTime<Utc>,
    pub instances_checked: usize,
    pub instances_expired: usize,
    pub notifications: Vec<QuotaNotification>,
    pub suppressed: usize,
}

/// key: quota-monitor -> threshold sweep with cooldown dedupe
pub async fn run_sweep(
    store: &dyn LedgerStore,
    thresholds: &AlertThresholds,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> QuotaResult<MonitorReport> {
    let instances = store.list_active_instances().await?;
    let mut report = MonitorReport {
        evaluated_at: now,
        instances_checked: 0,
        instances_expired: 0,
        notifications: Vec::new(),
        suppressed: 0,
    };

    for mut instance in instances {
        if reconcile_instance(store, &mut instance, now).await? {
            report.instances_expired += 1;
        }
        if !instance.is_effectively_active(now) {
            continue;
        }
        report.instances_checked += 1;

        for notification in evaluate_instance(&instance, thresholds, now) {
            if store
                .record_notification_if_absent(&notification, cooldown)
                .await?
            {
                warn!(
                    user_id = notification.user_id,
                    instance = notification.instance_id,
                    plan = %notification.plan_name,
                    resource = %notification.resource,
                    band = notification.band.as_str(),
                    usage_percentage = notification.usage_percentage,
                    remaining = notification.remaining,
                    total = notification.total,
                    "subscription quota threshold crossed"
                );
                report.notifications.push(notification);
            } else {
                report.suppressed += 1;
            }
        }
    }

    info!(
        checked = report.instances_checked,
        expired = report.instances_expired,
        emitted = report.notifications.len(),
        suppressed = report.suppressed,
        "subscription quota monitor sweep completed"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::models::{InstanceStatus, QuotaMap};

    #[test]
    fn bands_do_not_overlap() {
        let thresholds = AlertThresholds::default();
        assert_eq!(thresholds.classify(95.0), Some(AlertBand::Critical));
        assert_eq!(thresholds.classify(90.0), Some(AlertBand::Critical));
        assert_eq!(thresholds.classify(85.0), Some(AlertBand::High));
        assert_eq!(thresholds.classify(70.0), Some(AlertBand::Notice));
        assert_eq!(thresholds.classify(69.9), None);
    }

    #[test]
    fn parses_threshold_triples() {
        assert_eq!(
            AlertThresholds::parse("95, 85, 50"),
            Some(AlertThresholds {
                critical: 95.0,
                high: 85.0,
                notice: 50.0
            })
        );
        assert_eq!(AlertThresholds::parse("70,80,90"), None);
        assert_eq!(AlertThresholds::parse("90,80"), None);
        assert_eq!(AlertThresholds::parse("120,80,70"), None);
    }

    #[test]
    fn zero_total_resources_are_skipped() {
        let now = Utc::now();
        let instance = SubscriptionInstance {
            id: 3,
            user_id: 1,
            plan_id: 1,
            plan_name: "Mixed".to_string(),
            status: InstanceStatus::Active,
            start_at: now - Duration::days(1),
            end_at: now + Duration::days(1),
            granted: QuotaMap::from([("gpt-4".to_string(), 10), ("dall-e".to_string(), 0)]),
            remaining: QuotaMap::from([("gpt-4".to_string(), 1), ("dall-e".to_string(), 0)]),
            consumed: QuotaMap::from([("gpt-4".to_string(), 9)]),
            purchase_price_cents: 0,
            payment_method: None,
            payment_ref: None,
            created_at: now,
            updated_at: now,
        };

        let notifications = evaluate_instance(&instance, &AlertThresholds::default(), now);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].resource, "gpt-4");
        assert_eq!(notifications[0].band, AlertBand::Critical);
        assert_eq!(notifications[0].remaining, 1);
    }
}
