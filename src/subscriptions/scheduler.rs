use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

use crate::config;

use super::monitor::MonitorReport;
use super::service::QuotaEngine;

#[derive(Debug)]
pub struct TickSummary {
    pub expired: u64,
    pub monitor: MonitorReport,
}

/// key: subscription-sweep-scheduler -> hourly expiry + monitor, daily retention
pub fn spawn(engine: QuotaEngine) {
    let sweep_interval = TokioDuration::from_secs(*config::SUBSCRIPTION_SWEEP_INTERVAL_SECS);
    let retention_interval =
        TokioDuration::from_secs(*config::USAGE_RETENTION_SWEEP_INTERVAL_SECS);

    let sweep_engine = engine.clone();
    tokio::spawn(async move {
        let mut ticker = time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_tick(&sweep_engine, Utc::now()).await {
                warn!(?err, "subscription sweep tick failed");
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = time::interval(retention_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = process_retention_tick(&engine, Utc::now()).await {
                warn!(?err, "usage ledger retention tick failed");
            }
        }
    });
}

/// key: subscription-sweep-scheduler -> tick handler
pub async fn process_tick(engine: &QuotaEngine, now: DateTime<Utc>) -> Result<TickSummary> {
    let expired = engine.run_expiry_sweep(now).await?;
    let monitor = engine.run_monitor_sweep(now).await?;
    info!(
        expired,
        notifications = monitor.notifications.len(),
        "subscription sweep tick completed"
    );
    Ok(TickSummary { expired, monitor })
}

pub async fn process_retention_tick(engine: &QuotaEngine, now: DateTime<Utc>) -> Result<u64> {
    Ok(engine.run_retention_sweep(now).await?)
}
