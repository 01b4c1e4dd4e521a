use std::collections::BTreeMap;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppResult;

use super::models::{
    ConsumeOutcome, ConsumeRequest, NewSubscriptionPlan, QuotaInfo, SubscriptionInstance,
    SubscriptionPlan,
};
use super::monitor::MonitorReport;
use super::reports::SalesReport;
use super::service::{PurchaseRequest, QuotaEngine, SubscriptionSummary};

pub async fn consume(
    Extension(engine): Extension<QuotaEngine>,
    Json(mut payload): Json<ConsumeRequest>,
) -> AppResult<Json<ConsumeOutcome>> {
    if payload.request_id.is_none() {
        payload.request_id = Some(Uuid::new_v4().to_string());
    }
    let outcome = engine.try_consume(&payload, Utc::now()).await?;
    Ok(Json(outcome))
}

pub async fn user_quotas(
    Extension(engine): Extension<QuotaEngine>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<BTreeMap<String, QuotaInfo>>> {
    let quotas = engine.quota_summary(user_id, Utc::now()).await?;
    Ok(Json(quotas))
}

pub async fn user_summary(
    Extension(engine): Extension<QuotaEngine>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<SubscriptionSummary>> {
    let summary = engine.subscription_summary(user_id, Utc::now()).await?;
    Ok(Json(summary))
}

pub async fn create_plan(
    Extension(engine): Extension<QuotaEngine>,
    Json(payload): Json<NewSubscriptionPlan>,
) -> AppResult<Json<SubscriptionPlan>> {
    let plan = engine.create_plan(&payload, Utc::now()).await?;
    Ok(Json(plan))
}

pub async fn update_plan(
    Extension(engine): Extension<QuotaEngine>,
    Path(plan_id): Path<i64>,
    Json(payload): Json<NewSubscriptionPlan>,
) -> AppResult<Json<SubscriptionPlan>> {
    let plan = engine.update_plan(plan_id, &payload, Utc::now()).await?;
    Ok(Json(plan))
}

pub async fn delete_plan(
    Extension(engine): Extension<QuotaEngine>,
    Path(plan_id): Path<i64>,
) -> AppResult<StatusCode> {
    engine.delete_plan(plan_id, Utc::now()).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn purchase(
    Extension(engine): Extension<QuotaEngine>,
    Json(payload): Json<PurchaseRequest>,
) -> AppResult<Json<SubscriptionInstance>> {
    let instance = engine.purchase(&payload, Utc::now()).await?;
    Ok(Json(instance))
}

pub async fn cancel_instance(
    Extension(engine): Extension<QuotaEngine>,
    Path(instance_id): Path<i64>,
) -> AppResult<Json<SubscriptionInstance>> {
    let now = Utc::now();
    engine.cancel(instance_id, now).await?;
    let instance = engine.instance(instance_id, now).await?;
    Ok(Json(instance))
}

pub async fn run_monitor_sweep(
    Extension(engine): Extension<QuotaEngine>,
) -> AppResult<Json<MonitorReport>> {
    let report = engine.run_monitor_sweep(Utc::now()).await?;
    Ok(Json(report))
}

pub async fn run_expiry_sweep(
    Extension(engine): Extension<QuotaEngine>,
) -> AppResult<Json<serde_json::Value>> {
    let expired = engine.run_expiry_sweep(Utc::now()).await?;
    Ok(Json(serde_json::json!({ "expired": expired })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

pub async fn sales_report(
    Extension(engine): Extension<QuotaEngine>,
    Query(window): Query<ReportWindow>,
) -> AppResult<Json<SalesReport>> {
    let report = engine
        .sales_report(window.start, window.end, Utc::now())
        .await?;
    Ok(Json(report))
}
