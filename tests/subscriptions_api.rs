use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::{Extension, Router};
use quota_engine::routes::api_routes;
use quota_engine::subscriptions::{EngineConfig, LedgerStore, MemoryLedgerStore, QuotaEngine};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

fn app() -> Router {
    let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
    let engine = QuotaEngine::new(store, EngineConfig::default());
    api_routes().layer(Extension(engine))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

// key: subscription-api-tests -> plan, purchase, consume round trip
#[tokio::test]
async fn purchase_and_consume_over_http() {
    let app = app();
    let (status, plan) = send(
        &app,
        "POST",
        "/api/subscriptions/plans",
        Some(json!({
            "name": "Starter",
            "price_cents": 990,
            "duration_days": 30,
            "resource_quotas": { "gpt-4": 100 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plan["status"], "enabled");

    let (status, instance) = send(
        &app,
        "POST",
        "/api/subscriptions/purchase",
        Some(json!({ "user_id": 7, "plan_id": plan["id"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(instance["remaining"]["gpt-4"], 100);

    let (status, outcome) = send(
        &app,
        "POST",
        "/api/subscriptions/consume",
        Some(json!({ "user_id": 7, "resource": "gpt-4", "amount": 30 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["consumed"], true);
    assert_eq!(outcome["amount_consumed"], 30);
    assert_eq!(outcome["instance_id"], instance["id"]);

    let (status, quotas) = send(&app, "GET", "/api/subscriptions/users/7/quotas", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(quotas["gpt-4"], json!({ "total": 100, "used": 30, "remaining": 70 }));

    let (status, summary) = send(&app, "GET", "/api/subscriptions/users/7/summary", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["active_count"], 1);

    let (status, sales) = send(&app, "GET", "/api/subscriptions/reports/sales", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sales["total_sales"], 1);
    assert_eq!(sales["total_revenue_cents"], 990);
}

#[tokio::test]
async fn missing_quota_is_a_decline_not_an_error() {
    let app = app();
    let (status, outcome) = send(
        &app,
        "POST",
        "/api/subscriptions/consume",
        Some(json!({ "user_id": 99, "resource": "gpt-4", "amount": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["consumed"], false);
    assert_eq!(outcome["amount_consumed"], 0);
}

#[tokio::test]
async fn validation_and_lookup_failures_map_to_statuses() {
    let app = app();
    let (status, _) = send(
        &app,
        "POST",
        "/api/subscriptions/consume",
        Some(json!({ "user_id": 1, "resource": "gpt-4", "amount": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/api/subscriptions/plans",
        Some(json!({
            "name": "Broken",
            "price_cents": 100,
            "duration_days": 30,
            "resource_quotas": { "gpt-4": -1 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/api/subscriptions/purchase",
        Some(json!({ "user_id": 1, "plan_id": 404 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "POST", "/api/subscriptions/instances/404/cancel", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sweeps_and_cancel_are_exposed() {
    let app = app();
    let (_, plan) = send(
        &app,
        "POST",
        "/api/subscriptions/plans",
        Some(json!({
            "name": "Starter",
            "price_cents": 990,
            "duration_days": 30,
            "resource_quotas": { "gpt-4": 10 }
        })),
    )
    .await;
    let (_, instance) = send(
        &app,
        "POST",
        "/api/subscriptions/purchase",
        Some(json!({ "user_id": 3, "plan_id": plan["id"] })),
    )
    .await;

    let uri = format!("/api/subscriptions/instances/{}/cancel", instance["id"]);
    let (status, canceled) = send(&app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(canceled["status"], "canceled");

    let (status, expired) = send(&app, "POST", "/api/subscriptions/sweeps/expiry", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(expired["expired"], 0);

    let (status, report) = send(&app, "POST", "/api/subscriptions/sweeps/monitor", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["notifications"], json!([]));
}

#[tokio::test]
async fn plans_can_be_edited_and_deleted() {
    let app = app();
    let (_, plan) = send(
        &app,
        "POST",
        "/api/subscriptions/plans",
        Some(json!({
            "name": "Starter",
            "price_cents": 990,
            "duration_days": 30,
            "resource_quotas": { "gpt-4": 10 }
        })),
    )
    .await;
    let uri = format!("/api/subscriptions/plans/{}", plan["id"]);

    let (status, edited) = send(
        &app,
        "PUT",
        &uri,
        Some(json!({
            "name": "Starter",
            "price_cents": 1490,
            "duration_days": 30,
            "resource_quotas": { "gpt-4": 50 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["resource_quotas"]["gpt-4"], 50);

    let (status, _) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
