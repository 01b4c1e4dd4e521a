use axum::{
    routing::{get, post, put},
    Router,
};

use crate::subscriptions::api;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/subscriptions/consume", post(api::consume))
        .route(
            "/api/subscriptions/users/:user_id/quotas",
            get(api::user_quotas),
        )
        .route(
            "/api/subscriptions/users/:user_id/summary",
            get(api::user_summary),
        )
        .route("/api/subscriptions/plans", post(api::create_plan))
        .route(
            "/api/subscriptions/plans/:id",
            put(api::update_plan).delete(api::delete_plan),
        )
        .route("/api/subscriptions/purchase", post(api::purchase))
        .route(
            "/api/subscriptions/instances/:id/cancel",
            post(api::cancel_instance),
        )
        .route(
            "/api/subscriptions/sweeps/monitor",
            post(api::run_monitor_sweep),
        )
        .route(
            "/api/subscriptions/sweeps/expiry",
            post(api::run_expiry_sweep),
        )
        .route("/api/subscriptions/reports/sales", get(api::sales_report))
}
