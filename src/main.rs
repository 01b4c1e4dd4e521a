use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use quota_engine::config;
use quota_engine::routes::api_routes;
use quota_engine::subscriptions::{
    scheduler, EngineConfig, LedgerStore, PgLedgerStore, PgLedgerStoreConfig, QuotaEngine,
};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Quota Engine API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    // Run migrations if available
    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(
        pool.clone(),
        PgLedgerStoreConfig::from_env(),
    ));
    let engine_config = EngineConfig::from_env();
    tracing::info!(
        policy = engine_config.selection_policy.as_str(),
        max_attempts = engine_config.max_consume_attempts,
        retention_days = engine_config.usage_retention_days,
        "quota engine configured"
    );
    let engine = QuotaEngine::new(store, engine_config);
    scheduler::spawn(engine.clone());

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(engine));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
