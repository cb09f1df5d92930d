use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tokio::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use sync_engine::api::{self, ApiState};
use sync_engine::config;
use sync_engine::executor::HttpSyncExecutor;
use sync_engine::housekeeping::{self, Housekeeping, RetentionPolicy};
use sync_engine::orchestrator::{self, tick};
use sync_engine::store::PgStore;
use sync_engine::{RetryPolicy, SyncEngine, SystemClock};

async fn root() -> &'static str {
    "Sync Engine API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(*config::DATABASE_MAX_CONNECTIONS)
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

    let retry = RetryPolicy::from_env();
    let executor = HttpSyncExecutor::new(
        config::SYNC_EXECUTOR_URL.as_str(),
        config::SYNC_EXECUTOR_TOKEN.clone(),
        retry.attempt_timeout,
    )?;
    let engine = SyncEngine::from_store(
        Arc::new(PgStore::new(pool.clone())),
        Arc::new(SystemClock),
        Arc::new(executor),
        retry,
    )
    .with_due_batch(*config::SYNC_DUE_BATCH_SIZE);

    let queue = orchestrator::start_worker_pool(
        engine.clone(),
        *config::SYNC_WORKER_CONCURRENCY,
        *config::SYNC_WORKER_QUEUE_DEPTH,
    );
    match engine.recover_orphans(&queue).await {
        Ok(summary) => tracing::info!(
            requeued = summary.requeued,
            failed = summary.failed,
            "orphan recovery finished"
        ),
        Err(error) => tracing::warn!(?error, "orphan recovery failed"),
    }
    tick::spawn(
        engine.clone(),
        queue.clone(),
        Duration::from_secs(*config::SYNC_TICK_INTERVAL_SECS),
        *config::SYNC_ORPHAN_SWEEP_TICKS,
    );

    let housekeeping = Housekeeping::new(&engine, RetentionPolicy::from_env());
    housekeeping::spawn(
        housekeeping.clone(),
        Duration::from_secs(*config::HOUSEKEEPING_INTERVAL_SECS),
    );

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api::router(ApiState {
            engine,
            queue,
            housekeeping,
        }))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
