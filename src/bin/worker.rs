use hive_detect::{
    app_state::{AppState, TilingSettings},
    config::AppConfig,
    db,
    models::job::JobType,
    services::{detector::DetectorClient, events::EventPublisher, storage::S3Storage},
    worker::{handlers::JobDispatcher, run_loop, JobHandler, LoopDelays},
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting detection worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    let metrics_addr: SocketAddr = config
        .metrics_addr
        .parse()
        .expect("METRICS_ADDR must be a socket address");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    metrics::describe_histogram!("job_processing_seconds", "Time spent in a job's work function");
    metrics::describe_counter!("jobs_completed_total", "Jobs marked complete");
    metrics::describe_counter!("jobs_failed_total", "Job attempts that failed");
    metrics::describe_counter!("tiles_failed_total", "Tiles whose detection or merge failed");
    metrics::describe_counter!("detections_dropped_total", "Detections dropped for invalid geometry");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!("Initializing services");
    let storage = S3Storage::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize S3 client");

    let detector = DetectorClient::new(config.detector_endpoints(), config.detector_timeout())
        .expect("Failed to initialize detector client");

    let events = EventPublisher::new(&config.redis_url).expect("Failed to initialize event publisher");

    let tiling = TilingSettings {
        max_tile_dimension: config.tile_max_dimension,
        concurrency: config.tile_concurrency,
    };
    let state = AppState::new(db_pool, Arc::new(storage), Arc::new(detector), events, tiling);

    let handler: Arc<dyn JobHandler> = Arc::new(JobDispatcher::new(state.clone()));
    let cancel = CancellationToken::new();

    let loops: Vec<_> = JobType::iter()
        .map(|job_type| {
            tokio::spawn(run_loop(
                state.queue.clone(),
                job_type,
                handler.clone(),
                LoopDelays::default(),
                cancel.clone(),
            ))
        })
        .collect();

    tracing::info!(loops = loops.len(), "Worker ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        // Without a signal handler the loops simply run until the process is killed.
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested, finishing in-flight jobs");
    cancel.cancel();

    for handle in loops {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Worker loop panicked");
        }
    }

    state.db.close().await;
    tracing::info!("Worker stopped");
}
