use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use hive_detect::{
    app_state::{AppState, TilingSettings},
    config::AppConfig,
    db,
    routes::{self, metrics::MetricsState},
    services::{detector::DetectorClient, events::EventPublisher, storage::S3Storage},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing hive-detect server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_gauge!("jobs_pending", "Unfinished jobs under the call cap, per type");

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let storage = S3Storage::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize S3 client");

    let detector = DetectorClient::new(config.detector_endpoints(), config.detector_timeout())
        .expect("Failed to initialize detector client");

    tracing::info!("Connecting to Redis");
    let events = EventPublisher::new(&config.redis_url).expect("Failed to initialize event publisher");

    let tiling = TilingSettings {
        max_tile_dimension: config.tile_max_dimension,
        concurrency: config.tile_concurrency,
    };
    let state = AppState::new(db_pool, Arc::new(storage), Arc::new(detector), events, tiling);

    let metrics_state = MetricsState {
        handle: prometheus_handle,
        app: state.clone(),
    };

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/jobs", post(routes::jobs::enqueue_job))
        .route("/api/v1/jobs/{job_type}/{ref_id}", get(routes::jobs::job_status))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics_state),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting hive-detect on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app).await.expect("Server error");
}
