use serde::Deserialize;
use std::time::Duration;

use crate::services::detector::DetectorEndpoints;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8800"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus listener of the worker process
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for partial-result events
    pub redis_url: String,

    /// Bucket with uploaded originals and resized copies
    pub s3_bucket: String,

    /// S3-compatible endpoint URL
    pub s3_endpoint: String,

    pub s3_access_key: String,

    pub s3_secret_key: String,

    pub bee_detector_url: String,
    pub cell_detector_url: String,
    pub cup_detector_url: String,
    pub queen_detector_url: String,
    pub varroa_detector_url: String,
    pub varroa_bottom_detector_url: String,

    /// Per-request timeout for detector calls
    #[serde(default = "default_detector_timeout_secs")]
    pub detector_timeout_secs: u64,

    /// Upper bound on tile width and height, in pixels
    #[serde(default = "default_tile_max_dimension")]
    pub tile_max_dimension: i64,

    /// Tiles of one image in flight at once
    #[serde(default = "default_tile_concurrency")]
    pub tile_concurrency: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8800".to_string()
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9100".to_string()
}

fn default_detector_timeout_secs() -> u64 {
    60
}

fn default_tile_max_dimension() -> i64 {
    1024
}

fn default_tile_concurrency() -> usize {
    4
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn detector_endpoints(&self) -> DetectorEndpoints {
        DetectorEndpoints {
            bees: self.bee_detector_url.clone(),
            cells: self.cell_detector_url.clone(),
            cups: self.cup_detector_url.clone(),
            queens: self.queen_detector_url.clone(),
            varroa: self.varroa_detector_url.clone(),
            varroa_bottom: self.varroa_bottom_detector_url.clone(),
        }
    }

    pub fn detector_timeout(&self) -> Duration {
        Duration::from_secs(self.detector_timeout_secs)
    }
}
