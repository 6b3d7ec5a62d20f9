use sqlx::PgPool;
use std::sync::Arc;

use crate::services::{
    detector::Detector,
    events::EventPublisher,
    merge::DetectionMerger,
    queue::{JobQueue, PgJobQueue},
    storage::ObjectStore,
};

/// Tiling parameters shared by every tiled job.
#[derive(Debug, Clone, Copy)]
pub struct TilingSettings {
    pub max_tile_dimension: i64,
    pub concurrency: usize,
}

/// Explicitly constructed dependencies, shared by the API routes and the worker loops.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<dyn JobQueue>,
    pub storage: Arc<dyn ObjectStore>,
    pub detector: Arc<dyn Detector>,
    pub events: Arc<EventPublisher>,
    pub merger: DetectionMerger,
    pub tiling: TilingSettings,
}

impl AppState {
    pub fn new(
        db: PgPool,
        storage: Arc<dyn ObjectStore>,
        detector: Arc<dyn Detector>,
        events: EventPublisher,
        tiling: TilingSettings,
    ) -> Self {
        Self {
            queue: Arc::new(PgJobQueue::new(db.clone())),
            merger: DetectionMerger::new(db.clone()),
            db,
            storage,
            detector,
            events: Arc::new(events),
            tiling,
        }
    }
}
