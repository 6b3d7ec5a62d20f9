//! Detection job tests: the dispatcher against a real PostgreSQL database
//! with an in-memory object store and a scripted detector
//!
//! Requires DATABASE_URL pointing at a disposable database. Redis is not
//! needed; partial events fail to publish and are only logged.
//!
//! Run with: cargo test --test pipeline_test -- --ignored

mod helpers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use image::{DynamicImage, RgbImage};
use sqlx::PgPool;

use hive_detect::{
    app_state::{AppState, TilingSettings},
    db::detections::{self, AttemptStamp, FrameSideCollection},
    models::{
        detection::{Detection, DetectionClass},
        job::{FrameSideTarget, Job, JobPayload},
    },
    services::{
        coords::{CenterBox, RawDetection},
        detector::{Detector, DetectorError, DetectorKind},
        events::EventPublisher,
        merge::{DetectionDelta, DetectionMerger},
        storage::{ObjectStore, StorageError},
        tiler,
    },
    worker::{handlers::JobDispatcher, JobError, JobHandler},
};
use helpers::*;

#[derive(Default)]
struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn upload(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        self.objects.lock().unwrap().insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[derive(Clone, Copy)]
enum Script {
    /// One worker bee and one box with broken geometry per call.
    OneBee,
    /// Like `OneBee`, but the first call times out.
    FirstCallTimesOut,
    /// Like `OneBee`, but the first call lets a newer attempt take the job.
    FirstCallLosesTheJob,
}

struct ScriptedDetector {
    script: Script,
    pool: PgPool,
    job_id: i64,
    calls: AtomicUsize,
    content_types: Mutex<Vec<String>>,
}

impl ScriptedDetector {
    fn new(script: Script, pool: PgPool, job_id: i64) -> Self {
        Self {
            script,
            pool,
            job_id,
            calls: AtomicUsize::new(0),
            content_types: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn center(class: DetectionClass, cx: f64) -> RawDetection {
    RawDetection::Center {
        class,
        bbox: CenterBox { cx, cy: 0.5, w: 0.2, h: 0.2 },
        confidence: 0.9,
    }
}

#[async_trait]
impl Detector for ScriptedDetector {
    async fn detect(
        &self,
        kind: DetectorKind,
        _image: Vec<u8>,
        content_type: &str,
    ) -> Result<Vec<RawDetection>, DetectorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.content_types.lock().unwrap().push(content_type.to_string());

        match self.script {
            Script::FirstCallTimesOut if call == 0 => return Err(DetectorError::Timeout(kind)),
            Script::FirstCallLosesTheJob if call == 0 => {
                bump_attempt(&self.pool, self.job_id).await;
            }
            _ => {}
        }

        if kind == DetectorKind::Cells {
            return Ok(vec![center(DetectionClass::Honey, 0.3), center(DetectionClass::Eggs, 0.7)]);
        }
        Ok(vec![
            center(DetectionClass::WorkerBee, 0.5),
            center(DetectionClass::WorkerBee, f64::NAN),
        ])
    }
}

/// A 96x32 photo, cut into three 32x32 tiles.
fn photo_jpeg() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::new(96, 32));
    tiler::encode_jpeg(&image).expect("Failed to encode test photo")
}

fn photo_png() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::new(96, 32));
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("Failed to encode test photo");
    out.into_inner()
}

fn state_with(pool: &PgPool, store: MemoryStore, detector: Arc<ScriptedDetector>, concurrency: usize) -> AppState {
    let events = EventPublisher::new("redis://127.0.0.1:1/").expect("Redis URL should parse");
    AppState::new(
        pool.clone(),
        Arc::new(store),
        detector,
        events,
        TilingSettings {
            max_tile_dimension: 32,
            concurrency,
        },
    )
}

async fn store_original(pool: &PgPool, target: &FrameSideTarget, ext: &str, bytes: Vec<u8>) -> MemoryStore {
    sqlx::query("UPDATE files SET ext = $2 WHERE id = $1")
        .bind(target.file_id)
        .bind(ext)
        .execute(pool)
        .await
        .expect("Failed to set file extension");

    let store = MemoryStore::default();
    let key = format!("{}/testhash/original.{}", target.user_id, ext);
    store.upload(&key, &bytes, "").await.unwrap();
    store
}

fn claimed(payload: JobPayload, stamp: AttemptStamp) -> Job {
    Job {
        id: stamp.job_id,
        job_type: payload.job_type(),
        ref_id: payload.ref_id(),
        payload,
        process_start_time: None,
        calls: 1,
        attempt: stamp.attempt,
        error: None,
    }
}

async fn stored_bees(pool: &PgPool, target: &FrameSideTarget) -> Vec<Detection> {
    let value = detections::frame_side_collection(pool, target, "detected_bees")
        .await
        .unwrap()
        .expect("Frame side record should exist");
    serde_json::from_value(value).expect("Collection should hold detections")
}

async fn worker_bee_count(pool: &PgPool, target: &FrameSideTarget) -> i32 {
    sqlx::query_scalar("SELECT worker_bee_count FROM files_frame_side_rel WHERE file_id = $1 AND frame_side_id = $2")
        .bind(target.file_id)
        .bind(target.frame_side_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_failed_tile_does_not_fail_the_job() {
    let pool = test_pool().await;
    let target = seed_frame_side(&pool).await;
    let payload = JobPayload::DetectBees(target);
    let stamp = seed_claimed_job(&pool, &payload).await;

    let store = store_original(&pool, &target, "jpg", photo_jpeg()).await;
    let detector = Arc::new(ScriptedDetector::new(Script::FirstCallTimesOut, pool.clone(), stamp.job_id));
    let dispatcher = JobDispatcher::new(state_with(&pool, store, detector.clone(), 2));

    let notice = dispatcher
        .handle(&claimed(payload, stamp))
        .await
        .expect("A timed out tile should not fail the job")
        .expect("Detection jobs announce their completion");

    assert_eq!(detector.calls(), 3);
    // Two surviving tiles, each with one valid box; the NaN boxes are gone
    let bees = stored_bees(&pool, &target).await;
    assert_eq!(bees.len(), 2);
    assert!(bees.iter().all(|b| b.x.is_finite() && b.class == DetectionClass::WorkerBee));
    assert_eq!(worker_bee_count(&pool, &target).await, 2);

    assert_eq!(notice.body["isComplete"], true);
    assert_eq!(notice.body["fileId"], target.file_id);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_rerun_after_partial_attempt_matches_a_clean_run() {
    let pool = test_pool().await;
    let target = seed_frame_side(&pool).await;
    let payload = JobPayload::DetectBees(target);
    let first = seed_claimed_job(&pool, &payload).await;

    // The first attempt merges one tile, then its worker goes silent
    let merger = DetectionMerger::new(pool.clone());
    merger
        .begin_frame_side(&target, first, FrameSideCollection::Bees)
        .await
        .unwrap();
    let partial = DetectionDelta::new(vec![
        Detection::new(DetectionClass::WorkerBee, 0.1, 0.5, 0.02, 0.02, 0.8),
        Detection::new(DetectionClass::WorkerBee, 0.2, 0.5, 0.02, 0.02, 0.8),
    ]);
    merger
        .append_frame_side(&target, first, FrameSideCollection::Bees, &partial)
        .await
        .unwrap();

    // The lock times out and the job is reclaimed
    let second = AttemptStamp {
        job_id: first.job_id,
        attempt: bump_attempt(&pool, first.job_id).await,
    };
    let store = store_original(&pool, &target, "jpg", photo_jpeg()).await;
    let detector = Arc::new(ScriptedDetector::new(Script::OneBee, pool.clone(), first.job_id));
    let dispatcher = JobDispatcher::new(state_with(&pool, store, detector, 3));

    dispatcher
        .handle(&claimed(payload, second))
        .await
        .expect("Reclaimed attempt should succeed");

    // Exactly one clean run: one bee per tile, nothing left from the first attempt
    assert_eq!(stored_bees(&pool, &target).await.len(), 3);
    assert_eq!(worker_bee_count(&pool, &target).await, 3);

    // A late tile from the silent worker changes nothing
    let late = merger
        .append_frame_side(&target, first, FrameSideCollection::Bees, &partial)
        .await
        .unwrap();
    assert!(late.is_stale());
    assert_eq!(worker_bee_count(&pool, &target).await, 3);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_superseded_attempt_stops_calling_the_detector() {
    let pool = test_pool().await;
    let target = seed_frame_side(&pool).await;
    let payload = JobPayload::DetectBees(target);
    let stamp = seed_claimed_job(&pool, &payload).await;

    let store = store_original(&pool, &target, "jpg", photo_jpeg()).await;
    let detector = Arc::new(ScriptedDetector::new(Script::FirstCallLosesTheJob, pool.clone(), stamp.job_id));
    let dispatcher = JobDispatcher::new(state_with(&pool, store, detector.clone(), 1));

    let result = dispatcher.handle(&claimed(payload, stamp)).await;

    assert!(matches!(result, Err(JobError::Superseded)));
    assert_eq!(detector.calls(), 1, "tiles after the rejected merge should not reach the detector");
    assert!(stored_bees(&pool, &target).await.is_empty());
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_whole_image_is_sent_with_its_own_content_type() {
    let pool = test_pool().await;
    let target = seed_frame_side(&pool).await;
    let payload = JobPayload::DetectCells(target);
    let stamp = seed_claimed_job(&pool, &payload).await;

    let store = store_original(&pool, &target, "png", photo_png()).await;
    let detector = Arc::new(ScriptedDetector::new(Script::OneBee, pool.clone(), stamp.job_id));
    let dispatcher = JobDispatcher::new(state_with(&pool, store, detector.clone(), 1));

    let notice = dispatcher
        .handle(&claimed(payload, stamp))
        .await
        .expect("Cells job should succeed")
        .expect("Cells job announces its result");

    assert_eq!(*detector.content_types.lock().unwrap(), vec!["image/png".to_string()]);
    assert_eq!(notice.channel.name(), format!("7.frame_side.{}.frame_resources_detected", target.frame_side_id));
    assert_eq!(notice.body["delta"].as_array().map(|a| a.len()), Some(2));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_tiles_are_sent_as_jpeg() {
    let pool = test_pool().await;
    let target = seed_frame_side(&pool).await;
    let payload = JobPayload::DetectBees(target);
    let stamp = seed_claimed_job(&pool, &payload).await;

    let store = store_original(&pool, &target, "png", photo_png()).await;
    let detector = Arc::new(ScriptedDetector::new(Script::OneBee, pool.clone(), stamp.job_id));
    let dispatcher = JobDispatcher::new(state_with(&pool, store, detector.clone(), 3));

    dispatcher.handle(&claimed(payload, stamp)).await.unwrap();

    let types = detector.content_types.lock().unwrap().clone();
    assert_eq!(types.len(), 3);
    assert!(types.iter().all(|t| t == "image/jpeg"));
}
