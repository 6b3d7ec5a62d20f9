use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{resize, CompletionNotice, JobError, JobHandler};
use crate::app_state::AppState;
use crate::db::detections::{AttemptStamp, FrameSideCollection};
use crate::db::files;
use crate::models::detection::Detection;
use crate::models::file::FileRecord;
use crate::models::job::{BoxTarget, FrameSideTarget, Job, JobPayload};
use crate::services::coords::{self, RawDetection};
use crate::services::detector::DetectorKind;
use crate::services::events::EventChannel;
use crate::services::merge::{DetectionDelta, MergeError, MergeOutcome};
use crate::services::tiler::{self, TileDescriptor};

/// Routes every claimed job to the work function of its payload.
pub struct JobDispatcher {
    state: AppState,
}

impl JobDispatcher {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl JobHandler for JobDispatcher {
    async fn handle(&self, job: &Job) -> Result<Option<CompletionNotice>, JobError> {
        use FrameSideCollection::*;

        let notice = match &job.payload {
            JobPayload::Resize(t) => {
                resize::resize_file(&self.state, t.file_id).await?;
                return Ok(None);
            }
            JobPayload::DetectBees(t) => {
                self.run_tiled(job, DetectorKind::Bees, MergeTarget::frame_side(*t, Bees)).await?
            }
            JobPayload::DetectQueens(t) => {
                self.run_tiled(job, DetectorKind::Queens, MergeTarget::frame_side(*t, Queens)).await?
            }
            JobPayload::DetectVarroa(t) => {
                self.run_tiled(job, DetectorKind::Varroa, MergeTarget::frame_side(*t, Varroa)).await?
            }
            JobPayload::DetectVarroaBottom(t) => {
                self.run_tiled(job, DetectorKind::VarroaBottom, MergeTarget::HiveBox(*t)).await?
            }
            JobPayload::DetectCells(t) => self.run_whole_image(job, DetectorKind::Cells, *t).await?,
            JobPayload::DetectCups(t) => self.run_whole_image(job, DetectorKind::Cups, *t).await?,
        };
        Ok(Some(notice))
    }

    /// Final event, sent only once the job is recorded complete.
    async fn announce(&self, _job: &Job, notice: CompletionNotice) {
        self.state.events.publish_logged(&notice.channel, &notice.body).await;
    }
}

/// Record a tiled job appends into.
#[derive(Debug, Clone, Copy)]
enum MergeTarget {
    FrameSide {
        target: FrameSideTarget,
        collection: FrameSideCollection,
    },
    HiveBox(BoxTarget),
}

impl MergeTarget {
    fn frame_side(target: FrameSideTarget, collection: FrameSideCollection) -> Self {
        MergeTarget::FrameSide { target, collection }
    }

    fn file_id(&self) -> i64 {
        match self {
            MergeTarget::FrameSide { target, .. } => target.file_id,
            MergeTarget::HiveBox(target) => target.file_id,
        }
    }

    fn channel(&self) -> EventChannel {
        match self {
            MergeTarget::FrameSide { target, collection } => {
                let event = match collection {
                    FrameSideCollection::Bees => "bees_partially_detected",
                    FrameSideCollection::Queens => "queens_partially_detected",
                    FrameSideCollection::Varroa => "varroa_partially_detected",
                };
                EventChannel::frame_side(target.user_id, target.frame_side_id, event)
            }
            MergeTarget::HiveBox(target) => {
                EventChannel::hive_box(target.user_id, target.box_id, "varroa_bottom_partially_detected")
            }
        }
    }
}

/// Partial result pushed to subscribers after each merge.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DetectionEvent<'a> {
    file_id: i64,
    delta: &'a [Detection],
    counters: serde_json::Value,
    is_complete: bool,
}

#[derive(Debug)]
enum TileOutcome {
    Merged(usize),
    Empty,
    Failed,
    Stale,
}

impl JobDispatcher {
    async fn run_tiled(
        &self,
        job: &Job,
        kind: DetectorKind,
        target: MergeTarget,
    ) -> Result<CompletionNotice, JobError> {
        let stamp = AttemptStamp {
            job_id: job.id,
            attempt: job.attempt,
        };

        // Clear what an earlier attempt may have appended before this one starts.
        if self.begin(&target, stamp).await? {
            return Err(JobError::Superseded);
        }

        let file = load_file(&self.state, target.file_id()).await?;
        let image = load_image(&self.state, &file).await?;
        let tiles = tiler::plan_tiles(image.width(), image.height(), self.state.tiling.max_tile_dimension);
        let tile_count = tiles.len();

        tracing::info!(
            job_id = job.id,
            job_type = %job.job_type,
            ref_id = job.ref_id,
            attempt = job.attempt,
            width = image.width(),
            height = image.height(),
            tiles = tile_count,
            "Dispatching tiles"
        );

        let concurrency = self.state.tiling.concurrency.max(1);
        // Set by the first tile whose merge is rejected; later tiles skip the detector.
        let superseded = AtomicBool::new(false);
        let outcomes: Vec<TileOutcome> = stream::iter(tiles)
            .map(|tile| self.process_tile(job, kind, target, stamp, Arc::clone(&image), tile, &superseded))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut merged = 0;
        let mut failed = 0;
        let mut stale = 0;
        for outcome in &outcomes {
            match outcome {
                TileOutcome::Merged(n) => merged += n,
                TileOutcome::Empty => {}
                TileOutcome::Failed => failed += 1,
                TileOutcome::Stale => stale += 1,
            }
        }

        if stale > 0 {
            return Err(JobError::Superseded);
        }
        if failed > 0 {
            tracing::warn!(
                job_id = job.id,
                job_type = %job.job_type,
                ref_id = job.ref_id,
                failed_tiles = failed,
                tiles = tile_count,
                "Some tiles failed; their detections are missing"
            );
        }

        tracing::info!(
            job_id = job.id,
            job_type = %job.job_type,
            ref_id = job.ref_id,
            detections = merged,
            "All tiles processed"
        );

        let done = DetectionEvent {
            file_id: target.file_id(),
            delta: &[],
            counters: serde_json::Value::Null,
            is_complete: true,
        };
        Ok(CompletionNotice {
            channel: target.channel(),
            body: serde_json::to_value(&done)?,
        })
    }

    /// Reset the attempt's slice of the record. Returns true when the attempt is stale.
    async fn begin(&self, target: &MergeTarget, stamp: AttemptStamp) -> Result<bool, MergeError> {
        let stale = match target {
            MergeTarget::FrameSide { target, collection } => self
                .state
                .merger
                .begin_frame_side(target, stamp, *collection)
                .await?
                .is_stale(),
            MergeTarget::HiveBox(target) => self.state.merger.begin_box_varroa(target, stamp).await?.is_stale(),
        };
        Ok(stale)
    }

    /// Detect and merge one tile. Failures stay with the tile.
    #[allow(clippy::too_many_arguments)]
    async fn process_tile(
        &self,
        job: &Job,
        kind: DetectorKind,
        target: MergeTarget,
        stamp: AttemptStamp,
        image: Arc<DynamicImage>,
        tile: TileDescriptor,
        superseded: &AtomicBool,
    ) -> TileOutcome {
        if superseded.load(Ordering::Acquire) {
            return TileOutcome::Stale;
        }

        let detections = match self.detect_tile(kind, image, tile).await {
            Ok(d) => d,
            Err(e) => {
                metrics::counter!("tiles_failed_total", "detector" => kind.to_string()).increment(1);
                tracing::warn!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    ref_id = job.ref_id,
                    attempt = job.attempt,
                    x = tile.x,
                    y = tile.y,
                    error = %e,
                    "Tile detection failed"
                );
                return TileOutcome::Failed;
            }
        };

        let delta = DetectionDelta::new(detections);
        if delta.is_empty() {
            return TileOutcome::Empty;
        }
        if superseded.load(Ordering::Acquire) {
            return TileOutcome::Stale;
        }

        match self.merge_tile(&target, stamp, &delta).await {
            Ok(MergeOutcome::Applied(counters)) => {
                let event = DetectionEvent {
                    file_id: target.file_id(),
                    delta: &delta.detections,
                    counters,
                    is_complete: false,
                };
                self.state.events.publish_logged(&target.channel(), &event).await;
                TileOutcome::Merged(delta.detections.len())
            }
            Ok(MergeOutcome::Stale) => {
                superseded.store(true, Ordering::Release);
                tracing::warn!(
                    job_id = job.id,
                    attempt = job.attempt,
                    x = tile.x,
                    y = tile.y,
                    "Dropping tile from a superseded attempt"
                );
                TileOutcome::Stale
            }
            Err(e) => {
                metrics::counter!("tiles_failed_total", "detector" => kind.to_string()).increment(1);
                tracing::warn!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    ref_id = job.ref_id,
                    x = tile.x,
                    y = tile.y,
                    error = %e,
                    "Tile merge failed"
                );
                TileOutcome::Failed
            }
        }
    }

    async fn detect_tile(
        &self,
        kind: DetectorKind,
        image: Arc<DynamicImage>,
        tile: TileDescriptor,
    ) -> Result<Vec<Detection>, JobError> {
        let jpeg = tokio::task::spawn_blocking(move || tiler::extract_region(&image, &tile)).await??;
        let raw = self.state.detector.detect(kind, jpeg, "image/jpeg").await?;
        Ok(normalize_all(kind, &raw, &tile))
    }

    async fn merge_tile(
        &self,
        target: &MergeTarget,
        stamp: AttemptStamp,
        delta: &DetectionDelta,
    ) -> Result<MergeOutcome<serde_json::Value>, MergeError> {
        match target {
            MergeTarget::FrameSide { target, collection } => {
                match self.state.merger.append_frame_side(target, stamp, *collection, delta).await? {
                    MergeOutcome::Applied(counters) => Ok(MergeOutcome::Applied(
                        serde_json::to_value(counters).map_err(MergeError::Serialize)?,
                    )),
                    MergeOutcome::Stale => Ok(MergeOutcome::Stale),
                }
            }
            MergeTarget::HiveBox(target) => match self.state.merger.append_box_varroa(target, stamp, delta).await? {
                MergeOutcome::Applied(varroa_count) => {
                    Ok(MergeOutcome::Applied(serde_json::json!({ "varroaCount": varroa_count })))
                }
                MergeOutcome::Stale => Ok(MergeOutcome::Stale),
            },
        }
    }

    /// Single-shot detectors: one call on the whole photo, then overwrite.
    async fn run_whole_image(
        &self,
        job: &Job,
        kind: DetectorKind,
        target: FrameSideTarget,
    ) -> Result<CompletionNotice, JobError> {
        let stamp = AttemptStamp {
            job_id: job.id,
            attempt: job.attempt,
        };
        let file = load_file(&self.state, target.file_id).await?;
        let bytes = self.state.storage.download(&file.original_key()).await?;
        let (width, height) = match (file.width, file.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w as u32, h as u32),
            _ => {
                let header = bytes.clone();
                tokio::task::spawn_blocking(move || tiler::decode_dimensions(&header)).await??
            }
        };

        let raw = self.state.detector.detect(kind, bytes, file.content_type()).await?;
        let detections = normalize_all(kind, &raw, &TileDescriptor::whole(width, height));

        let (outcome, event) = match kind {
            DetectorKind::Cups => (
                self.state.merger.overwrite_queen_cups(&target, stamp, &detections).await?,
                "queen_cups_detected",
            ),
            _ => (
                self.state.merger.overwrite_cells(&target, stamp, &detections).await?,
                "frame_resources_detected",
            ),
        };

        let MergeOutcome::Applied(counters) = outcome else {
            return Err(JobError::Superseded);
        };

        tracing::info!(
            job_id = job.id,
            job_type = %job.job_type,
            ref_id = job.ref_id,
            detections = detections.len(),
            "Whole-image detections stored"
        );

        let body = DetectionEvent {
            file_id: target.file_id,
            delta: &detections,
            counters: serde_json::to_value(counters).map_err(MergeError::Serialize)?,
            is_complete: true,
        };
        Ok(CompletionNotice {
            channel: EventChannel::frame_side(target.user_id, target.frame_side_id, event),
            body: serde_json::to_value(&body)?,
        })
    }
}

/// Convert raw boxes to image-relative detections, dropping invalid geometry.
fn normalize_all(kind: DetectorKind, raw: &[RawDetection], tile: &TileDescriptor) -> Vec<Detection> {
    raw.iter()
        .filter_map(|r| match coords::normalize(r, tile) {
            Ok(d) => Some(d),
            Err(e) => {
                metrics::counter!("detections_dropped_total", "detector" => kind.to_string()).increment(1);
                tracing::debug!(detector = %kind, x = tile.x, y = tile.y, error = %e, "Dropping detection");
                None
            }
        })
        .collect()
}

pub(crate) async fn load_file(state: &AppState, file_id: i64) -> Result<FileRecord, JobError> {
    files::get_file(&state.db, file_id)
        .await?
        .ok_or(JobError::MissingFile(file_id))
}

/// Download and decode the original, recording its dimensions on the file row.
pub(crate) async fn load_image(state: &AppState, file: &FileRecord) -> Result<Arc<DynamicImage>, JobError> {
    let bytes = state.storage.download(&file.original_key()).await?;
    let image = tokio::task::spawn_blocking(move || tiler::decode_image(&bytes)).await??;

    let (width, height) = (image.width() as i32, image.height() as i32);
    if file.width != Some(width) || file.height != Some(height) {
        files::set_dimensions(&state.db, file.id, width, height).await?;
    }
    Ok(Arc::new(image))
}
