//! Merging per-tile detections into the shared detection records.
//!
//! Tiled producers append with [`DetectionMerger::append_frame_side`] (one
//! atomic UPDATE per tile). Single-shot producers that already hold the final
//! list may overwrite with the `overwrite_*` methods. The primitive is not
//! idempotent: the same delta applied twice is counted twice. Duplicates are
//! kept out by the attempt stamp and the per-attempt reset, not here.

use serde::Serialize;
use sqlx::PgPool;
use std::collections::BTreeMap;

use crate::db::detections::{self, AttemptStamp, FrameSideCollection, FrameSideCounters};
use crate::models::detection::{Detection, DetectionClass, DetectionCounts};
use crate::models::job::{BoxTarget, FrameSideTarget};

/// Result of a guarded write.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome<T> {
    Applied(T),
    /// The writing attempt is no longer current; nothing was written.
    Stale,
}

impl<T> MergeOutcome<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self, MergeOutcome::Stale)
    }
}

/// One tile's contribution, with the counters derived from the same list.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionDelta {
    pub detections: Vec<Detection>,
    pub counts: DetectionCounts,
}

impl DetectionDelta {
    pub fn new(detections: Vec<Detection>) -> Self {
        let counts = DetectionCounts::from_detections(&detections);
        Self { detections, counts }
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    /// Counter increments in the column order of `collection`.
    pub fn increments(&self, collection: FrameSideCollection) -> Vec<i32> {
        let c = &self.counts;
        match collection {
            FrameSideCollection::Bees => vec![c.worker_bee_count, c.drone_count, c.worker_bee_with_pollen_count],
            FrameSideCollection::Queens => vec![c.queen_count],
            FrameSideCollection::Varroa => vec![c.varroa_count],
        }
    }

    fn to_json(&self) -> Result<serde_json::Value, MergeError> {
        serde_json::to_value(&self.detections).map_err(MergeError::Serialize)
    }
}

/// Share of each cell class, in whole percent.
pub fn cell_percentages(detections: &[Detection]) -> BTreeMap<String, i32> {
    let mut totals: BTreeMap<String, i32> = BTreeMap::new();
    let mut all = 0;
    for d in detections {
        if matches!(
            d.class,
            DetectionClass::CappedBrood
                | DetectionClass::Eggs
                | DetectionClass::Honey
                | DetectionClass::Larvae
                | DetectionClass::Nectar
                | DetectionClass::Pollen
                | DetectionClass::EmptyCell
        ) {
            *totals.entry(d.class.to_string()).or_default() += 1;
            all += 1;
        }
    }
    if all == 0 {
        return totals;
    }
    totals
        .into_iter()
        .map(|(class, n)| (class, ((f64::from(n) * 100.0) / f64::from(all)).round() as i32))
        .collect()
}

/// Store-backed merge primitives.
#[derive(Clone)]
pub struct DetectionMerger {
    pool: PgPool,
}

impl DetectionMerger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Clear `collection` for a new attempt. Fails with `MissingRecord` when
    /// there is no record to write to.
    pub async fn begin_frame_side(
        &self,
        target: &FrameSideTarget,
        stamp: AttemptStamp,
        collection: FrameSideCollection,
    ) -> Result<MergeOutcome<FrameSideCounters>, MergeError> {
        let row = detections::reset_frame_side(&self.pool, target, stamp, collection).await?;
        self.frame_side_outcome(target, row).await
    }

    /// Atomically append one tile's delta and its counters.
    pub async fn append_frame_side(
        &self,
        target: &FrameSideTarget,
        stamp: AttemptStamp,
        collection: FrameSideCollection,
        delta: &DetectionDelta,
    ) -> Result<MergeOutcome<FrameSideCounters>, MergeError> {
        let row = detections::append_frame_side(
            &self.pool,
            target,
            stamp,
            collection,
            &delta.to_json()?,
            &delta.increments(collection),
            delta.counts.queen_detected(),
        )
        .await?;
        self.frame_side_outcome(target, row).await
    }

    pub async fn overwrite_cells(
        &self,
        target: &FrameSideTarget,
        stamp: AttemptStamp,
        detections: &[Detection],
    ) -> Result<MergeOutcome<FrameSideCounters>, MergeError> {
        let list = serde_json::to_value(detections).map_err(MergeError::Serialize)?;
        let counts = serde_json::to_value(cell_percentages(detections)).map_err(MergeError::Serialize)?;
        let row = detections::overwrite_cells(&self.pool, target, stamp, &list, &counts).await?;
        self.frame_side_outcome(target, row).await
    }

    pub async fn overwrite_queen_cups(
        &self,
        target: &FrameSideTarget,
        stamp: AttemptStamp,
        detections: &[Detection],
    ) -> Result<MergeOutcome<FrameSideCounters>, MergeError> {
        let list = serde_json::to_value(detections).map_err(MergeError::Serialize)?;
        let count = detections
            .iter()
            .filter(|d| d.class == DetectionClass::QueenCup)
            .count() as i32;
        let row = detections::overwrite_queen_cups(&self.pool, target, stamp, &list, count).await?;
        self.frame_side_outcome(target, row).await
    }

    pub async fn begin_box_varroa(
        &self,
        target: &BoxTarget,
        stamp: AttemptStamp,
    ) -> Result<MergeOutcome<i32>, MergeError> {
        let row = detections::reset_box_varroa(&self.pool, target, stamp).await?;
        self.box_outcome(target, row).await
    }

    pub async fn append_box_varroa(
        &self,
        target: &BoxTarget,
        stamp: AttemptStamp,
        delta: &DetectionDelta,
    ) -> Result<MergeOutcome<i32>, MergeError> {
        let row =
            detections::append_box_varroa(&self.pool, target, stamp, &delta.to_json()?, delta.counts.varroa_count)
                .await?;
        self.box_outcome(target, row).await
    }

    async fn frame_side_outcome(
        &self,
        target: &FrameSideTarget,
        row: Option<FrameSideCounters>,
    ) -> Result<MergeOutcome<FrameSideCounters>, MergeError> {
        match row {
            Some(counters) => Ok(MergeOutcome::Applied(counters)),
            None if detections::frame_side_exists(&self.pool, target).await? => Ok(MergeOutcome::Stale),
            None => Err(MergeError::MissingRecord(format!(
                "frame side {} of file {} for user {}",
                target.frame_side_id, target.file_id, target.user_id
            ))),
        }
    }

    async fn box_outcome(&self, target: &BoxTarget, row: Option<i32>) -> Result<MergeOutcome<i32>, MergeError> {
        match row {
            Some(count) => Ok(MergeOutcome::Applied(count)),
            None if detections::box_exists(&self.pool, target).await? => Ok(MergeOutcome::Stale),
            None => Err(MergeError::MissingRecord(format!(
                "box {} of file {} for user {}",
                target.box_id, target.file_id, target.user_id
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to serialize detections: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Detection record not found: {0}")]
    MissingRecord(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(class: DetectionClass) -> Detection {
        Detection::new(class, 0.5, 0.5, 0.01, 0.01, 0.9)
    }

    #[test]
    fn test_delta_increments_follow_collection_columns() {
        let delta = DetectionDelta::new(vec![
            det(DetectionClass::WorkerBee),
            det(DetectionClass::Drone),
            det(DetectionClass::Drone),
            det(DetectionClass::WorkerBeeWithPollen),
            det(DetectionClass::Queen),
        ]);
        let bees = delta.increments(FrameSideCollection::Bees);
        assert_eq!(bees.len(), FrameSideCollection::Bees.counter_columns().len());
        assert_eq!(bees, vec![1, 2, 1]);
        assert_eq!(delta.increments(FrameSideCollection::Queens), vec![1]);
        assert!(delta.counts.queen_detected());
    }

    #[test]
    fn test_empty_delta() {
        let delta = DetectionDelta::new(vec![]);
        assert!(delta.is_empty());
        assert_eq!(delta.increments(FrameSideCollection::Varroa), vec![0]);
        assert!(!delta.counts.queen_detected());
    }

    #[test]
    fn test_cell_percentages() {
        let cells = vec![
            det(DetectionClass::Honey),
            det(DetectionClass::Honey),
            det(DetectionClass::CappedBrood),
            det(DetectionClass::Eggs),
            det(DetectionClass::WorkerBee),
        ];
        let pct = cell_percentages(&cells);
        assert_eq!(pct.get("honey"), Some(&50));
        assert_eq!(pct.get("capped_brood"), Some(&25));
        assert_eq!(pct.get("eggs"), Some(&25));
        assert!(!pct.contains_key("worker_bee"));
    }

    #[test]
    fn test_no_cells_gives_empty_map() {
        assert!(cell_percentages(&[det(DetectionClass::Drone)]).is_empty());
    }
}
