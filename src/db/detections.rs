//! Writes into the shared detection records.
//!
//! Every statement is a single UPDATE, so the JSONB collection and its
//! counters change together under the row lock. Each write is also stamped
//! with the claiming job attempt and only applies while that attempt is the
//! current, unfinished one.

use serde::Serialize;
use sqlx::{FromRow, PgPool};

use crate::models::job::{BoxTarget, FrameSideTarget};

/// Which job attempt is writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStamp {
    pub job_id: i64,
    pub attempt: i32,
}

const ATTEMPT_GUARD: &str = "EXISTS (
    SELECT 1 FROM jobs j
    WHERE j.id = $4 AND j.attempt = $5 AND j.process_end_time IS NULL
)";

/// Counters of a frame side record after a write.
#[derive(Debug, Clone, Copy, Default, Serialize, FromRow, PartialEq, Eq)]
pub struct FrameSideCounters {
    pub worker_bee_count: i32,
    pub drone_count: i32,
    pub worker_bee_with_pollen_count: i32,
    pub queen_count: i32,
    pub varroa_count: i32,
    pub queen_cup_count: i32,
    pub is_queen_confirmed: bool,
}

const FRAME_SIDE_RETURNING: &str = "RETURNING worker_bee_count, drone_count, worker_bee_with_pollen_count,
          queen_count, varroa_count, queen_cup_count, is_queen_confirmed";

/// Collections of a frame side record that tiled detectors append to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSideCollection {
    Bees,
    Queens,
    Varroa,
}

impl FrameSideCollection {
    pub fn column(self) -> &'static str {
        match self {
            FrameSideCollection::Bees => "detected_bees",
            FrameSideCollection::Queens => "detected_queens",
            FrameSideCollection::Varroa => "detected_varroa",
        }
    }

    /// Counter columns owned by this collection. No two collections share one.
    pub fn counter_columns(self) -> &'static [&'static str] {
        match self {
            FrameSideCollection::Bees => &["worker_bee_count", "drone_count", "worker_bee_with_pollen_count"],
            FrameSideCollection::Queens => &["queen_count"],
            FrameSideCollection::Varroa => &["varroa_count"],
        }
    }
}

/// Append a delta and bump the owned counters in one statement.
///
/// `increments` pairs with [`FrameSideCollection::counter_columns`] by position.
/// `queen_seen` can only move `is_queen_confirmed` from false to true.
pub async fn append_frame_side(
    pool: &PgPool,
    target: &FrameSideTarget,
    stamp: AttemptStamp,
    collection: FrameSideCollection,
    delta: &serde_json::Value,
    increments: &[i32],
    queen_seen: bool,
) -> Result<Option<FrameSideCounters>, sqlx::Error> {
    let col = collection.column();
    let mut assignments = vec![
        format!("{col} = r.{col} || $6::jsonb"),
        "is_queen_confirmed = r.is_queen_confirmed OR $7".to_string(),
    ];
    for (i, counter) in collection.counter_columns().iter().enumerate() {
        assignments.push(format!("{counter} = r.{counter} + ${}", i + 8));
    }

    let sql = format!(
        "UPDATE files_frame_side_rel r SET {}
         WHERE r.file_id = $1 AND r.frame_side_id = $2 AND r.user_id = $3 AND {ATTEMPT_GUARD}
         {FRAME_SIDE_RETURNING}",
        assignments.join(", ")
    );

    let mut query = sqlx::query_as::<_, FrameSideCounters>(&sql)
        .bind(target.file_id)
        .bind(target.frame_side_id)
        .bind(target.user_id)
        .bind(stamp.job_id)
        .bind(stamp.attempt)
        .bind(delta)
        .bind(queen_seen);
    for i in 0..collection.counter_columns().len() {
        query = query.bind(increments.get(i).copied().unwrap_or(0));
    }
    query.fetch_optional(pool).await
}

/// Empty a collection and its counters before an attempt starts appending.
/// The queen confirmation flag is left alone.
pub async fn reset_frame_side(
    pool: &PgPool,
    target: &FrameSideTarget,
    stamp: AttemptStamp,
    collection: FrameSideCollection,
) -> Result<Option<FrameSideCounters>, sqlx::Error> {
    let col = collection.column();
    let mut assignments = vec![format!("{col} = '[]'::jsonb")];
    for counter in collection.counter_columns() {
        assignments.push(format!("{counter} = 0"));
    }

    let sql = format!(
        "UPDATE files_frame_side_rel r SET {}
         WHERE r.file_id = $1 AND r.frame_side_id = $2 AND r.user_id = $3 AND {ATTEMPT_GUARD}
         {FRAME_SIDE_RETURNING}",
        assignments.join(", ")
    );

    sqlx::query_as::<_, FrameSideCounters>(&sql)
        .bind(target.file_id)
        .bind(target.frame_side_id)
        .bind(target.user_id)
        .bind(stamp.job_id)
        .bind(stamp.attempt)
        .fetch_optional(pool)
        .await
}

/// Replace the cell collection. Only for single writers.
pub async fn overwrite_cells(
    pool: &PgPool,
    target: &FrameSideTarget,
    stamp: AttemptStamp,
    detections: &serde_json::Value,
    cell_counts: &serde_json::Value,
) -> Result<Option<FrameSideCounters>, sqlx::Error> {
    let sql = format!(
        "UPDATE files_frame_side_rel r SET detected_cells = $6, cell_counts = $7
         WHERE r.file_id = $1 AND r.frame_side_id = $2 AND r.user_id = $3 AND {ATTEMPT_GUARD}
         {FRAME_SIDE_RETURNING}"
    );
    sqlx::query_as::<_, FrameSideCounters>(&sql)
        .bind(target.file_id)
        .bind(target.frame_side_id)
        .bind(target.user_id)
        .bind(stamp.job_id)
        .bind(stamp.attempt)
        .bind(detections)
        .bind(cell_counts)
        .fetch_optional(pool)
        .await
}

/// Replace the queen cup collection. Only for single writers.
pub async fn overwrite_queen_cups(
    pool: &PgPool,
    target: &FrameSideTarget,
    stamp: AttemptStamp,
    detections: &serde_json::Value,
    count: i32,
) -> Result<Option<FrameSideCounters>, sqlx::Error> {
    let sql = format!(
        "UPDATE files_frame_side_rel r SET detected_queen_cups = $6, queen_cup_count = $7
         WHERE r.file_id = $1 AND r.frame_side_id = $2 AND r.user_id = $3 AND {ATTEMPT_GUARD}
         {FRAME_SIDE_RETURNING}"
    );
    sqlx::query_as::<_, FrameSideCounters>(&sql)
        .bind(target.file_id)
        .bind(target.frame_side_id)
        .bind(target.user_id)
        .bind(stamp.job_id)
        .bind(stamp.attempt)
        .bind(detections)
        .bind(count)
        .fetch_optional(pool)
        .await
}

/// Append bottom-board varroa detections and bump the count.
pub async fn append_box_varroa(
    pool: &PgPool,
    target: &BoxTarget,
    stamp: AttemptStamp,
    delta: &serde_json::Value,
    increment: i32,
) -> Result<Option<i32>, sqlx::Error> {
    let sql = format!(
        "UPDATE files_box_rel r
         SET detected_varroa = r.detected_varroa || $6::jsonb,
             varroa_count = r.varroa_count + $7
         WHERE r.file_id = $1 AND r.box_id = $2 AND r.user_id = $3 AND {ATTEMPT_GUARD}
         RETURNING varroa_count"
    );
    sqlx::query_scalar(&sql)
        .bind(target.file_id)
        .bind(target.box_id)
        .bind(target.user_id)
        .bind(stamp.job_id)
        .bind(stamp.attempt)
        .bind(delta)
        .bind(increment)
        .fetch_optional(pool)
        .await
}

pub async fn reset_box_varroa(
    pool: &PgPool,
    target: &BoxTarget,
    stamp: AttemptStamp,
) -> Result<Option<i32>, sqlx::Error> {
    let sql = format!(
        "UPDATE files_box_rel r
         SET detected_varroa = '[]'::jsonb, varroa_count = 0
         WHERE r.file_id = $1 AND r.box_id = $2 AND r.user_id = $3 AND {ATTEMPT_GUARD}
         RETURNING varroa_count"
    );
    sqlx::query_scalar(&sql)
        .bind(target.file_id)
        .bind(target.box_id)
        .bind(target.user_id)
        .bind(stamp.job_id)
        .bind(stamp.attempt)
        .fetch_optional(pool)
        .await
}

pub async fn frame_side_exists(pool: &PgPool, target: &FrameSideTarget) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM files_frame_side_rel
            WHERE file_id = $1 AND frame_side_id = $2 AND user_id = $3
        )
        "#,
    )
    .bind(target.file_id)
    .bind(target.frame_side_id)
    .bind(target.user_id)
    .fetch_one(pool)
    .await
}

pub async fn box_exists(pool: &PgPool, target: &BoxTarget) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1 FROM files_box_rel
            WHERE file_id = $1 AND box_id = $2 AND user_id = $3
        )
        "#,
    )
    .bind(target.file_id)
    .bind(target.box_id)
    .bind(target.user_id)
    .fetch_one(pool)
    .await
}

/// Read back a frame side collection (tests and status reads).
pub async fn frame_side_collection(
    pool: &PgPool,
    target: &FrameSideTarget,
    column: &'static str,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    let sql = format!(
        "SELECT {column} FROM files_frame_side_rel
         WHERE file_id = $1 AND frame_side_id = $2 AND user_id = $3"
    );
    sqlx::query_scalar(&sql)
        .bind(target.file_id)
        .bind(target.frame_side_id)
        .bind(target.user_id)
        .fetch_optional(pool)
        .await
}
