use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;

/// Raw `jobs` row. The type and payload are decoded by the queue service.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub ref_id: i64,
    pub payload: serde_json::Value,
    pub process_start_time: Option<DateTime<Utc>>,
    pub process_end_time: Option<DateTime<Utc>>,
    pub calls: i32,
    pub attempt: i32,
    pub error: Option<String>,
}

/// Insert a new, unclaimed job
pub async fn insert_job(
    pool: &PgPool,
    job_type: &str,
    ref_id: i64,
    payload: &serde_json::Value,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        INSERT INTO jobs (type, ref_id, payload)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(job_type)
    .bind(ref_id)
    .bind(payload)
    .fetch_one(pool)
    .await
}

/// Select the oldest claimable job of a type and stamp its lock in one transaction.
///
/// `FOR UPDATE SKIP LOCKED` makes concurrent claimers pass over a row another
/// worker is stamping, so a job is handed to at most one of them. Each claim
/// charges a call up front, so attempts that crash or outlive their lock count
/// against the cap as well as the ones that fail.
pub async fn claim_next_job(
    pool: &PgPool,
    job_type: &str,
    max_calls: i32,
    lock_timeout: Duration,
) -> Result<Option<JobRow>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let row: Option<JobRow> = sqlx::query_as(
        r#"
        WITH next AS (
            SELECT id
            FROM jobs
            WHERE type = $1
              AND process_end_time IS NULL
              AND calls < $2
              AND (process_start_time IS NULL
                   OR process_start_time < NOW() - make_interval(secs => $3))
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE jobs
        SET process_start_time = NOW(),
            calls = jobs.calls + 1,
            attempt = jobs.attempt + 1
        FROM next
        WHERE jobs.id = next.id
        RETURNING jobs.id, jobs.type, jobs.ref_id, jobs.payload, jobs.process_start_time,
                  jobs.process_end_time, jobs.calls, jobs.attempt, jobs.error
        "#,
    )
    .bind(job_type)
    .bind(max_calls)
    .bind(lock_timeout.as_secs_f64())
    .fetch_optional(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(row)
}

/// Mark every unfinished job of `(type, ref_id)` as finished
pub async fn complete_jobs(pool: &PgPool, job_type: &str, ref_id: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET process_end_time = NOW()
        WHERE type = $1 AND ref_id = $2 AND process_end_time IS NULL
        "#,
    )
    .bind(job_type)
    .bind(ref_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Record why an attempt failed and return the call count.
///
/// The call was already charged by the claim, so a failure does not add
/// another. `process_end_time` stays NULL: below the cap the job is claimable
/// again once its lock times out, at the cap it stays pending forever.
pub async fn fail_job(pool: &PgPool, job_id: i64, error: &str) -> Result<i32, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        UPDATE jobs
        SET error = $2,
            last_failure_time = NOW()
        WHERE id = $1
        RETURNING calls
        "#,
    )
    .bind(job_id)
    .bind(error)
    .fetch_one(pool)
    .await
}

/// Refresh the lock of a running attempt. Returns false once the attempt is
/// no longer the current, unfinished one.
pub async fn touch_lock(pool: &PgPool, job_id: i64, attempt: i32) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE jobs
        SET process_start_time = NOW()
        WHERE id = $1 AND attempt = $2 AND process_end_time IS NULL
        "#,
    )
    .bind(job_id)
    .bind(attempt)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// End time of the newest job of `(type, ref_id)`. Outer `None` means no job exists.
pub async fn latest_end_time(
    pool: &PgPool,
    job_type: &str,
    ref_id: i64,
) -> Result<Option<Option<DateTime<Utc>>>, sqlx::Error> {
    sqlx::query_scalar(
        r#"
        SELECT process_end_time
        FROM jobs
        WHERE type = $1 AND ref_id = $2
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(job_type)
    .bind(ref_id)
    .fetch_optional(pool)
    .await
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT id, type, ref_id, payload, process_start_time, process_end_time, calls, attempt, error
        FROM jobs
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await
}

/// Number of claimable-or-running jobs per type (for health and metrics)
pub async fn pending_counts(pool: &PgPool, max_calls: i32) -> Result<Vec<(String, i64)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT type, COUNT(*)
        FROM jobs
        WHERE process_end_time IS NULL AND calls < $1
        GROUP BY type
        ORDER BY type
        "#,
    )
    .bind(max_calls)
    .fetch_all(pool)
    .await
}
