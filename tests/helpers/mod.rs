//! Database helpers shared by the integration tests
//!
//! The tests expect DATABASE_URL to point at a disposable PostgreSQL
//! database. Migrations are applied on connect.

#![allow(dead_code)]

use sqlx::PgPool;

use hive_detect::{
    db::{self, detections::AttemptStamp, jobs},
    models::job::{BoxTarget, FrameSideTarget, JobPayload, JobType},
};

/// Connect to the test database and apply migrations
pub async fn test_pool() -> PgPool {
    dotenvy::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = db::init_pool(&url).await.expect("Failed to connect to database");
    db::run_migrations(&pool).await.expect("Failed to run migrations");
    pool
}

/// Finish every unfinished job of a type left behind by earlier runs, so
/// claims in the current test only see its own rows
pub async fn retire_jobs(pool: &PgPool, job_type: JobType) {
    sqlx::query("UPDATE jobs SET process_end_time = NOW() WHERE type = $1 AND process_end_time IS NULL")
        .bind(job_type.to_string())
        .execute(pool)
        .await
        .expect("Failed to retire old jobs");
}

/// Insert a file row and return its id
pub async fn seed_file(pool: &PgPool, user_id: i64) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO files (user_id, hash, ext, width, height) VALUES ($1, 'testhash', 'jpg', 4000, 3000) RETURNING id",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await
    .expect("Failed to seed file")
}

/// Insert a file with an empty frame side detection record
pub async fn seed_frame_side(pool: &PgPool) -> FrameSideTarget {
    let user_id = 7;
    let file_id = seed_file(pool, user_id).await;
    let target = FrameSideTarget {
        file_id,
        frame_side_id: file_id + 1000,
        user_id,
    };

    sqlx::query("INSERT INTO files_frame_side_rel (file_id, frame_side_id, user_id) VALUES ($1, $2, $3)")
        .bind(target.file_id)
        .bind(target.frame_side_id)
        .bind(target.user_id)
        .execute(pool)
        .await
        .expect("Failed to seed frame side record");

    target
}

/// Insert a file with an empty box detection record
pub async fn seed_box(pool: &PgPool) -> BoxTarget {
    let user_id = 7;
    let file_id = seed_file(pool, user_id).await;
    let target = BoxTarget {
        file_id,
        box_id: file_id + 2000,
        user_id,
    };

    sqlx::query("INSERT INTO files_box_rel (file_id, box_id, user_id) VALUES ($1, $2, $3)")
        .bind(target.file_id)
        .bind(target.box_id)
        .bind(target.user_id)
        .execute(pool)
        .await
        .expect("Failed to seed box record");

    target
}

/// Insert a job and stamp it as claimed once, without going through the
/// shared claim ordering
pub async fn seed_claimed_job(pool: &PgPool, payload: &JobPayload) -> AttemptStamp {
    let job_id = jobs::insert_job(pool, &payload.job_type().to_string(), payload.ref_id(), &payload.to_value())
        .await
        .expect("Failed to insert job");

    let attempt = bump_attempt(pool, job_id).await;
    AttemptStamp { job_id, attempt }
}

/// Simulate a reclaim of the job: a new attempt takes over
pub async fn bump_attempt(pool: &PgPool, job_id: i64) -> i32 {
    sqlx::query_scalar(
        "UPDATE jobs SET attempt = attempt + 1, process_start_time = NOW() WHERE id = $1 RETURNING attempt",
    )
    .bind(job_id)
    .fetch_one(pool)
    .await
    .expect("Failed to bump attempt")
}

/// Move a job's lock into the past, as if its worker went silent
pub async fn backdate_lock(pool: &PgPool, job_id: i64, seconds: i32) {
    sqlx::query(
        "UPDATE jobs SET process_start_time = NOW() - make_interval(secs => $2::double precision) WHERE id = $1",
    )
    .bind(job_id)
    .bind(f64::from(seconds))
    .execute(pool)
    .await
    .expect("Failed to backdate lock");
}
