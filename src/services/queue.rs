use async_trait::async_trait;
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;

use crate::db::jobs::{self, JobRow};
use crate::models::job::{Job, JobPayload, JobType, PayloadError};

/// Attempts allowed per job before it is left dormant in place.
pub const MAX_CALLS: i32 = 3;

/// A claimed job whose worker went silent becomes claimable again after this.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Durable queue of deferred work, shared by every worker process.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a new unclaimed job. Type and ref id come from the payload.
    async fn enqueue(&self, payload: &JobPayload) -> Result<i64, QueueError>;

    /// Claim the oldest claimable job of `job_type`, or `None` if there is none.
    /// The claim itself spends one of the job's calls.
    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, QueueError>;

    /// Mark the `(type, ref_id)` job finished.
    async fn complete(&self, job_type: JobType, ref_id: i64) -> Result<(), QueueError>;

    /// Record a failed attempt. Returns the job's call count.
    async fn fail(&self, job: &Job, error: &str) -> Result<i32, QueueError>;

    /// Keep a running attempt's lock fresh. False once the attempt was superseded or finished.
    async fn heartbeat(&self, job: &Job) -> Result<bool, QueueError>;

    /// True when nothing is outstanding for `(type, ref_id)`.
    async fn is_complete(&self, job_type: JobType, ref_id: i64) -> Result<bool, QueueError>;
}

/// PostgreSQL-backed job queue.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    fn decode_row(row: JobRow) -> Result<Job, QueueError> {
        let job_type = JobType::from_str(&row.job_type)
            .map_err(|_| QueueError::Payload {
                job_id: row.id,
                source: PayloadError::UnknownType(row.job_type.clone()),
            })?;
        let payload = JobPayload::decode(job_type, row.payload).map_err(|source| QueueError::Payload {
            job_id: row.id,
            source,
        })?;
        Ok(Job {
            id: row.id,
            job_type,
            ref_id: row.ref_id,
            payload,
            process_start_time: row.process_start_time,
            calls: row.calls,
            attempt: row.attempt,
            error: row.error,
        })
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, payload: &JobPayload) -> Result<i64, QueueError> {
        let job_type = payload.job_type();
        let ref_id = payload.ref_id();
        payload.validate().map_err(|source| QueueError::Payload { job_id: 0, source })?;

        match jobs::insert_job(&self.pool, &job_type.to_string(), ref_id, &payload.to_value()).await {
            Ok(id) => {
                tracing::info!(job_id = id, job_type = %job_type, ref_id, "Job enqueued");
                Ok(id)
            }
            Err(e) => {
                tracing::error!(job_type = %job_type, ref_id, error = %e, "Failed to enqueue job");
                Err(e.into())
            }
        }
    }

    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, QueueError> {
        let row = jobs::claim_next_job(&self.pool, &job_type.to_string(), MAX_CALLS, self.lock_timeout).await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let (job_id, ref_id) = (row.id, row.ref_id);
        match Self::decode_row(row) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                // A payload that cannot be decoded is a permanent input failure;
                // it still spends a call so it goes dormant at the cap.
                let calls = jobs::fail_job(&self.pool, job_id, &e.to_string()).await?;
                tracing::error!(job_id, job_type = %job_type, ref_id, calls, error = %e, "Claimed job has invalid payload");
                Err(e)
            }
        }
    }

    async fn complete(&self, job_type: JobType, ref_id: i64) -> Result<(), QueueError> {
        let updated = jobs::complete_jobs(&self.pool, &job_type.to_string(), ref_id).await?;
        if updated == 0 {
            tracing::warn!(job_type = %job_type, ref_id, "No unfinished job to complete");
        }
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<i32, QueueError> {
        Ok(jobs::fail_job(&self.pool, job.id, error).await?)
    }

    async fn heartbeat(&self, job: &Job) -> Result<bool, QueueError> {
        Ok(jobs::touch_lock(&self.pool, job.id, job.attempt).await?)
    }

    async fn is_complete(&self, job_type: JobType, ref_id: i64) -> Result<bool, QueueError> {
        let end_time = jobs::latest_end_time(&self.pool, &job_type.to_string(), ref_id).await?;
        Ok(match end_time {
            None => true,
            Some(end) => end.is_some(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {job_id} has an invalid payload: {source}")]
    Payload {
        job_id: i64,
        #[source]
        source: PayloadError,
    },
}
