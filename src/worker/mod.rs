//! Polling worker loops, one per job type.
//!
//! Each loop cycles `Idle -> Claiming -> Processing -> Completing | Failing -> Idle`
//! and sleeps between cycles with a delay picked by the outcome. Loops share
//! nothing in memory; all state is in the job table.

pub mod handlers;
pub mod resize;

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::models::job::{Job, JobType};
use crate::services::detector::DetectorError;
use crate::services::events::EventChannel;
use crate::services::merge::MergeError;
use crate::services::queue::{JobQueue, QueueError, MAX_CALLS};
use crate::services::storage::StorageError;
use crate::services::tiler::TileError;

/// Failure of a job's work function.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Tile(#[from] TileError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("File {0} not found")]
    MissingFile(i64),

    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A newer attempt owns the job. Not a failure of this attempt.
    #[error("Job attempt was superseded by a newer claim")]
    Superseded,
}

/// Event to publish once the job is recorded as complete.
#[derive(Debug, Clone)]
pub struct CompletionNotice {
    pub channel: EventChannel,
    pub body: serde_json::Value,
}

/// The work function of a job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<Option<CompletionNotice>, JobError>;

    /// Called after `complete` succeeded for the job that produced `notice`.
    async fn announce(&self, _job: &Job, _notice: CompletionNotice) {}
}

/// What one loop iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing claimable.
    Idle,
    Completed,
    Failed,
    /// Work was abandoned because a newer attempt took over.
    Superseded,
}

/// Sleep after each outcome.
#[derive(Debug, Clone, Copy)]
pub struct LoopDelays {
    pub idle: Duration,
    pub work: Duration,
    pub error: Duration,
    /// How often a running job refreshes its lock. Must stay well under the lock timeout.
    pub heartbeat: Duration,
}

impl Default for LoopDelays {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(1),
            work: Duration::from_millis(10),
            error: Duration::from_secs(30),
            heartbeat: Duration::from_secs(20),
        }
    }
}

impl LoopDelays {
    pub fn after(&self, step: Step) -> Duration {
        match step {
            Step::Idle => self.idle,
            Step::Completed | Step::Superseded => self.work,
            Step::Failed => self.error,
        }
    }
}

/// Claim and process at most one job of `job_type`, refreshing its lock every
/// `heartbeat` while the handler runs.
pub async fn run_once(
    queue: &dyn JobQueue,
    job_type: JobType,
    handler: &dyn JobHandler,
    heartbeat: Duration,
) -> Step {
    let job = match queue.claim_next(job_type).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::trace!(job_type = %job_type, "No jobs available");
            return Step::Idle;
        }
        Err(e) => {
            tracing::error!(job_type = %job_type, error = %e, "Failed to claim job");
            return Step::Failed;
        }
    };

    tracing::info!(
        job_id = job.id,
        job_type = %job_type,
        ref_id = job.ref_id,
        attempt = job.attempt,
        calls = job.calls,
        "Processing job"
    );

    let start = Instant::now();
    let result = with_heartbeat(queue, &job, handler.handle(&job), heartbeat).await;
    metrics::histogram!("job_processing_seconds", "job_type" => job_type.to_string())
        .record(start.elapsed().as_secs_f64());

    match result {
        Ok(notice) => match queue.complete(job_type, job.ref_id).await {
            Ok(()) => {
                metrics::counter!("jobs_completed_total", "job_type" => job_type.to_string()).increment(1);
                tracing::info!(
                    job_id = job.id,
                    job_type = %job_type,
                    ref_id = job.ref_id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Job completed"
                );
                if let Some(notice) = notice {
                    handler.announce(&job, notice).await;
                }
                Step::Completed
            }
            Err(e) => {
                // The lock times out and the job runs again; nothing is announced.
                tracing::error!(job_id = job.id, job_type = %job_type, error = %e, "Failed to mark job complete");
                Step::Failed
            }
        },
        Err(JobError::Superseded) => {
            tracing::warn!(
                job_id = job.id,
                job_type = %job_type,
                ref_id = job.ref_id,
                attempt = job.attempt,
                "Job attempt superseded, dropping its work"
            );
            Step::Superseded
        }
        Err(e) => {
            metrics::counter!("jobs_failed_total", "job_type" => job_type.to_string()).increment(1);
            match queue.fail(&job, &e.to_string()).await {
                Ok(calls) if calls >= MAX_CALLS => {
                    tracing::error!(
                        job_id = job.id,
                        job_type = %job_type,
                        ref_id = job.ref_id,
                        calls,
                        error = %e,
                        "Job failed after max calls, leaving it dormant"
                    );
                }
                Ok(calls) => {
                    tracing::warn!(
                        job_id = job.id,
                        job_type = %job_type,
                        ref_id = job.ref_id,
                        calls,
                        error = %e,
                        "Job failed, will retry after lock timeout"
                    );
                }
                Err(fail_err) => {
                    tracing::error!(
                        job_id = job.id,
                        job_type = %job_type,
                        error = %e,
                        fail_error = %fail_err,
                        "Job failed and the failure could not be recorded"
                    );
                }
            }
            Step::Failed
        }
    }
}

/// Drive `work` to completion while keeping the job's lock fresh, so a long
/// but live attempt is not reclaimed by another worker.
async fn with_heartbeat<F, T>(queue: &dyn JobQueue, job: &Job, work: F, every: Duration) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(work);
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick is immediate; the claim has just stamped the lock.
    ticker.tick().await;

    loop {
        tokio::select! {
            out = &mut work => return out,
            _ = ticker.tick() => match queue.heartbeat(job).await {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    job_id = job.id,
                    job_type = %job.job_type,
                    attempt = job.attempt,
                    "Lock heartbeat found the attempt superseded"
                ),
                Err(e) => tracing::warn!(job_id = job.id, error = %e, "Failed to refresh job lock"),
            },
        }
    }
}

/// Drive one job type until `cancel` fires. A job in progress is finished
/// before the loop exits; cancellation only cuts the sleeps short.
pub async fn run_loop(
    queue: Arc<dyn JobQueue>,
    job_type: JobType,
    handler: Arc<dyn JobHandler>,
    delays: LoopDelays,
    cancel: CancellationToken,
) {
    tracing::info!(job_type = %job_type, "Worker loop started");

    let mut delay = delays.work;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        let step = run_once(queue.as_ref(), job_type, handler.as_ref(), delays.heartbeat).await;
        delay = delays.after(step);
    }

    tracing::info!(job_type = %job_type, "Worker loop stopped");
}
