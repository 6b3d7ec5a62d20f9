use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::app_state::AppState;
use crate::models::job::{JobPayload, JobType, PayloadError};

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct EnqueueResponse {
    pub job_id: i64,
    pub ref_id: i64,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub ref_id: i64,
    pub is_complete: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

/// POST /api/v1/jobs: enqueue a job with a typed payload.
pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(request): Json<EnqueueRequest>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let payload = JobPayload::decode(request.job_type, request.payload)
        .map_err(|e: PayloadError| api_error(StatusCode::UNPROCESSABLE_ENTITY, e))?;

    let job_id = state
        .queue
        .enqueue(&payload)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok((
        StatusCode::CREATED,
        Json(EnqueueResponse {
            job_id,
            ref_id: payload.ref_id(),
        }),
    ))
}

/// GET /api/v1/jobs/{type}/{ref_id}: whether anything is outstanding.
pub async fn job_status(
    State(state): State<AppState>,
    Path((job_type, ref_id)): Path<(String, i64)>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let job_type = JobType::from_str(&job_type)
        .map_err(|_| api_error(StatusCode::NOT_FOUND, format!("unknown job type {job_type}")))?;

    let is_complete = state
        .queue
        .is_complete(job_type, ref_id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;

    Ok(Json(JobStatusResponse {
        job_type,
        ref_id,
        is_complete,
    }))
}
