use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Kind of deferred work. The string form is what lives in `jobs.type`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, EnumString, EnumIter, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobType {
    Resize,
    DetectBees,
    DetectCells,
    DetectCups,
    DetectQueens,
    DetectVarroa,
    DetectVarroaBottom,
}

/// A job row as returned by a successful claim.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: i64,
    pub job_type: JobType,
    pub ref_id: i64,
    pub payload: JobPayload,
    pub process_start_time: Option<DateTime<Utc>>,
    pub calls: i32,
    /// Claim generation, bumped on every claim. Merge writes are stamped with it.
    pub attempt: i32,
    pub error: Option<String>,
}

/// Target of a detection on one side of a frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct FrameSideTarget {
    #[garde(range(min = 1))]
    pub file_id: i64,
    #[garde(range(min = 1))]
    pub frame_side_id: i64,
    #[garde(range(min = 1))]
    pub user_id: i64,
}

/// Target of a bottom-board varroa count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct BoxTarget {
    #[garde(range(min = 1))]
    pub file_id: i64,
    #[garde(range(min = 1))]
    pub box_id: i64,
    #[garde(range(min = 1))]
    pub user_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq, Eq)]
pub struct ResizeTarget {
    #[garde(range(min = 1))]
    pub file_id: i64,
}

/// Payload of a job, one schema per [`JobType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPayload {
    Resize(ResizeTarget),
    DetectBees(FrameSideTarget),
    DetectCells(FrameSideTarget),
    DetectCups(FrameSideTarget),
    DetectQueens(FrameSideTarget),
    DetectVarroa(FrameSideTarget),
    DetectVarroaBottom(BoxTarget),
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload does not match schema of {job_type}: {source}")]
    Schema {
        job_type: JobType,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid payload for {job_type}: {report}")]
    Invalid { job_type: JobType, report: garde::Report },

    #[error("unknown job type {0:?}")]
    UnknownType(String),
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            JobPayload::Resize(_) => JobType::Resize,
            JobPayload::DetectBees(_) => JobType::DetectBees,
            JobPayload::DetectCells(_) => JobType::DetectCells,
            JobPayload::DetectCups(_) => JobType::DetectCups,
            JobPayload::DetectQueens(_) => JobType::DetectQueens,
            JobPayload::DetectVarroa(_) => JobType::DetectVarroa,
            JobPayload::DetectVarroaBottom(_) => JobType::DetectVarroaBottom,
        }
    }

    /// The record a job acts on. Every payload shape is keyed by its file.
    pub fn ref_id(&self) -> i64 {
        match self {
            JobPayload::Resize(t) => t.file_id,
            JobPayload::DetectBees(t)
            | JobPayload::DetectCells(t)
            | JobPayload::DetectCups(t)
            | JobPayload::DetectQueens(t)
            | JobPayload::DetectVarroa(t) => t.file_id,
            JobPayload::DetectVarroaBottom(t) => t.file_id,
        }
    }

    /// Decode the JSON stored in `jobs.payload`, choosing the schema from the job type.
    pub fn decode(job_type: JobType, value: serde_json::Value) -> Result<Self, PayloadError> {
        let schema = |source| PayloadError::Schema { job_type, source };
        let payload = match job_type {
            JobType::Resize => JobPayload::Resize(serde_json::from_value(value).map_err(schema)?),
            JobType::DetectBees => JobPayload::DetectBees(serde_json::from_value(value).map_err(schema)?),
            JobType::DetectCells => JobPayload::DetectCells(serde_json::from_value(value).map_err(schema)?),
            JobType::DetectCups => JobPayload::DetectCups(serde_json::from_value(value).map_err(schema)?),
            JobType::DetectQueens => JobPayload::DetectQueens(serde_json::from_value(value).map_err(schema)?),
            JobType::DetectVarroa => JobPayload::DetectVarroa(serde_json::from_value(value).map_err(schema)?),
            JobType::DetectVarroaBottom => {
                JobPayload::DetectVarroaBottom(serde_json::from_value(value).map_err(schema)?)
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        let job_type = self.job_type();
        let result = match self {
            JobPayload::Resize(t) => t.validate(),
            JobPayload::DetectBees(t)
            | JobPayload::DetectCells(t)
            | JobPayload::DetectCups(t)
            | JobPayload::DetectQueens(t)
            | JobPayload::DetectVarroa(t) => t.validate(),
            JobPayload::DetectVarroaBottom(t) => t.validate(),
        };
        result.map_err(|report| PayloadError::Invalid { job_type, report })
    }

    /// JSON body stored in `jobs.payload`.
    pub fn to_value(&self) -> serde_json::Value {
        let value = match self {
            JobPayload::Resize(t) => serde_json::to_value(t),
            JobPayload::DetectBees(t)
            | JobPayload::DetectCells(t)
            | JobPayload::DetectCups(t)
            | JobPayload::DetectQueens(t)
            | JobPayload::DetectVarroa(t) => serde_json::to_value(t),
            JobPayload::DetectVarroaBottom(t) => serde_json::to_value(t),
        };
        // Plain structs of integers always serialize.
        value.unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_job_type_names_are_kebab_case() {
        assert_eq!(JobType::DetectVarroaBottom.to_string(), "detect-varroa-bottom");
        assert_eq!(JobType::from_str("detect-bees").unwrap(), JobType::DetectBees);
        assert_eq!(JobType::iter().count(), 7);
    }

    #[test]
    fn test_decode_frame_side_payload() {
        let payload = JobPayload::decode(
            JobType::DetectBees,
            json!({"file_id": 3, "frame_side_id": 9, "user_id": 1}),
        )
        .unwrap();
        assert_eq!(payload.job_type(), JobType::DetectBees);
        assert_eq!(payload.ref_id(), 3);
        assert_eq!(payload.to_value()["frame_side_id"], 9);
    }

    #[test]
    fn test_decode_rejects_wrong_schema() {
        let err = JobPayload::decode(JobType::DetectVarroaBottom, json!({"file_id": 3, "frame_side_id": 9}))
            .unwrap_err();
        assert!(matches!(err, PayloadError::Schema { .. }));
    }

    #[test]
    fn test_decode_rejects_non_positive_ids() {
        let err = JobPayload::decode(JobType::Resize, json!({"file_id": 0})).unwrap_err();
        assert!(matches!(err, PayloadError::Invalid { .. }));
    }
}
