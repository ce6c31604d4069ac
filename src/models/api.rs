use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::detection::DetectionResult;
use super::error::ErrorKind;
use super::job::{JobState, JobView};

/// Query parameters accepted alongside a document upload.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct SubmitOptions {
    /// Job deadline in seconds; also bounds the synchronous wait.
    #[garde(range(min = 1, max = 3600))]
    pub timeout: Option<u64>,

    /// `false` blocks the request until the job is terminal.
    #[serde(rename = "async")]
    #[garde(skip)]
    pub run_async: Option<bool>,
}

impl SubmitOptions {
    pub fn wait(&self) -> bool {
        !self.run_async.unwrap_or(true)
    }
}

/// Response after submitting a document.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub state: JobState,
    pub message: String,
}

/// Response of the single-image detection endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct DetectResponse {
    pub width: u32,
    pub height: u32,
    pub detections: Vec<DetectionResult>,
}

/// Structured error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

/// Outcome of a submission: accepted for background work, or finished in-line.
#[derive(Debug)]
pub enum Submission {
    Accepted(SubmitResponse),
    Finished(JobView),
}
