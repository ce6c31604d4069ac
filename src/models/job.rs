use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use super::detection::{DetectionResult, PageSize};
use super::error::{ErrorKind, Failure};

/// Lifecycle state of an extraction job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Page-level progress of a running job.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobProgress {
    pub pages_total: usize,
    pub pages_done: usize,
    pub pages_failed: usize,
}

/// An extraction job as tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Original upload name of the source document.
    pub source: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub progress: JobProgress,
    pub result: Option<ExtractionReport>,
    pub error: Option<Failure>,
}

impl Job {
    pub fn queued(id: Uuid, source: impl Into<String>) -> Self {
        Self {
            id,
            source: source.into(),
            state: JobState::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: JobProgress::default(),
            result: None,
            error: None,
        }
    }

    /// Read-only view returned by the status query.
    pub fn view(&self, now: DateTime<Utc>) -> JobView {
        let elapsed_ms = match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            (Some(start), None) => Some((now - start).num_milliseconds().max(0) as u64),
            _ => None,
        };
        JobView {
            job_id: self.id,
            source: self.source.clone(),
            state: self.state,
            submitted_at: self.submitted_at,
            completed_at: self.completed_at,
            elapsed_ms,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub source: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Time spent processing so far (or in total once terminal).
    pub elapsed_ms: Option<u64>,
    pub progress: JobProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExtractionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

/// One page of work handed to the page processor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageTask {
    /// 0-based page index.
    pub index: usize,
    pub size: PageSize,
    pub dpi: u32,
}

impl PageTask {
    /// 1-based, user-facing page number.
    pub fn page_number(&self) -> u32 {
        self.index as u32 + 1
    }
}

/// A page that was excluded from the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageFailure {
    pub page: u32,
    pub kind: ErrorKind,
    pub message: String,
}

/// Timing of one dispatched batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub index: usize,
    /// 1-based number of the first page in the batch.
    pub first_page: u32,
    pub page_count: usize,
    pub capacity: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Result payload of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionReport {
    /// Ordered by completion, not by page.
    pub detections: Vec<DetectionResult>,
    pub pages_total: usize,
    pub failed_pages: Vec<PageFailure>,
    pub batches: Vec<BatchSummary>,
}
