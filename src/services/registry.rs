//! In-memory job registry with retention-based expiry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::error::Failure;
use crate::models::job::{ExtractionReport, Job, JobState, JobView};
use crate::models::load::JobCounts;
use crate::services::scheduler::ProgressObserver;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },
}

struct Entry {
    job: Job,
    state_tx: watch::Sender<JobState>,
}

/// Owns every job from submission until expiry.
///
/// One lock guards the map. It is only held for state transitions and
/// lookups, never while a document is being processed.
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Entry>>,
    retention: Duration,
}

impl JobRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            retention,
        }
    }

    pub fn insert(&self, job: Job) {
        let (state_tx, _) = watch::channel(job.state);
        self.jobs.lock().insert(job.id, Entry { job, state_tx });
    }

    /// Drops a job that never made it into the queue.
    pub fn remove(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.lock().remove(&job_id).map(|e| e.job)
    }

    pub fn mark_processing(&self, job_id: Uuid) -> Result<(), RegistryError> {
        self.transition(job_id, JobState::Processing, |job| {
            job.started_at = Some(Utc::now());
        })
    }

    pub fn complete(&self, job_id: Uuid, report: ExtractionReport) -> Result<(), RegistryError> {
        self.transition(job_id, JobState::Completed, |job| {
            job.progress.pages_total = report.pages_total;
            job.result = Some(report);
            job.completed_at = Some(Utc::now());
        })
    }

    pub fn fail(&self, job_id: Uuid, failure: Failure) -> Result<(), RegistryError> {
        self.transition(job_id, JobState::Failed, |job| {
            job.error = Some(failure);
            job.completed_at = Some(Utc::now());
        })
    }

    fn transition(
        &self,
        job_id: Uuid,
        to: JobState,
        apply: impl FnOnce(&mut Job),
    ) -> Result<(), RegistryError> {
        let mut jobs = self.jobs.lock();
        let entry = jobs.get_mut(&job_id).ok_or(RegistryError::NotFound(job_id))?;

        let from = entry.job.state;
        let allowed = match to {
            JobState::Processing => from == JobState::Queued,
            JobState::Completed | JobState::Failed => !from.is_terminal(),
            JobState::Queued => false,
        };
        if !allowed {
            return Err(RegistryError::InvalidTransition { job_id, from, to });
        }

        entry.job.state = to;
        apply(&mut entry.job);
        entry.state_tx.send_replace(to);
        Ok(())
    }

    pub fn status(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<JobView, RegistryError> {
        self.jobs
            .lock()
            .get(&job_id)
            .map(|e| e.job.view(now))
            .ok_or(RegistryError::NotFound(job_id))
    }

    /// Waits until the job is terminal. `Ok(None)` when `timeout` elapses
    /// first; the job itself is unaffected.
    pub async fn wait_for_terminal(
        &self,
        job_id: Uuid,
        timeout: Duration,
    ) -> Result<Option<JobView>, RegistryError> {
        let mut rx = {
            let jobs = self.jobs.lock();
            let entry = jobs.get(&job_id).ok_or(RegistryError::NotFound(job_id))?;
            entry.state_tx.subscribe()
        };

        let result = match tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal())).await {
            Ok(Ok(_)) => self.status(job_id, Utc::now()).map(Some),
            // Sender dropped: the entry was removed while we waited.
            Ok(Err(_)) => Err(RegistryError::NotFound(job_id)),
            Err(_) => Ok(None),
        };
        result
    }

    pub fn counts(&self) -> JobCounts {
        let jobs = self.jobs.lock();
        let mut counts = JobCounts::default();
        for entry in jobs.values() {
            match entry.job.state {
                JobState::Queued => counts.queued += 1,
                JobState::Processing => counts.processing += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Removes terminal jobs that finished more than the retention window
    /// before `now`. Queued and Processing jobs are never touched.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        jobs.retain(|_, entry| {
            let Some(done) = entry.job.completed_at else {
                return true;
            };
            if !entry.job.state.is_terminal() {
                return true;
            }
            match (now - done).to_std() {
                Ok(age) => age <= self.retention,
                Err(_) => true,
            }
        });
        before - jobs.len()
    }

    /// Runs the expiry sweep every `interval` until `shutdown` is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = self.sweep_expired(Utc::now());
                    if removed > 0 {
                        tracing::info!(removed, "Expired jobs swept");
                    }
                }
            }
        }
        tracing::debug!("Expiry sweeper stopped");
    }
}

impl ProgressObserver for JobRegistry {
    fn pages_total(&self, job_id: Uuid, pages: usize) {
        if let Some(entry) = self.jobs.lock().get_mut(&job_id) {
            entry.job.progress.pages_total = pages;
        }
    }

    fn page_finished(&self, job_id: Uuid, failed: bool) {
        if let Some(entry) = self.jobs.lock().get_mut(&job_id) {
            entry.job.progress.pages_done += 1;
            if failed {
                entry.job.progress.pages_failed += 1;
            }
        }
    }
}
