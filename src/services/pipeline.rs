//! The extraction service: admission, job workers and background tasks.

use chrono::Utc;
use garde::Validate;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::api::{DetectResponse, SubmitOptions, SubmitResponse, Submission};
use crate::models::error::{ErrorKind, Failure};
use crate::models::job::{Job, JobState, JobView};
use crate::models::load::SystemStats;
use crate::services::detector::CodeDetector;
use crate::services::document::{DocumentLoader, PageRenderer};
use crate::services::monitor::{LoadSampler, LoadState, ResourceMonitor};
use crate::services::page::{PageError, PageProcessor};
use crate::services::pool::AdaptiveWorkerPool;
use crate::services::queue::{JobInput, JobQueue, JobReceiver, QueueError, QueuedJob};
use crate::services::registry::{JobRegistry, RegistryError};
use crate::services::scheduler::BatchScheduler;
use crate::services::timeout::{with_timeout, GuardError};

const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("system overloaded (cpu {cpu:.0}%, memory {memory:.0}%), retry later")]
    SystemOverloaded { cpu: f32, memory: f32 },

    #[error("job queue is full, retry later")]
    QueueFull,

    #[error("{0}")]
    Validation(String),

    #[error("job {job_id} still running after {}s", .waited.as_secs())]
    RequestTimeout { job_id: Uuid, waited: Duration },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Page(#[from] PageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::SystemOverloaded { .. } | ServiceError::QueueFull => {
                ErrorKind::SystemOverloaded
            }
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::Page(e) => e.kind(),
            ServiceError::Io(_) | ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Job the error refers to, when a job exists.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            ServiceError::RequestTimeout { job_id, .. } | ServiceError::NotFound(job_id) => {
                Some(*job_id)
            }
            _ => None,
        }
    }
}

impl From<RegistryError> for ServiceError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Internal(other.to_string()),
        }
    }
}

/// External collaborators the pipeline is built from.
pub struct Collaborators {
    pub loader: Arc<dyn DocumentLoader>,
    pub renderer: Arc<dyn PageRenderer>,
    pub detector: Arc<dyn CodeDetector>,
    /// Heuristic detector, used only when the heuristic fallback is enabled.
    pub fallback: Option<Arc<dyn CodeDetector>>,
}

/// Liveness of the background tasks.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub started: bool,
    pub sample_age_ms: u64,
    pub monitor_fresh: bool,
    pub workers_alive: usize,
    pub workers_expected: usize,
}

impl ServiceHealth {
    pub fn is_healthy(&self) -> bool {
        self.started && self.monitor_fresh && self.workers_alive == self.workers_expected
    }
}

#[derive(Default)]
struct Tasks {
    background: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// Owns the whole job pipeline.
///
/// Built once at start-up, then [`start`](Self::start)ed to spawn the load
/// monitor, the expiry sweeper and the job-processor workers, all tied to one
/// cancellation token that [`shutdown`](Self::shutdown) cancels.
pub struct ExtractionService {
    config: PipelineConfig,
    loader: Arc<dyn DocumentLoader>,
    load: Arc<LoadState>,
    pool: Arc<AdaptiveWorkerPool>,
    processor: Arc<PageProcessor>,
    scheduler: Arc<BatchScheduler>,
    registry: Arc<JobRegistry>,
    queue: JobQueue,
    receiver: JobReceiver,
    shutdown: CancellationToken,
    tasks: Mutex<Tasks>,
}

impl ExtractionService {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        let load = Arc::new(LoadState::new(config.hardware_limit));
        let pool = Arc::new(AdaptiveWorkerPool::new(
            load.clone(),
            config.watermark,
            config.hardware_limit,
        ));

        let mut processor = PageProcessor::new(
            collaborators.renderer,
            collaborators.detector,
            load.clone(),
            config.watermark,
            config.render,
            config.page_timeout,
        );
        if config.heuristic_fallback {
            if let Some(fallback) = collaborators.fallback {
                processor = processor.with_fallback(fallback);
            }
        }
        let processor = Arc::new(processor);

        let registry = Arc::new(JobRegistry::new(config.retention));
        let scheduler = Arc::new(BatchScheduler::new(
            pool.clone(),
            processor.clone(),
            config.batch_size,
            registry.clone(),
        ));
        let (queue, receiver) = JobQueue::new(config.queue_capacity);

        Self {
            config,
            loader: collaborators.loader,
            load,
            pool,
            processor,
            scheduler,
            registry,
            queue,
            receiver,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Shared load state, exposed for tests and tooling.
    pub fn load_state(&self) -> Arc<LoadState> {
        self.load.clone()
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    /// Spawns the monitor, the expiry sweeper and the job workers. Calling it
    /// twice is a no-op.
    pub fn start<S: LoadSampler>(&self, sampler: S) {
        let mut tasks = self.tasks.lock();
        if !tasks.workers.is_empty() {
            return;
        }

        let monitor = ResourceMonitor::new(sampler, self.config.monitor_interval);
        tasks.background.push(tokio::spawn(monitor.run(
            self.load.clone(),
            self.pool.clone(),
            self.shutdown.clone(),
        )));
        tasks.background.push(tokio::spawn(
            self.registry
                .clone()
                .run_sweeper(self.config.sweep_interval, self.shutdown.clone()),
        ));

        for id in 0..self.config.job_workers {
            let worker = JobWorker {
                id,
                receiver: self.receiver.clone(),
                registry: self.registry.clone(),
                loader: self.loader.clone(),
                scheduler: self.scheduler.clone(),
                shutdown: self.shutdown.clone(),
            };
            tasks.workers.push(tokio::spawn(worker.run()));
        }

        tracing::info!(
            job_workers = self.config.job_workers,
            hardware_limit = self.config.hardware_limit,
            batch_size = self.config.batch_size,
            high_watermark = self.config.watermark.high_percent,
            "Extraction service started"
        );
    }

    /// Cancels all background tasks and waits for them to finish. Jobs still
    /// in flight are marked Failed.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for handle in tasks.workers.into_iter().chain(tasks.background) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!("Extraction service stopped");
    }

    /// Admits a document. Rejected outright when the system is overloaded or
    /// the queue is full; no job is created in that case.
    pub async fn submit(
        &self,
        source: &str,
        bytes: &[u8],
        options: SubmitOptions,
    ) -> Result<Submission, ServiceError> {
        options
            .validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        validate_document(bytes)?;

        let load = self.load.current();
        if self.config.watermark.is_exceeded(&load) {
            metrics::counter!("extraction_jobs_rejected").increment(1);
            tracing::warn!(
                cpu = load.cpu_percent,
                memory = load.memory_percent,
                "Rejecting submission, system overloaded"
            );
            return Err(ServiceError::SystemOverloaded {
                cpu: load.cpu_percent,
                memory: load.memory_percent,
            });
        }

        let job_id = Uuid::new_v4();
        let input = JobInput::write(&self.config.work_dir, job_id, bytes).await?;
        let timeout = self.config.job_timeout(options.timeout);

        self.registry.insert(Job::queued(job_id, source));
        let queued = QueuedJob {
            job_id,
            input: Arc::new(input),
            timeout,
        };
        if let Err(e) = self.queue.try_enqueue(queued) {
            self.registry.remove(job_id);
            metrics::counter!("extraction_jobs_rejected").increment(1);
            tracing::warn!(%job_id, error = %e, "Rejecting submission");
            return Err(match e {
                QueueError::Full => ServiceError::QueueFull,
                QueueError::Closed => ServiceError::Internal(e.to_string()),
            });
        }

        metrics::counter!("extraction_jobs_total").increment(1);
        tracing::info!(
            %job_id,
            source,
            bytes = bytes.len(),
            timeout_secs = timeout.as_secs(),
            "Job queued"
        );

        if !options.wait() {
            return Ok(Submission::Accepted(SubmitResponse {
                job_id,
                state: JobState::Queued,
                message: "Document accepted for extraction".to_string(),
            }));
        }

        match self.registry.wait_for_terminal(job_id, timeout).await? {
            Some(view) => Ok(Submission::Finished(view)),
            None => Err(ServiceError::RequestTimeout {
                job_id,
                waited: timeout,
            }),
        }
    }

    pub fn status(&self, job_id: Uuid) -> Result<JobView, ServiceError> {
        Ok(self.registry.status(job_id, Utc::now())?)
    }

    pub fn stats(&self) -> SystemStats {
        let sample = self.load.current();
        SystemStats {
            cpu_percent: sample.cpu_percent,
            memory_percent: sample.memory_percent,
            sampled_at: sample.sampled_at,
            high_watermark: self.config.watermark.high_percent,
            overloaded: self.config.watermark.is_exceeded(&sample),
            queue_depth: self.queue.depth(),
            job_workers: self.config.job_workers,
            pool_capacity: self.pool.capacity(),
            hardware_limit: self.pool.hardware_limit(),
            active_page_workers: self.pool.active(),
            jobs: self.registry.counts(),
        }
    }

    pub fn health(&self) -> ServiceHealth {
        let tasks = self.tasks.lock();
        let sample_age = (Utc::now() - self.load.current().sampled_at)
            .to_std()
            .unwrap_or_default();
        ServiceHealth {
            started: !tasks.workers.is_empty(),
            sample_age_ms: sample_age.as_millis() as u64,
            monitor_fresh: sample_age <= self.config.monitor_interval * 3,
            workers_alive: tasks.workers.iter().filter(|h| !h.is_finished()).count(),
            workers_expected: self.config.job_workers,
        }
    }

    /// Runs detection on a single uploaded image.
    pub async fn detect_image(&self, bytes: Vec<u8>) -> Result<DetectResponse, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::Validation("empty image upload".to_string()));
        }
        let raster = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))?
            .map_err(|e| ServiceError::Validation(format!("unreadable image: {e}")))?;

        let detections = self.processor.detect_image(&raster).await?;
        Ok(DetectResponse {
            width: raster.width(),
            height: raster.height(),
            detections,
        })
    }
}

fn validate_document(bytes: &[u8]) -> Result<(), ServiceError> {
    if bytes.is_empty() {
        return Err(ServiceError::Validation("empty document upload".to_string()));
    }
    if !bytes.starts_with(PDF_MAGIC) {
        return Err(ServiceError::Validation(
            "upload is not a PDF document".to_string(),
        ));
    }
    Ok(())
}

/// One job-processor loop: claim, process, record, repeat.
struct JobWorker {
    id: usize,
    receiver: JobReceiver,
    registry: Arc<JobRegistry>,
    loader: Arc<dyn DocumentLoader>,
    scheduler: Arc<BatchScheduler>,
    shutdown: CancellationToken,
}

impl JobWorker {
    async fn run(self) {
        tracing::debug!(worker = self.id, "Job worker started");
        loop {
            let job = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                job = self.receiver.dequeue() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.process(job).await;
        }
        tracing::debug!(worker = self.id, "Job worker stopped");
    }

    async fn process(&self, job: QueuedJob) {
        let job_id = job.job_id;
        if let Err(e) = self.registry.mark_processing(job_id) {
            tracing::warn!(%job_id, error = %e, "Skipping job");
            return;
        }
        tracing::info!(%job_id, worker = self.id, "Processing job");
        let started = Instant::now();

        let loader = self.loader.clone();
        let scheduler = self.scheduler.clone();
        let input = job.input.clone();
        let work = with_timeout(job.timeout, async move {
            let document = loader.open(input.document()).await?;
            scheduler.extract(document, job_id).await
        });

        let outcome = tokio::select! {
            outcome = work => outcome,
            _ = self.shutdown.cancelled() => {
                self.record_failure(
                    job_id,
                    Failure::new(ErrorKind::Internal, "service shut down before the job finished"),
                );
                return;
            }
        };
        metrics::histogram!("extraction_processing_seconds").record(started.elapsed().as_secs_f64());

        match outcome {
            Ok(Ok(report)) => {
                tracing::info!(
                    %job_id,
                    pages = report.pages_total,
                    detections = report.detections.len(),
                    failed_pages = report.failed_pages.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                match self.registry.complete(job_id, report) {
                    Ok(()) => metrics::counter!("extraction_jobs_completed").increment(1),
                    Err(e) => tracing::warn!(%job_id, error = %e, "Could not record result"),
                }
            }
            Ok(Err(e)) => self.record_failure(job_id, Failure::new(e.kind(), e.to_string())),
            Err(GuardError::Elapsed { duration }) => self.record_failure(
                job_id,
                Failure::new(
                    ErrorKind::Timeout,
                    format!("job exceeded its {}s timeout", duration.as_secs()),
                ),
            ),
            Err(GuardError::Crashed(msg)) => {
                self.record_failure(job_id, Failure::new(ErrorKind::Internal, msg))
            }
        }
        // `job` drops here; its input directory goes with the last reference.
    }

    fn record_failure(&self, job_id: Uuid, failure: Failure) {
        tracing::error!(%job_id, kind = %failure.kind, error = %failure.message, "Job failed");
        match self.registry.fail(job_id, failure) {
            Ok(()) => metrics::counter!("extraction_jobs_failed").increment(1),
            Err(e) => tracing::warn!(%job_id, error = %e, "Could not record failure"),
        }
    }
}
