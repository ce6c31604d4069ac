//! Batch decomposition of a document over the adaptive pool.

use chrono::Utc;
use std::ops::Range;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::detection::DetectionResult;
use crate::models::error::ErrorKind;
use crate::models::job::{BatchSummary, ExtractionReport, PageFailure, PageTask};
use crate::services::document::{DocumentError, DocumentHandle};
use crate::services::page::{PageError, PageProcessor};
use crate::services::pool::AdaptiveWorkerPool;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("document has no pages")]
    EmptyDocument,

    #[error("all {pages} pages failed; first error: {first_error}")]
    AllPagesFailed { pages: usize, first_error: String },

    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::EmptyDocument | ExtractError::Document(_) => ErrorKind::Document,
            ExtractError::AllPagesFailed { .. } => ErrorKind::AllPagesFailed,
        }
    }
}

/// Receives page-level progress while a document is extracted.
pub trait ProgressObserver: Send + Sync {
    fn pages_total(&self, job_id: Uuid, pages: usize);
    fn page_finished(&self, job_id: Uuid, failed: bool);
}

/// Observer that ignores progress.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn pages_total(&self, _: Uuid, _: usize) {}
    fn page_finished(&self, _: Uuid, _: bool) {}
}

/// Consecutive page ranges of at most `batch_size` pages.
pub fn batch_ranges(pages: usize, batch_size: usize) -> Vec<Range<usize>> {
    let size = batch_size.max(1);
    (0..pages)
        .step_by(size)
        .map(|start| start..(start + size).min(pages))
        .collect()
}

/// Splits a batch in two halves when the system is overloaded.
fn dispatch_chunks(batch: Range<usize>, overloaded: bool) -> Vec<Range<usize>> {
    if !overloaded || batch.len() < 2 {
        return vec![batch];
    }
    let mid = batch.start + batch.len().div_ceil(2);
    vec![batch.start..mid, mid..batch.end]
}

/// Drives one document through the pool, one batch at a time.
pub struct BatchScheduler {
    pool: Arc<AdaptiveWorkerPool>,
    processor: Arc<PageProcessor>,
    batch_size: usize,
    progress: Arc<dyn ProgressObserver>,
}

impl BatchScheduler {
    pub fn new(
        pool: Arc<AdaptiveWorkerPool>,
        processor: Arc<PageProcessor>,
        batch_size: usize,
        progress: Arc<dyn ProgressObserver>,
    ) -> Self {
        Self {
            pool,
            processor,
            batch_size: batch_size.max(1),
            progress,
        }
    }

    /// Extracts every page of `document`.
    ///
    /// Batches run strictly one after the other; pages inside a batch run
    /// concurrently up to the pool capacity read at dispatch. Failed pages are
    /// recorded in the report and only fail the call when no page succeeded.
    /// Detections are in completion order.
    pub async fn extract(
        &self,
        document: Arc<dyn DocumentHandle>,
        job_id: Uuid,
    ) -> Result<ExtractionReport, ExtractError> {
        let pages_total = document.page_count();
        if pages_total == 0 {
            return Err(ExtractError::EmptyDocument);
        }
        self.progress.pages_total(job_id, pages_total);

        let mut detections: Vec<DetectionResult> = Vec::new();
        let mut failed_pages: Vec<PageFailure> = Vec::new();
        let mut batches = Vec::new();

        for (batch_index, batch) in batch_ranges(pages_total, self.batch_size).into_iter().enumerate() {
            let capacity = self.pool.capacity();
            let overloaded = self.pool.is_overloaded();
            let started_at = Utc::now();
            tracing::info!(
                %job_id,
                batch = batch_index,
                first_page = batch.start + 1,
                pages = batch.len(),
                capacity,
                overloaded,
                "Dispatching batch"
            );

            for chunk in dispatch_chunks(batch.clone(), overloaded) {
                self.run_chunk(
                    &document,
                    job_id,
                    chunk,
                    capacity,
                    &mut detections,
                    &mut failed_pages,
                )
                .await;
            }

            batches.push(BatchSummary {
                index: batch_index,
                first_page: batch.start as u32 + 1,
                page_count: batch.len(),
                capacity,
                started_at,
                finished_at: Utc::now(),
            });
        }

        if failed_pages.len() == pages_total {
            let first_error = failed_pages
                .iter()
                .min_by_key(|f| f.page)
                .map(|f| format!("page {}: {}", f.page, f.message))
                .unwrap_or_default();
            return Err(ExtractError::AllPagesFailed {
                pages: pages_total,
                first_error,
            });
        }

        if !failed_pages.is_empty() {
            tracing::warn!(
                %job_id,
                failed = failed_pages.len(),
                pages = pages_total,
                "Document extracted with failed pages"
            );
        }
        failed_pages.sort_by_key(|f| f.page);

        Ok(ExtractionReport {
            detections,
            pages_total,
            failed_pages,
            batches,
        })
    }

    async fn run_chunk(
        &self,
        document: &Arc<dyn DocumentHandle>,
        job_id: Uuid,
        chunk: Range<usize>,
        capacity: usize,
        detections: &mut Vec<DetectionResult>,
        failed_pages: &mut Vec<PageFailure>,
    ) {
        let mut tasks = Vec::with_capacity(chunk.len());
        for index in chunk {
            match document.page_size(index) {
                Some(size) => tasks.push(PageTask {
                    index,
                    size,
                    dpi: self.processor.base_dpi(),
                }),
                None => self.record_failure(job_id, index as u32 + 1, &PageError::Unmeasurable, failed_pages),
            }
        }

        let outcomes = self
            .pool
            .submit_batch(tasks.clone(), capacity, |task| {
                let processor = self.processor.clone();
                let document = document.clone();
                async move { processor.process(document.as_ref(), task).await }
            })
            .await;

        for (slot, outcome) in outcomes {
            let page = tasks[slot].page_number();
            match outcome {
                Ok(found) => {
                    detections.extend(found);
                    self.progress.page_finished(job_id, false);
                }
                Err(e) => self.record_failure(job_id, page, &e, failed_pages),
            }
        }
    }

    fn record_failure(
        &self,
        job_id: Uuid,
        page: u32,
        error: &PageError,
        failed_pages: &mut Vec<PageFailure>,
    ) {
        tracing::warn!(%job_id, page, kind = %error.kind(), error = %error, "Page failed");
        metrics::counter!("extraction_pages_failed").increment(1);
        self.progress.page_finished(job_id, true);
        failed_pages.push(PageFailure {
            page,
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}
