use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Per-job working directory holding the uploaded document.
///
/// The directory and everything in it is deleted when the last reference is
/// dropped, whichever way the job ended.
#[derive(Debug)]
pub struct JobInput {
    dir: TempDir,
    document: PathBuf,
}

impl JobInput {
    /// Writes `bytes` into a fresh directory under `work_dir`.
    pub async fn write(work_dir: &Path, job_id: Uuid, bytes: &[u8]) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(work_dir).await?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job-{job_id}-"))
            .tempdir_in(work_dir)?;
        let document = dir.path().join("document.pdf");
        tokio::fs::write(&document, bytes).await?;
        Ok(Self { dir, document })
    }

    pub fn document(&self) -> &Path {
        &self.document
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// A job waiting for a job-processor worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub input: Arc<JobInput>,
    pub timeout: Duration,
}

/// Sending half of the bounded FIFO job queue.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<QueuedJob>,
    depth: Arc<AtomicUsize>,
}

/// Receiving half, shared by all job-processor workers.
#[derive(Clone)]
pub struct JobReceiver {
    rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    depth: Arc<AtomicUsize>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (JobQueue, JobReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let depth = Arc::new(AtomicUsize::new(0));
        (
            JobQueue {
                tx,
                depth: depth.clone(),
            },
            JobReceiver {
                rx: Arc::new(Mutex::new(rx)),
                depth,
            },
        )
    }

    /// Enqueue without waiting. A full queue is back-pressure, not a stall.
    pub fn try_enqueue(&self, job: QueuedJob) -> Result<(), QueueError> {
        // Count first so a fast worker can never observe a negative depth.
        self.depth.fetch_add(1, Ordering::SeqCst);
        match self.tx.try_send(job) {
            Ok(()) => {
                metrics::gauge!("extraction_queue_depth").set(self.depth() as f64);
                Ok(())
            }
            Err(e) => {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                Err(match e {
                    mpsc::error::TrySendError::Full(_) => QueueError::Full,
                    mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
                })
            }
        }
    }

    /// Jobs queued but not yet claimed by a worker.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl JobReceiver {
    /// Waits for the next job in FIFO order. `None` once every sender is gone.
    pub async fn dequeue(&self) -> Option<QueuedJob> {
        let job = self.rx.lock().await.recv().await?;
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::gauge!("extraction_queue_depth").set(depth as f64);
        Some(job)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("job queue is full")]
    Full,

    #[error("job queue is closed")]
    Closed,
}
