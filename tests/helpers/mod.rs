//! Fake collaborators and harness for pipeline and router tests.
#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, GrayImage, Luma};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uuid::Uuid;

use codescan::config::PipelineConfig;
use codescan::models::detection::PageSize;
use codescan::models::job::{JobState, JobView};
use codescan::models::load::{LoadSample, Watermark};
use codescan::services::detector::{CodeDetector, DetectError, RawDetection};
use codescan::services::document::{
    DocumentError, DocumentHandle, DocumentLoader, PageRenderer, RenderError,
};
use codescan::services::monitor::{LoadSampler, MonitorError};
use codescan::services::pipeline::{Collaborators, ExtractionService};

/// US Letter in points.
pub const LETTER: PageSize = PageSize {
    width: 612.0,
    height: 792.0,
};

/// Side of the square rasters produced by [`FakeRenderer`].
pub const RASTER_SIDE: u32 = 16;

pub struct FakeDocument {
    path: PathBuf,
    pages: usize,
    unmeasurable: HashSet<usize>,
}

impl DocumentHandle for FakeDocument {
    fn page_count(&self) -> usize {
        self.pages
    }

    fn page_size(&self, index: usize) -> Option<PageSize> {
        if index >= self.pages || self.unmeasurable.contains(&index) {
            None
        } else {
            Some(LETTER)
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Reads `%PDF-fake pages=N [nosize=a,b]` documents written by the fixtures.
#[derive(Default)]
pub struct FakeLoader;

#[async_trait]
impl DocumentLoader for FakeLoader {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentHandle>, DocumentError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| DocumentError::Crashed(e.to_string()))?;

        let mut pages = None;
        let mut unmeasurable = HashSet::new();
        for token in text.split_whitespace() {
            if let Some(n) = token.strip_prefix("pages=") {
                pages = n.parse().ok();
            } else if let Some(list) = token.strip_prefix("nosize=") {
                unmeasurable.extend(list.split(',').filter_map(|p| p.parse::<usize>().ok()));
            }
        }

        let pages = pages.ok_or_else(|| DocumentError::Crashed("no page count".into()))?;
        if pages == 0 {
            return Err(DocumentError::Empty);
        }
        Ok(Arc::new(FakeDocument {
            path: path.to_path_buf(),
            pages,
            unmeasurable,
        }))
    }
}

/// Renders small blank rasters that carry the page index in pixel (0, 0).
///
/// Records the wall-clock window of every render and the peak number of
/// concurrent renders.
pub struct FakeRenderer {
    pub delay: Duration,
    pub fail_pages: HashSet<usize>,
    pub hang_pages: HashSet<usize>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    windows: Mutex<Vec<(usize, Instant, Instant)>>,
}

impl FakeRenderer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail_pages: HashSet::new(),
            hang_pages: HashSet::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            windows: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, pages: &[usize]) -> Self {
        self.fail_pages.extend(pages);
        self
    }

    pub fn hanging(mut self, pages: &[usize]) -> Self {
        self.hang_pages.extend(pages);
        self
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// `(page index, started, finished)` for every completed render.
    pub fn windows(&self) -> Vec<(usize, Instant, Instant)> {
        self.windows.lock().clone()
    }
}

#[async_trait]
impl PageRenderer for FakeRenderer {
    async fn render_page(
        &self,
        _document: &dyn DocumentHandle,
        index: usize,
        _dpi: u32,
    ) -> Result<DynamicImage, RenderError> {
        let started = Instant::now();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if self.hang_pages.contains(&index) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.windows.lock().push((index, started, Instant::now()));

        if self.fail_pages.contains(&index) {
            return Err(RenderError::Failed {
                status: "exit status: 1".into(),
                stderr: format!("cannot render page {}", index + 1),
            });
        }

        let mut raster = GrayImage::from_pixel(RASTER_SIDE, RASTER_SIDE, Luma([255]));
        raster.put_pixel(0, 0, Luma([index as u8]));
        Ok(DynamicImage::ImageLuma8(raster))
    }
}

/// Reports `codes_per_page` decoded codes on every page it is shown.
pub struct FakeDetector {
    pub codes_per_page: usize,
    pub fail_pages: HashSet<usize>,
}

impl FakeDetector {
    pub fn new(codes_per_page: usize) -> Self {
        Self {
            codes_per_page,
            fail_pages: HashSet::new(),
        }
    }

    pub fn failing(mut self, pages: &[usize]) -> Self {
        self.fail_pages.extend(pages);
        self
    }
}

#[async_trait]
impl CodeDetector for FakeDetector {
    async fn detect(&self, raster: &DynamicImage) -> Result<Vec<RawDetection>, DetectError> {
        let index = raster.to_luma8().get_pixel(0, 0)[0] as usize;
        if self.fail_pages.contains(&index) {
            return Err(DetectError::Crashed(format!("decoder rejected page {}", index + 1)));
        }
        Ok((0..self.codes_per_page)
            .map(|k| {
                let o = (k * 4) as f32;
                RawDetection {
                    polygon: [(o, o), (o + 3.0, o), (o + 3.0, o + 3.0), (o, o + 3.0)],
                    payload: Some(format!("page-{}-code-{}", index + 1, k)),
                }
            })
            .collect())
    }

    fn method(&self) -> &'static str {
        "fake"
    }
}

/// Always reports the same load.
pub struct FixedSampler(pub LoadSample);

impl LoadSampler for FixedSampler {
    fn sample(&mut self) -> Result<LoadSample, MonitorError> {
        Ok(LoadSample::new(self.0.cpu_percent, self.0.memory_percent))
    }
}

pub fn calm() -> FixedSampler {
    FixedSampler(LoadSample::new(10.0, 20.0))
}

/// A service wired to fakes, with its own work directory.
pub struct Harness {
    pub service: Arc<ExtractionService>,
    pub renderer: Arc<FakeRenderer>,
    pub work: TempDir,
}

pub fn test_config(work: &Path) -> PipelineConfig {
    PipelineConfig {
        work_dir: work.to_path_buf(),
        job_workers: 2,
        queue_capacity: 16,
        batch_size: 10,
        watermark: Watermark::new(85.0),
        hardware_limit: 4,
        monitor_interval: Duration::from_millis(50),
        retention: Duration::from_secs(3600),
        sweep_interval: Duration::from_millis(50),
        default_job_timeout: Duration::from_secs(30),
        max_job_timeout: Duration::from_secs(60),
        page_timeout: Duration::from_secs(30),
        ..PipelineConfig::default()
    }
}

pub fn harness(renderer: FakeRenderer, detector: FakeDetector) -> Harness {
    harness_with(renderer, detector, |_| {})
}

pub fn harness_with(
    renderer: FakeRenderer,
    detector: FakeDetector,
    tune: impl FnOnce(&mut PipelineConfig),
) -> Harness {
    let work = tempfile::tempdir().expect("work dir");
    let mut config = test_config(work.path());
    tune(&mut config);

    let renderer = Arc::new(renderer);
    let service = Arc::new(ExtractionService::new(
        config,
        Collaborators {
            loader: Arc::new(FakeLoader),
            renderer: renderer.clone(),
            detector: Arc::new(detector),
            fallback: None,
        },
    ));
    Harness {
        service,
        renderer,
        work,
    }
}

/// Polls the job until it is terminal or `limit` passes.
pub async fn wait_terminal(service: &ExtractionService, job_id: Uuid, limit: Duration) -> JobView {
    let deadline = Instant::now() + limit;
    loop {
        let view = service.status(job_id).expect("job should exist");
        if view.state.is_terminal() {
            return view;
        }
        assert!(
            Instant::now() < deadline,
            "job {job_id} still {} after {:?}",
            view.state,
            limit
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until no job directories remain under `work`.
pub async fn wait_work_dir_empty(work: &Path, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        let remaining = std::fs::read_dir(work).map(|d| d.count()).unwrap_or(0);
        if remaining == 0 {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn assert_state(view: &JobView, state: JobState) {
    assert_eq!(
        view.state, state,
        "unexpected state for job {}: error = {:?}",
        view.job_id, view.error
    );
}
