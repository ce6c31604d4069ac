//! Single-page render and detect.

use image::DynamicImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;

use crate::config::RenderSettings;
use crate::models::detection::{
    suppress_overlaps, CodeContent, Confidence, DetectionResult, PageSize,
};
use crate::models::error::ErrorKind;
use crate::models::job::PageTask;
use crate::models::load::{Watermark, ESCALATE_FRACTION};
use crate::services::detector::{CodeDetector, DetectError, RawDetection};
use crate::services::document::{DocumentHandle, PageRenderer, RenderError};
use crate::services::monitor::LoadState;

#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("decode failed: {0}")]
    Decode(#[from] DetectError),

    #[error("page size is unreadable")]
    Unmeasurable,

    #[error("page did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("page task aborted: {0}")]
    Aborted(String),
}

impl PageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PageError::Render(_) | PageError::Unmeasurable => ErrorKind::PageRender,
            PageError::Decode(_) => ErrorKind::PageDecode,
            PageError::Timeout(_) => ErrorKind::PageTimeout,
            PageError::Aborted(_) => ErrorKind::Internal,
        }
    }
}

impl From<JoinError> for PageError {
    fn from(e: JoinError) -> Self {
        PageError::Aborted(e.to_string())
    }
}

/// Renders one page, runs the decoder on it and maps hits into document space.
///
/// A page with no hits on a large raster is re-rendered once at the escalated
/// resolution, but only while the system is comfortably below the watermark.
/// Rasters never outlive the call.
pub struct PageProcessor {
    renderer: Arc<dyn PageRenderer>,
    detector: Arc<dyn CodeDetector>,
    fallback: Option<Arc<dyn CodeDetector>>,
    load: Arc<LoadState>,
    watermark: Watermark,
    render: RenderSettings,
    page_timeout: Duration,
}

impl PageProcessor {
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        detector: Arc<dyn CodeDetector>,
        load: Arc<LoadState>,
        watermark: Watermark,
        render: RenderSettings,
        page_timeout: Duration,
    ) -> Self {
        Self {
            renderer,
            detector,
            fallback: None,
            load,
            watermark,
            render,
            page_timeout,
        }
    }

    /// Heuristic detector run on pages where the decoder finds nothing.
    pub fn with_fallback(mut self, fallback: Arc<dyn CodeDetector>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Resolution new page tasks start at.
    pub fn base_dpi(&self) -> u32 {
        self.render.base_dpi
    }

    pub async fn process(
        &self,
        document: &dyn DocumentHandle,
        task: PageTask,
    ) -> Result<Vec<DetectionResult>, PageError> {
        tokio::time::timeout(self.page_timeout, self.run(document, task))
            .await
            .map_err(|_| PageError::Timeout(self.page_timeout))?
    }

    async fn run(
        &self,
        document: &dyn DocumentHandle,
        task: PageTask,
    ) -> Result<Vec<DetectionResult>, PageError> {
        let page = task.page_number();

        let mut raster = self
            .renderer
            .render_page(document, task.index, task.dpi)
            .await?;
        let mut found = self.detector.detect(&raster).await?;

        if found.is_empty() && self.should_escalate(&raster, task.dpi) {
            tracing::debug!(
                page,
                from_dpi = task.dpi,
                to_dpi = self.render.escalated_dpi,
                "No codes found, re-rendering at higher resolution"
            );
            // Release the first raster before allocating the larger one.
            drop(raster);
            raster = self
                .renderer
                .render_page(document, task.index, self.render.escalated_dpi)
                .await?;
            found = self.detector.detect(&raster).await?;
        }

        let raster_size = (raster.width(), raster.height());
        let mut results: Vec<DetectionResult> = found
            .into_iter()
            .map(|raw| {
                let content = match raw.payload {
                    Some(data) => CodeContent::Decoded { data },
                    None => CodeContent::Undecodable,
                };
                DetectionResult::from_raster(page, raw.polygon, raster_size, task.size, content)
            })
            .collect();

        if results.is_empty() {
            results = self.heuristic(&raster, page, task.size).await;
        }

        tracing::debug!(page, detections = results.len(), "Page processed");
        Ok(results)
    }

    fn should_escalate(&self, raster: &DynamicImage, dpi: u32) -> bool {
        let pixels = raster.width() as u64 * raster.height() as u64;
        self.render.escalated_dpi > dpi
            && pixels > self.render.escalation_min_pixels
            && self.watermark.is_below(&self.load.current(), ESCALATE_FRACTION)
    }

    /// Fallback candidates, or nothing when no fallback is configured. Fallback
    /// errors are logged and treated as "nothing found".
    async fn heuristic(
        &self,
        raster: &DynamicImage,
        page: u32,
        page_size: PageSize,
    ) -> Vec<DetectionResult> {
        let Some(fallback) = &self.fallback else {
            return Vec::new();
        };

        let raw: Vec<RawDetection> = match fallback.detect(raster).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(page, error = %e, "Heuristic detector failed");
                return Vec::new();
            }
        };

        let raster_size = (raster.width(), raster.height());
        let candidates = raw
            .into_iter()
            .map(|r| {
                DetectionResult::from_raster(
                    page,
                    r.polygon,
                    raster_size,
                    page_size,
                    CodeContent::Heuristic {
                        method: fallback.method().to_string(),
                        confidence: Confidence::Low,
                    },
                )
            })
            .collect();
        suppress_overlaps(candidates)
    }

    /// Detects codes on a standalone image. Coordinates stay in pixels and the
    /// image counts as page 1.
    pub async fn detect_image(
        &self,
        raster: &DynamicImage,
    ) -> Result<Vec<DetectionResult>, PageError> {
        let size = (raster.width(), raster.height());
        let page_size = PageSize::new(size.0 as f64, size.1 as f64);

        let found = self.detector.detect(raster).await?;
        let results: Vec<DetectionResult> = found
            .into_iter()
            .map(|raw| {
                let content = match raw.payload {
                    Some(data) => CodeContent::Decoded { data },
                    None => CodeContent::Undecodable,
                };
                DetectionResult::from_raster(1, raw.polygon, size, page_size, content)
            })
            .collect();

        if results.is_empty() {
            return Ok(self.heuristic(raster, 1, page_size).await);
        }
        Ok(results)
    }
}
