use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::models::load::Watermark;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Root under which per-job working directories are created.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Largest accepted upload in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Code decoding service endpoint.
    #[serde(default = "default_detector_url")]
    pub detector_url: String,

    #[serde(default = "default_detector_timeout_secs")]
    pub detector_timeout_secs: u64,

    /// Rasterizer executable (poppler's pdftoppm).
    #[serde(default = "default_renderer_bin")]
    pub renderer_bin: String,

    /// Number of job-processor workers.
    #[serde(default = "default_job_workers")]
    pub job_workers: usize,

    /// Maximum number of queued (not yet claimed) jobs.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Pages per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// CPU/memory percentage above which the system counts as overloaded.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f32,

    /// Upper bound for page-level parallelism; defaults to the CPU count.
    #[serde(default)]
    pub max_page_workers: Option<usize>,

    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    /// How long terminal jobs are kept for retrieval.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_job_timeout_secs")]
    pub default_job_timeout_secs: u64,

    #[serde(default = "default_max_job_timeout_secs")]
    pub max_job_timeout_secs: u64,

    #[serde(default = "default_page_timeout_secs")]
    pub page_timeout_secs: u64,

    #[serde(default = "default_base_dpi")]
    pub base_dpi: u32,

    #[serde(default = "default_escalated_dpi")]
    pub escalated_dpi: u32,

    /// Rasters larger than this (in pixels) are re-rendered when nothing was found.
    #[serde(default = "default_escalation_min_pixels")]
    pub escalation_min_pixels: u64,

    /// Run the contour heuristic on pages where the decoder finds nothing.
    #[serde(default)]
    pub heuristic_fallback: bool,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("codescan")
}

fn default_max_upload_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_detector_url() -> String {
    "http://127.0.0.1:8090/detect".to_string()
}

fn default_detector_timeout_secs() -> u64 {
    30
}

fn default_renderer_bin() -> String {
    "pdftoppm".to_string()
}

fn default_job_workers() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

fn default_batch_size() -> usize {
    10
}

fn default_high_watermark() -> f32 {
    85.0
}

fn default_monitor_interval_secs() -> u64 {
    3
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_job_timeout_secs() -> u64 {
    300
}

fn default_max_job_timeout_secs() -> u64 {
    3600
}

fn default_page_timeout_secs() -> u64 {
    60
}

fn default_base_dpi() -> u32 {
    150
}

fn default_escalated_dpi() -> u32 {
    300
}

fn default_escalation_min_pixels() -> u64 {
    1_500_000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Typed pipeline settings derived from the flat environment view.
    pub fn pipeline(&self) -> PipelineConfig {
        let defaults = PipelineConfig::default();
        PipelineConfig {
            work_dir: self.work_dir.clone(),
            job_workers: self.job_workers.max(1),
            queue_capacity: self.queue_capacity.max(1),
            batch_size: self.batch_size.max(1),
            watermark: Watermark::new(self.high_watermark),
            hardware_limit: self.max_page_workers.unwrap_or(defaults.hardware_limit).max(1),
            monitor_interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
            retention: Duration::from_secs(self.retention_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            default_job_timeout: Duration::from_secs(self.default_job_timeout_secs.max(1)),
            max_job_timeout: Duration::from_secs(self.max_job_timeout_secs.max(1)),
            page_timeout: Duration::from_secs(self.page_timeout_secs.max(1)),
            render: RenderSettings {
                base_dpi: self.base_dpi,
                escalated_dpi: self.escalated_dpi.max(self.base_dpi),
                escalation_min_pixels: self.escalation_min_pixels,
            },
            heuristic_fallback: self.heuristic_fallback,
        }
    }
}

/// Resolution policy for page rasterization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderSettings {
    pub base_dpi: u32,
    pub escalated_dpi: u32,
    pub escalation_min_pixels: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            base_dpi: default_base_dpi(),
            escalated_dpi: default_escalated_dpi(),
            escalation_min_pixels: default_escalation_min_pixels(),
        }
    }
}

/// Tunables of the job pipeline. None of the constants are load-bearing contracts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub work_dir: PathBuf,
    pub job_workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub watermark: Watermark,
    /// Upper bound of the page-level pool.
    pub hardware_limit: usize,
    pub monitor_interval: Duration,
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub default_job_timeout: Duration,
    pub max_job_timeout: Duration,
    pub page_timeout: Duration,
    pub render: RenderSettings,
    pub heuristic_fallback: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            job_workers: default_job_workers(),
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            watermark: Watermark::new(default_high_watermark()),
            hardware_limit: num_cpus::get().max(1),
            monitor_interval: Duration::from_secs(default_monitor_interval_secs()),
            retention: Duration::from_secs(default_retention_secs()),
            sweep_interval: Duration::from_secs(default_sweep_interval_secs()),
            default_job_timeout: Duration::from_secs(default_job_timeout_secs()),
            max_job_timeout: Duration::from_secs(default_max_job_timeout_secs()),
            page_timeout: Duration::from_secs(default_page_timeout_secs()),
            render: RenderSettings::default(),
            heuristic_fallback: false,
        }
    }
}

impl PipelineConfig {
    /// Deadline for one job: the requested timeout capped by the configured maximum.
    pub fn job_timeout(&self, requested_secs: Option<u64>) -> Duration {
        requested_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_job_timeout)
            .min(self.max_job_timeout)
    }
}
