use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::services::pipeline::ExtractionService;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ExtractionService>,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(service: Arc<ExtractionService>, max_upload_bytes: usize) -> Self {
        Self {
            service,
            max_upload_bytes,
        }
    }
}

/// State of the separately mounted metrics route.
pub type MetricsState = Arc<PrometheusHandle>;
