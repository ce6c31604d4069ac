use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use codescan::app_state::AppState;
use codescan::config::AppConfig;
use codescan::routes;
use codescan::services::detector::{ContourDetector, HttpCodeDetector};
use codescan::services::document::{PdfDocumentLoader, PdftoppmRenderer};
use codescan::services::monitor::SysinfoSampler;
use codescan::services::pipeline::{Collaborators, ExtractionService};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing codescan server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_histogram!(
        "extraction_processing_seconds",
        "Time to process one extraction job"
    );
    metrics::describe_counter!("extraction_jobs_total", "Extraction jobs accepted");
    metrics::describe_counter!("extraction_jobs_completed", "Extraction jobs completed");
    metrics::describe_counter!("extraction_jobs_failed", "Extraction jobs that failed");
    metrics::describe_counter!(
        "extraction_jobs_rejected",
        "Submissions rejected because of load or a full queue"
    );
    metrics::describe_counter!("extraction_pages_failed", "Pages excluded from results");
    metrics::describe_gauge!("extraction_queue_depth", "Jobs waiting for a worker");
    metrics::describe_gauge!("extraction_pool_capacity", "Current page pool size");
    metrics::describe_gauge!("system_cpu_percent", "Last sampled CPU utilization");
    metrics::describe_gauge!("system_memory_percent", "Last sampled memory utilization");

    let pipeline = config.pipeline();
    tracing::info!(work_dir = %pipeline.work_dir.display(), "Preparing work directory");
    std::fs::create_dir_all(&pipeline.work_dir).expect("Failed to create work directory");

    tracing::info!(url = %config.detector_url, "Initializing code decoder client");
    let detector = HttpCodeDetector::new(
        &config.detector_url,
        std::time::Duration::from_secs(config.detector_timeout_secs),
    )
    .expect("Failed to initialize decoder client");

    let collaborators = Collaborators {
        loader: Arc::new(PdfDocumentLoader),
        renderer: Arc::new(PdftoppmRenderer::new(
            &config.renderer_bin,
            pipeline.work_dir.clone(),
        )),
        detector: Arc::new(detector),
        fallback: Some(Arc::new(ContourDetector::default())),
    };

    let service = Arc::new(ExtractionService::new(pipeline, collaborators));
    service.start(SysinfoSampler::new());

    let state = AppState::new(service.clone(), config.max_upload_bytes);
    let app = routes::router(state, Some(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    service.shutdown().await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
