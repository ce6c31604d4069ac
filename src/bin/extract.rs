use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use codescan::config::AppConfig;
use codescan::models::api::{SubmitOptions, Submission};
use codescan::models::detection::{CodeContent, DetectionResult};
use codescan::models::job::{JobState, JobView};
use codescan::services::detector::{ContourDetector, HttpCodeDetector};
use codescan::services::document::{PdfDocumentLoader, PdftoppmRenderer};
use codescan::services::monitor::SysinfoSampler;
use codescan::services::pipeline::{Collaborators, ExtractionService};

/// Extract code locations and payloads from a PDF without running the server.
#[derive(Debug, Parser)]
#[command(name = "codescan-extract", version)]
struct Args {
    /// PDF document to scan.
    file: PathBuf,

    /// Code decoding service endpoint.
    #[arg(long, env = "DETECTOR_URL")]
    detector_url: Option<String>,

    /// pdftoppm executable.
    #[arg(long, env = "RENDERER_BIN")]
    renderer: Option<String>,

    /// Pages per batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Job deadline in seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Report low-confidence candidates on pages where nothing decodes.
    #[arg(long)]
    heuristic: bool,

    /// Print the full job as JSON instead of one line per detection.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = AppConfig::from_env()?;
    if let Some(url) = args.detector_url {
        config.detector_url = url;
    }
    if let Some(bin) = args.renderer {
        config.renderer_bin = bin;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    config.heuristic_fallback |= args.heuristic;

    let bytes = tokio::fs::read(&args.file).await?;
    let source = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document.pdf".to_string());

    let pipeline = config.pipeline();
    let collaborators = Collaborators {
        loader: Arc::new(PdfDocumentLoader),
        renderer: Arc::new(PdftoppmRenderer::new(
            &config.renderer_bin,
            pipeline.work_dir.clone(),
        )),
        detector: Arc::new(HttpCodeDetector::new(
            &config.detector_url,
            Duration::from_secs(config.detector_timeout_secs),
        )?),
        fallback: Some(Arc::new(ContourDetector::default())),
    };

    let service = Arc::new(ExtractionService::new(pipeline, collaborators));
    service.start(SysinfoSampler::new());

    let options = SubmitOptions {
        timeout: args.timeout,
        run_async: Some(false),
    };
    let outcome = service.submit(&source, &bytes, options).await;
    service.shutdown().await;

    let view = match outcome? {
        Submission::Finished(view) => view,
        Submission::Accepted(accepted) => {
            return Err(format!("job {} was not awaited", accepted.job_id).into())
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print_view(&view);
    }

    Ok(if view.state == JobState::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_view(view: &JobView) {
    if let Some(error) = &view.error {
        println!("{}: failed ({}): {}", view.source, error.kind, error.message);
        return;
    }
    let Some(report) = &view.result else {
        println!("{}: {}", view.source, view.state);
        return;
    };

    let mut detections: Vec<&DetectionResult> = report.detections.iter().collect();
    detections.sort_by_key(|d| d.page);
    for d in detections {
        println!(
            "page {:>3}  bbox ({:.1}, {:.1})-({:.1}, {:.1})  center ({:.1}, {:.1})  {}",
            d.page,
            d.bbox.x1,
            d.bbox.y1,
            d.bbox.x2,
            d.bbox.y2,
            d.center.x,
            d.center.y,
            describe(&d.content),
        );
    }
    for failure in &report.failed_pages {
        println!("page {:>3}  failed ({}): {}", failure.page, failure.kind, failure.message);
    }
    println!(
        "{}: {} detections on {} pages, {} failed",
        view.source,
        report.detections.len(),
        report.pages_total,
        report.failed_pages.len()
    );
}

fn describe(content: &CodeContent) -> String {
    match content {
        CodeContent::Decoded { data } => data.clone(),
        CodeContent::Undecodable => "[undecodable]".to_string(),
        CodeContent::Heuristic { method, confidence } => format!("[{method}, {confidence} confidence]"),
    }
}
