//! Cattle Screening - Batch Entry Point
//!
//! Screens image files for one disease family and prints one JSON report per
//! image on stdout. Images are screened concurrently, bounded by the
//! configured worker count.

use anyhow::{bail, Context, Result};
use cattle_screening::{
    config::{AppConfig, LoggingConfig},
    models::{ModelLoader, ModelRegistry},
    pipeline::PredictionPipeline,
    preprocess::is_supported_image,
    types::{report::ReportStatus, DiseaseFamily, ScreeningReport},
};
use clap::Parser;
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cattle-screen", version, about = "Screen cattle photographs for FMD or LSD")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config/config.toml")]
    config: PathBuf,

    /// Disease family to screen for (anything containing "LSD" selects LSD)
    #[arg(short, long, default_value = "FMD")]
    family: String,

    /// Log at debug level regardless of configuration
    #[arg(short, long)]
    verbose: bool,

    /// Image files or directories of images
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        AppConfig::load_from_path(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        AppConfig::default()
    };

    init_tracing(&config.logging, args.verbose)?;

    info!("Starting cattle screening");
    if !args.config.exists() {
        warn!(path = %args.config.display(), "Configuration file not found, using defaults");
    }

    let family: DiseaseFamily = args.family.parse()?;

    let loader = ModelLoader::with_threads(config.models.onnx_threads)?;
    let registry = ModelRegistry::load(&config, &loader);

    if DiseaseFamily::ALL
        .iter()
        .all(|f| registry.classifier_count(*f) == 0)
    {
        bail!("No classifier could be loaded for any disease family, check model paths");
    }
    if registry.classifier_count(family) == 0 {
        warn!(family = %family, "No models available for the selected family, every image will fail");
    }
    info!(
        family = %family,
        models = ?registry.model_names(family),
        gate = registry.detector().is_some(),
        "Model registry ready"
    );

    let pipeline = Arc::new(PredictionPipeline::new(&config, Arc::new(registry)));

    let inputs = collect_inputs(&args.inputs)?;
    if inputs.is_empty() {
        bail!("No png, jpg or jpeg images found in the given inputs");
    }

    let workers = config.pipeline.workers;
    info!(images = inputs.len(), workers, "Screening images");

    let start_time = Instant::now();
    let mut reports = stream::iter(inputs)
        .map(|path| screen(pipeline.clone(), path, family))
        .buffer_unordered(workers);

    let mut total = 0usize;
    let mut failed = 0usize;
    while let Some(report) = reports.next().await {
        total += 1;
        if report.status == ReportStatus::Failed {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&report)?);
    }

    info!(
        screened = total,
        failed,
        elapsed_ms = start_time.elapsed().as_millis() as u64,
        "Batch complete"
    );
    pipeline.metrics().print_summary();

    if failed == total {
        bail!("All {} images failed screening", total);
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = log_filter(EnvFilter::from_default_env(), level)?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        _ => builder.pretty().init(),
    }

    Ok(())
}

/// Enable `level` for the library and for this binary, whose events are
/// targeted at its own crate name.
fn log_filter(base: EnvFilter, level: &str) -> Result<EnvFilter> {
    Ok(base
        .add_directive(format!("cattle_screening={}", level).parse()?)
        .add_directive(format!("{}={}", module_path!(), level).parse()?))
}

/// Expand directories into their supported image files, sorted by name.
fn collect_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();

    for path in paths {
        if path.is_dir() {
            let mut found: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("Failed to read directory {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && is_supported_image(p))
                .collect();
            found.sort();
            debug!(dir = %path.display(), images = found.len(), "Scanned directory");
            inputs.extend(found);
        } else {
            inputs.push(path.clone());
        }
    }

    Ok(inputs)
}

async fn screen(
    pipeline: Arc<PredictionPipeline>,
    path: PathBuf,
    family: DiseaseFamily,
) -> ScreeningReport {
    let source = source_name(&path);

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(source = %source, error = %e, "Failed to read image");
            return ScreeningReport::failed(source, family, format!("failed to read image: {}", e));
        }
    };

    match tokio::task::spawn_blocking(move || pipeline.predict(&bytes, family)).await {
        Ok(Ok(outcome)) => ScreeningReport::from_outcome(source, family, &outcome),
        Ok(Err(e)) => ScreeningReport::from_error(source, family, &e),
        Err(e) => ScreeningReport::failed(source, family, format!("screening task failed: {}", e)),
    }
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
