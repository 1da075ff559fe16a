//! Background removal command-line tool

use super::config::{CliConfigBuilder, CliSettings};
use crate::{
    config::CompositeRequest,
    processor::{DefaultBackendFactory, PipelineController},
    services::{ConsoleProgressReporter, ImageIOService},
    tracing_config::{file_span, session_span, TracingConfig, TracingFormat},
    types::RemovalResult,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use walkdir::WalkDir;

/// Remove image backgrounds with a semantic segmentation model
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "bgremover")]
pub struct Cli {
    /// Input images or directories (use "-" for stdin)
    #[arg(value_name = "INPUT", required_unless_present = "list_providers")]
    pub input: Vec<String>,

    /// Output file (single input) or directory (several inputs). Use "-" for stdout.
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<String>,

    /// ONNX segmentation model
    #[arg(short, long, value_name = "MODEL")]
    pub model: Option<PathBuf>,

    /// JSON tensor contract, overriding any <model>.json side-car
    #[arg(long, value_name = "JSON")]
    pub contract: Option<PathBuf>,

    /// Inference backend
    #[arg(short, long, value_enum, default_value_t = CliBackend::Onnx)]
    pub backend: CliBackend,

    /// Execution provider for the onnx backend (auto, cpu, cuda, coreml)
    #[arg(short, long, default_value = "auto")]
    pub execution_provider: String,

    /// Fill the background with a colour (#RRGGBB or #RRGGBBAA)
    #[arg(long, value_name = "HEX", conflicts_with = "background_image")]
    pub color: Option<String>,

    /// Replace the background with this image
    #[arg(long, value_name = "IMAGE")]
    pub background_image: Option<PathBuf>,

    /// Edge feathering radius in pixels (0 = hard edges)
    #[arg(long, default_value_t = 0)]
    pub feather: u32,

    /// Foreground probability cut-off
    #[arg(long, default_value_t = crate::config::DEFAULT_THRESHOLD)]
    pub threshold: f32,

    /// Number of threads (0 = auto-detect)
    #[arg(short, long, default_value_t = 0)]
    pub threads: usize,

    /// Per-image timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Also write the mask as <output>.mask.png
    #[arg(long)]
    pub save_mask: bool,

    /// Descend into subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// Enable verbose logging (-v: INFO, -vv: DEBUG, -vvv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log output format
    #[arg(long, value_enum, default_value_t = CliLogFormat::Console)]
    pub log_format: CliLogFormat,

    /// Show backend and execution provider diagnostics and exit
    #[arg(long)]
    pub list_providers: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliBackend {
    Onnx,
    Tract,
    Mock,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum CliLogFormat {
    Console,
    Compact,
    #[cfg(feature = "tracing-json")]
    Json,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let session_id = uuid::Uuid::new_v4().to_string();

    init_tracing(&cli, &session_id).context("Failed to initialize tracing")?;

    if cli.list_providers {
        show_provider_diagnostics();
        return Ok(());
    }

    let settings = CliConfigBuilder::from_cli(&cli).context("Invalid arguments")?;
    let session = session_span(
        &session_id,
        &settings.model_spec.source.display_name(),
        &settings.backend_type.to_string(),
    );

    let controller = build_controller(&cli, &settings)?;
    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let start = Instant::now();
    let processed = process_inputs(&cli, &controller, &settings.request, &cancel)
        .instrument(session)
        .await?;
    info!(
        "Processed {} image(s) in {:.2}s",
        processed,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn init_tracing(cli: &Cli, session_id: &str) -> Result<()> {
    let format = match cli.log_format {
        CliLogFormat::Console => TracingFormat::Console,
        CliLogFormat::Compact => TracingFormat::Compact,
        #[cfg(feature = "tracing-json")]
        CliLogFormat::Json => TracingFormat::Json,
    };
    let mut config = TracingConfig::new()
        .with_verbosity(cli.verbose)
        .with_format(format)
        .with_session_id(session_id);
    if let Ok(filter) = std::env::var("RUST_LOG") {
        config = config.with_env_filter(filter);
    }
    config.init()
}

fn build_controller(cli: &Cli, settings: &CliSettings) -> Result<Arc<PipelineController>> {
    let mut controller = PipelineController::from_spec(
        &settings.model_spec,
        settings.backend_type,
        settings.removal_config.clone(),
        &DefaultBackendFactory,
    )
    .context("Failed to create segmentation pipeline")?;

    if cli.verbose > 0 {
        controller =
            controller.with_progress_reporter(Arc::new(ConsoleProgressReporter::new(cli.verbose > 1)));
    }

    if let Some(load_time) = controller.warm_up().context("Failed to load model")? {
        info!("Model ready in {}ms", load_time.as_millis());
    }
    Ok(Arc::new(controller))
}

/// First Ctrl-C cancels at the next stage boundary
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current stage");
            cancel.cancel();
        }
    });
}

fn show_provider_diagnostics() {
    let factory = DefaultBackendFactory;
    let cores = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
    println!("System: {cores} CPU cores");

    println!("\nBackends:");
    for backend in crate::processor::BackendFactory::available_backends(&factory) {
        println!("  {backend}");
    }

    #[cfg(feature = "onnx")]
    {
        println!("\nONNX Runtime execution providers:");
        for (name, available, description) in crate::backends::OnnxBackend::list_providers() {
            let status = if available { "available" } else { "unavailable" };
            println!("  {name}: {status} - {description}");
        }
    }

    #[cfg(feature = "tract")]
    {
        println!("\nTract execution providers:");
        for (name, available, description) in crate::backends::TractBackend::list_providers() {
            let status = if available { "available" } else { "unavailable" };
            println!("  {name}: {status} - {description}");
        }
    }
}

async fn process_inputs(
    cli: &Cli,
    controller: &Arc<PipelineController>,
    request: &CompositeRequest,
    cancel: &CancellationToken,
) -> Result<usize> {
    if cli.input.len() == 1 && cli.input.first().is_some_and(|s| s == "-") {
        return process_stdin(cli, controller, request, cancel).await;
    }

    let mut files = Vec::new();
    for input in &cli.input {
        let path = PathBuf::from(input);
        if path.is_file() {
            if ImageIOService::is_supported_format(&path) {
                files.push(path);
            } else {
                warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            files.extend(find_image_files(&path, cli.recursive)?);
        } else {
            anyhow::bail!(
                "Input path does not exist or is not accessible: {}",
                path.display()
            );
        }
    }

    if files.is_empty() {
        warn!("No supported images found in the provided inputs");
        return Ok(0);
    }
    files.sort();

    let output_dir = prepare_output_dir(cli.output.as_deref(), files.len())?;
    let progress = batch_progress_bar(files.len())?;
    let mut processed = 0;
    let mut failed = 0;

    for input in &files {
        if cancel.is_cancelled() {
            warn!("Skipping remaining {} file(s)", files.len() - processed - failed);
            break;
        }

        let output = match (&output_dir, cli.output.as_deref()) {
            (Some(dir), _) => output_path_in(dir, input),
            (None, Some(target)) => PathBuf::from(target),
            (None, None) => default_output_path(input),
        };

        if let Some(pb) = &progress {
            pb.set_message(format!("Processing {}", input.display()));
        }

        match process_file(controller, input, &output, request, cancel, cli.save_mask)
            .instrument(file_span(input))
            .await
        {
            Ok(result) => {
                processed += 1;
                info!(
                    "{} -> {} ({})",
                    input.display(),
                    output.display(),
                    result.timing_summary()
                );
            },
            Err(e) => {
                failed += 1;
                error!("Failed to process {}: {e:#}", input.display());
            },
        }

        if let Some(pb) = &progress {
            pb.inc(1);
        }
    }

    if let Some(pb) = progress {
        pb.finish_with_message(format!("Completed! Processed: {processed}, Failed: {failed}"));
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} file(s) failed", files.len());
    }
    Ok(processed)
}

async fn process_file(
    controller: &Arc<PipelineController>,
    input: &Path,
    output: &Path,
    request: &CompositeRequest,
    cancel: &CancellationToken,
    save_mask: bool,
) -> Result<RemovalResult> {
    let image = ImageIOService::load_image(input)
        .with_context(|| format!("Failed to load {}", input.display()))?;
    let result = controller
        .process_async(image, request.clone(), cancel.clone())
        .await
        .context("Failed to remove background")?;

    ImageIOService::save_png(&result.image, output)
        .with_context(|| format!("Failed to save {}", output.display()))?;
    if save_mask {
        let mask_path = output.with_extension("mask.png");
        result
            .mask
            .save_png(&mask_path)
            .with_context(|| format!("Failed to save mask {}", mask_path.display()))?;
    }
    Ok(result)
}

async fn process_stdin(
    cli: &Cli,
    controller: &Arc<PipelineController>,
    request: &CompositeRequest,
    cancel: &CancellationToken,
) -> Result<usize> {
    let data = read_stdin()?;
    let image = ImageIOService::load_from_bytes(&data).context("Failed to decode stdin")?;
    let result = controller
        .process_async(image, request.clone(), cancel.clone())
        .await
        .context("Failed to remove background")?;

    match cli.output.as_deref() {
        None | Some("-") => write_stdout(&result.to_png_bytes()?)?,
        Some(target) => ImageIOService::save_png(&result.image, target)
            .with_context(|| format!("Failed to save {target}"))?,
    }
    Ok(1)
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    io::stdin()
        .read_to_end(&mut buffer)
        .context("Failed to read from stdin")?;
    if buffer.is_empty() {
        anyhow::bail!("No data received from stdin");
    }
    Ok(buffer)
}

fn write_stdout(data: &[u8]) -> Result<()> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(data).context("Failed to write to stdout")?;
    stdout.flush().context("Failed to flush stdout")?;
    Ok(())
}

/// Bar on stderr for multi-file runs; indicatif hides it when stderr is not a terminal
fn batch_progress_bar(file_count: usize) -> Result<Option<ProgressBar>> {
    if file_count < 2 {
        return Ok(None);
    }
    let pb = ProgressBar::new(file_count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    Ok(Some(pb))
}

fn prepare_output_dir(output: Option<&str>, file_count: usize) -> Result<Option<PathBuf>> {
    if file_count < 2 {
        return Ok(None);
    }
    let Some(output) = output else {
        return Ok(None);
    };
    if output == "-" {
        anyhow::bail!("Cannot use stdout (-) as output when processing multiple files");
    }
    let dir = PathBuf::from(output);
    if dir.is_file() {
        anyhow::bail!(
            "Output path exists and is a file, not a directory: {}",
            dir.display()
        );
    }
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
    Ok(Some(dir))
}

/// Supported images under `dir`; symlinks are not followed
fn find_image_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(max_depth) {
        let entry = entry.with_context(|| format!("Failed to read {}", dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_file()
            && ImageIOService::is_supported_format(path)
            && !is_own_output(path)
        {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

/// Outputs written next to their inputs by an earlier run
fn is_own_output(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .is_some_and(|stem| stem.ends_with("_no_bg") || stem.ends_with(".mask"))
}

fn default_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    input.with_file_name(format!("{stem}_no_bg.png"))
}

fn output_path_in(dir: &Path, input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    dir.join(format!("{stem}_no_bg.png"))
}
