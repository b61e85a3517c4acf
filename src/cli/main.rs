//! Cutout pipeline CLI
//!
//! Runs a batch through [`PipelineOrchestrator`] on its worker thread and maps
//! Ctrl-C onto the cooperative cancel flag.

use super::config::CliConfigBuilder;
use crate::{
    inference::InferenceServices,
    processor::{ImageStatus, PipelineOrchestrator},
    providers::ProviderKind,
    services::{
        collect_inputs,
        config_store::{ConfigStore, JsonConfigStore},
        BatchSummary, ProgressReporter, ProgressUpdate,
    },
    tracing_config::{events, init_cli_tracing, spans},
};
use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Background removal pipeline for product photos
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "cutout-pipeline")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Input image files or directories (directories are walked recursively)
    #[arg(value_name = "INPUT", required_unless_present_any = &["list_providers", "show_config"])]
    pub input: Vec<PathBuf>,

    /// Output directory [default: PNG directory next to each input]
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Configuration file [default: platform config dir]
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Persist a configuration value before processing (repeatable)
    #[arg(long = "set", value_name = "KEY.PATH=VALUE")]
    pub set: Vec<String>,

    /// Model name or path to an .onnx file [default: isnet-general-use]
    #[arg(short, long)]
    pub model: Option<String>,

    /// Directory holding {name}.onnx model files [default: platform cache dir]
    #[arg(long, value_name = "DIR")]
    pub models_dir: Option<PathBuf>,

    /// Execution provider: auto, cpu, cuda, directml, rocm
    #[arg(short, long, default_value = "auto")]
    pub provider: String,

    /// Hard limit for one inference call, in seconds
    #[arg(long, default_value_t = 300)]
    pub timeout: u64,

    /// Skip alpha matting and use the model mask directly
    #[arg(long)]
    pub no_alpha_matting: bool,

    /// Skip the warm-up inference after loading the model
    #[arg(long)]
    pub no_warm_up: bool,

    /// Only process files whose name matches this glob (e.g. "*.jpg")
    #[arg(long)]
    pub pattern: Option<String>,

    /// Show execution provider availability and exit
    #[arg(long)]
    pub list_providers: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    pub show_config: bool,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _tracing = init_cli_tracing(cli.verbose).context("Failed to initialize tracing")?;

    if cli.list_providers {
        show_provider_diagnostics();
        return Ok(());
    }

    CliConfigBuilder::validate_cli(&cli).context("Invalid CLI arguments")?;

    let store: Arc<dyn ConfigStore> = Arc::new(match &cli.config {
        Some(path) => JsonConfigStore::open(path),
        None => JsonConfigStore::open_default(),
    }
    .context("Failed to open configuration")?);
    CliConfigBuilder::apply_overrides(store.as_ref(), &cli.set)?;

    if cli.show_config {
        println!("{}", serde_json::to_string_pretty(&store.document())?);
        return Ok(());
    }

    let config = CliConfigBuilder::from_cli(&cli)?;
    let files = collect_inputs(&cli.input, cli.pattern.as_deref()).context("Failed to collect inputs")?;
    if files.is_empty() {
        warn!("No supported image files found in the provided inputs");
        return Ok(());
    }
    events::progress(&format!("Found {} image file(s) to process", files.len()), "📁");
    info!("Model: {}, provider: {}", config.model, config.provider);

    let services = inference_services(&cli)?;
    let bar = Arc::new(IndicatifProgressReporter::new(files.len()));
    let orchestrator = PipelineOrchestrator::new(config, services, store.clone())
        .context("Failed to create pipeline")?
        .with_reporter(bar.clone());

    let handle = orchestrator.spawn(files).context("Failed to start batch")?;
    let cancel = handle.cancel_handle();
    let batch = tokio::task::spawn_blocking(move || handle.join());
    tokio::pin!(batch);

    let summary = loop {
        tokio::select! {
            joined = &mut batch => break joined.context("Batch task failed")??,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    events::error_with_context(&e, "listening for Ctrl-C");
                    break (&mut batch).await.context("Batch task failed")??;
                }
                if !cancel.is_cancelled() {
                    warn!("⏹️ Cancel requested, stopping after the current stage");
                    cancel.request_cancel();
                }
            },
        }
    };

    let show_stats = store
        .get("app.show_success_stats")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    report_summary(&summary, show_stats);

    if summary.failed() > 0 {
        anyhow::bail!("{} of {} image(s) failed", summary.failed(), summary.outcomes.len());
    }
    Ok(())
}

#[cfg(feature = "onnx")]
fn inference_services(cli: &Cli) -> Result<InferenceServices> {
    InferenceServices::onnx(cli.models_dir.clone()).context("Failed to set up ONNX Runtime")
}

#[cfg(not(feature = "onnx"))]
fn inference_services(_cli: &Cli) -> Result<InferenceServices> {
    anyhow::bail!("No inference backend compiled in; rebuild with --features onnx")
}

/// Display execution provider availability
fn show_provider_diagnostics() {
    println!("🔍 Execution Provider Diagnostics");
    let cpu_count = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    println!("💻 System: {cpu_count} CPU cores detected");

    println!("\n🚀 Execution Providers (probe order):");
    #[cfg(feature = "onnx")]
    for (kind, available, description) in crate::backends::describe_providers() {
        let status = if available { "✅ Available" } else { "❌ Not Available" };
        println!("  • {kind} ({}): {status} - {description}", kind.ort_name());
    }
    #[cfg(not(feature = "onnx"))]
    println!("  • {}: ✅ Available - no accelerated backend compiled in", ProviderKind::Cpu);

    println!("\n📋 Notes:");
    println!("  • GPU providers are only used after a probe inference confirms them");
    println!("  • {} is always available as the fallback", ProviderKind::Cpu.ort_name());
}

fn report_summary(summary: &BatchSummary, show_stats: bool) {
    let _span = spans::batch(summary.outcomes.len()).entered();
    for outcome in &summary.outcomes {
        let name = file_label(&outcome.source_path);
        match &outcome.status {
            ImageStatus::Completed => {
                if let Some(notice) = &outcome.model_notice {
                    events::warning_with_recommendation(
                        &format!("{name}: {notice}"),
                        "place the requested model in the models directory or pass --model",
                    );
                }
                for skipped in &outcome.skipped {
                    warn!("{name}: {} skipped ({})", skipped.stage, skipped.reason);
                }
            },
            ImageStatus::Failed { stage, reason, .. } => {
                error!("❌ {name}: failed during {stage}: {reason}");
            },
            ImageStatus::Cancelled { .. } => info!("⏹️ {name}: cancelled"),
        }
    }

    if show_stats {
        info!(
            "✅ {} completed, {} failed, {} cancelled in {:.2}s",
            summary.completed(),
            summary.failed(),
            summary.cancelled(),
            summary.elapsed.as_secs_f64()
        );
    }
    let file_count = summary.outcomes.len();
    events::performance_metric(
        "batch",
        summary.elapsed.as_millis() as u64,
        Some(&[("files", &file_count as &dyn std::fmt::Display)]),
    );
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Progress bar over files with the current stage as message
struct IndicatifProgressReporter {
    bar: ProgressBar,
}

impl IndicatifProgressReporter {
    fn new(file_count: usize) -> Self {
        let bar = ProgressBar::new(file_count as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }
}

impl ProgressReporter for IndicatifProgressReporter {
    fn on_progress(&self, update: ProgressUpdate) {
        let name = update.image_path.as_deref().map(file_label).unwrap_or_default();
        self.bar.set_message(format!("{name}: {}", update.description));
    }

    fn on_file_completed(&self, _image_path: &Path) {
        self.bar.inc(1);
    }

    fn on_finished(&self, elapsed_seconds: f64, file_count: usize) {
        self.bar
            .finish_with_message(format!("{file_count} file(s) in {elapsed_seconds:.1}s"));
    }
}
