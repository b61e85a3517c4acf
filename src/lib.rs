#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]

//! # Cutout Pipeline
//!
//! Batch background removal for product photography. Each image runs through a
//! fixed sequence of stages: normalize, prepare the model, run segmentation with
//! alpha matting, adjust mask levels, then optionally crop, add a solid
//! background and export a JPG.
//!
//! ## Features
//!
//! - **Provider selection**: GPU execution providers are used only after a probe
//!   inference confirms them; CPU is always the fallback
//! - **Session fallback chain**: requested name, then model path, then a small
//!   family of known-safe models, with a notice whenever a substitute is used
//! - **Alpha matting retries**: progressively relaxed parameters, then the plain
//!   model mask as a last resort
//! - **Numeric transforms**: levels adjustment, content bounds with smart margins
//!   and solid-colour compositing
//! - **Artifact lifecycle**: intermediate masks are removed once no stage needs
//!   them, unless the user asked to keep them
//! - **Cancellation and timeouts**: a cooperative cancel flag checked between
//!   stages and a hard timeout around every inference call
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cutout_pipeline::{
//!     InferenceServices, JsonConfigStore, OrchestratorConfig, PipelineOrchestrator,
//! };
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! # fn example() -> anyhow::Result<()> {
//! let store = Arc::new(JsonConfigStore::open_default()?);
//! let services = InferenceServices::onnx(None)?;
//! let mut orchestrator =
//!     PipelineOrchestrator::new(OrchestratorConfig::default(), services, store)?;
//!
//! let summary = orchestrator.run_batch(&[PathBuf::from("shoe.jpg")]);
//! println!("{} completed, {} failed", summary.completed(), summary.failed());
//! # Ok(())
//! # }
//! ```
//!
//! ### Feature Flags
//!
//! - `onnx` (default): ONNX Runtime sessions and provider probing
//! - `directml`, `rocm`: additional ONNX Runtime execution providers
//! - `cli` (default): command-line interface, progress bar and tracing setup
//! - `tracing-json`, `tracing-files`: extra tracing outputs for the CLI
//! - `webp-support` (default): WebP input decoding

pub mod backends;
pub mod cleanup;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod inference;
pub mod matting;
pub mod processor;
pub mod providers;
pub mod services;
pub mod session;
#[cfg(feature = "cli")]
pub mod tracing_config;
pub mod transforms;
pub mod utils;

// Public API exports
pub use backends::*;
pub use cleanup::{ArtifactLifecycleCoordinator, CleanupState};
pub use config::{AppConfig, ConfigSnapshot, OrchestratorConfig, OrchestratorConfigBuilder};
pub use error::{ErrorClass, PipelineError, Result};
pub use inference::{InferenceContext, InferenceServices};
pub use matting::{
    AlphaMattingParams, AlphaMattingRetryEngine, CutoutImage, GuidedFilterMatting, MattingBackend,
    MattingStatus,
};
pub use processor::{
    BatchHandle, CancelHandle, ImageStatus, JobOutcome, PipelineOrchestrator, SkippedStage,
    StageRecord,
};
pub use providers::{
    ProbeReport, ProviderKind, ProviderPreference, ProviderProbe, ProviderSelection,
    ProviderSelector,
};
pub use services::{
    ArtifactKind, BatchSummary, ChannelProgressReporter, ConfigStore, ConsoleProgressReporter,
    JsonConfigStore, MemoryConfigStore, NoOpProgressReporter, PipelineStage, ProgressEvent,
    ProgressReporter, ProgressUpdate,
};
pub use session::{ModelSelector, ModelStore, Session, SessionChain, SessionFactory, SessionNotice};
pub use transforms::{ContentBounds, LevelsParams};

#[cfg(feature = "cli")]
pub use tracing_config::{events, init_cli_tracing, spans, TracingConfig, TracingFormat, TracingOutput};
