//! Pipeline orchestrator
//!
//! [`PipelineOrchestrator`] drives each input image through
//! `Normalized → ModelPrepared → CutoutGenerated → LevelsAdjusted → (Cropped) →
//! (SolidBackgroundApplied) → (JpgExported) → Completed`, one image at a time.
//!
//! - A cooperative cancel flag is checked between stages only; a running stage
//!   always finishes.
//! - Inference runs on a short-lived worker thread with a bounded wait. A worker
//!   that exceeds the timeout is abandoned, not killed: it keeps running until the
//!   backend returns and its result is dropped.
//! - Failure of an optional stage keeps the pre-stage artifact as the output. Once
//!   the cutout exists, every outcome reports a usable output path.

use crate::cleanup::ArtifactLifecycleCoordinator;
use crate::config::{ConfigSnapshot, OrchestratorConfig};
use crate::error::{ErrorClass, PipelineError, Result};
use crate::inference::{InferenceContext, InferenceServices};
use crate::matting::{
    cutout_from_alpha, AlphaMattingRetryEngine, CutoutImage, MattingBackend, MattingStatus,
};
use crate::providers::ProviderKind;
use crate::services::config_store::ConfigStore;
use crate::services::format::JpgExporter;
use crate::services::io::{resolve_output_dir, ArtifactKind, ArtifactNaming, ImageIOService};
use crate::services::progress::{
    BatchSummary, NoOpProgressReporter, PipelineStage, ProgressReporter, ProgressTracker,
};
use crate::session::{Session, SessionNotice};
use crate::transforms::{add_solid_background, adjust_mask_levels, crop_bounds};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use instant::{Duration, Instant};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info_span, instrument};

/// Shared cooperative cancel flag
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the batch to stop at the next stage boundary
    pub fn request_cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag so the orchestrator can run another batch
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// A file produced or consumed by a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: ArtifactKind,
    pub created_by_job: usize,
}

/// One completed stage of a job
#[derive(Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub stage: PipelineStage,
    /// Files written by the stage that are still on disk
    pub artifacts: Vec<Artifact>,
    pub elapsed: Duration,
}

/// Optional stage that did not produce its artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedStage {
    pub stage: PipelineStage,
    pub reason: String,
}

/// Terminal state of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageStatus {
    Completed,
    Failed {
        /// Stage that was running when the failure happened
        stage: PipelineStage,
        reason: String,
        class: ErrorClass,
        timed_out: bool,
    },
    Cancelled {
        /// Last stage that completed before the cancel was observed
        after: Option<PipelineStage>,
    },
}

/// Everything known about one image after the pipeline
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: usize,
    pub source_path: PathBuf,
    pub status: ImageStatus,
    pub stage_results: Vec<StageRecord>,
    pub skipped: Vec<SkippedStage>,
    /// Most downstream artifact written (JPG, solid background, transparent, raw cutout)
    pub final_output: Option<PathBuf>,
    pub provider: Option<ProviderKind>,
    pub model: Option<String>,
    pub model_notice: Option<SessionNotice>,
    pub matting: Option<MattingStatus>,
    pub elapsed: Duration,
}

impl JobOutcome {
    /// First artifact of `kind`
    #[must_use]
    pub fn artifact(&self, kind: ArtifactKind) -> Option<&Artifact> {
        self.stage_results
            .iter()
            .flat_map(|r| r.artifacts.iter())
            .find(|a| a.kind == kind)
    }

    /// Stages that completed, in order
    #[must_use]
    pub fn completed_stages(&self) -> Vec<PipelineStage> {
        self.stage_results.iter().map(|r| r.stage).collect()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == ImageStatus::Completed
    }
}

/// One input image traversing the pipeline
#[derive(Debug)]
struct Job {
    id: usize,
    source_path: PathBuf,
    stem: String,
    output_dir: PathBuf,
    naming: ArtifactNaming,
    snapshot: ConfigSnapshot,
    stage_results: Vec<StageRecord>,
    skipped: Vec<SkippedStage>,
    started_at: Instant,
    stage_started: Instant,
    /// Set once an adjusted mask exists, so terminal paths run the final cleanup
    adjusted_mask: Option<PathBuf>,
}

impl Job {
    fn new(id: usize, source_path: &Path, output_dir: PathBuf, snapshot: ConfigSnapshot) -> Self {
        let stem = source_path
            .file_stem()
            .map_or_else(|| format!("image_{id}"), |s| s.to_string_lossy().into_owned());
        let now = Instant::now();
        Self {
            id,
            source_path: source_path.to_path_buf(),
            stem,
            output_dir,
            naming: ArtifactNaming::now(),
            snapshot,
            stage_results: Vec::new(),
            skipped: Vec::new(),
            started_at: now,
            stage_started: now,
            adjusted_mask: None,
        }
    }

    fn path_for(&self, kind: ArtifactKind) -> PathBuf {
        self.naming.path_for(&self.output_dir, &self.stem, kind)
    }

    fn record(&mut self, stage: PipelineStage, artifacts: Vec<(PathBuf, ArtifactKind)>) {
        let now = Instant::now();
        let id = self.id;
        self.stage_results.push(StageRecord {
            stage,
            artifacts: artifacts
                .into_iter()
                .map(|(path, kind)| Artifact {
                    path,
                    kind,
                    created_by_job: id,
                })
                .collect(),
            elapsed: now.duration_since(self.stage_started),
        });
        self.stage_started = now;
    }

    /// Drop records of files that were deleted
    fn forget(&mut self, kinds: &[ArtifactKind]) {
        for record in &mut self.stage_results {
            record.artifacts.retain(|a| !kinds.contains(&a.kind));
        }
    }

    fn skip(&mut self, stage: PipelineStage, error: &PipelineError) {
        tracing::warn!(%stage, %error, "optional stage skipped, keeping previous output");
        self.skipped.push(SkippedStage {
            stage,
            reason: error.to_string(),
        });
        self.stage_started = Instant::now();
    }

    fn last_stage(&self) -> Option<PipelineStage> {
        self.stage_results.last().map(|r| r.stage)
    }

    fn final_output(&self) -> Option<PathBuf> {
        [
            ArtifactKind::Jpg,
            ArtifactKind::SolidBackground,
            ArtifactKind::Cropped,
            ArtifactKind::Transparent,
            ArtifactKind::RawCutout,
        ]
        .into_iter()
        .find_map(|kind| {
            self.stage_results
                .iter()
                .flat_map(|r| r.artifacts.iter())
                .find(|a| a.kind == kind)
                .map(|a| a.path.clone())
        })
    }
}

/// Why a job left the happy path
enum Interrupt {
    Cancelled,
    Failed(PipelineStage, PipelineError),
}

/// Cached result of the once-per-batch inference setup
enum ContextState {
    Ready(InferenceContext),
    Failed { requested: String, attempts: usize },
}

/// Sequential batch processor
pub struct PipelineOrchestrator {
    config: OrchestratorConfig,
    services: InferenceServices,
    config_store: Arc<dyn ConfigStore>,
    coordinator: Arc<ArtifactLifecycleCoordinator>,
    matting: AlphaMattingRetryEngine,
    reporter: Arc<dyn ProgressReporter>,
    cancel: CancelHandle,
    context: Option<ContextState>,
}

impl fmt::Debug for PipelineOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOrchestrator")
            .field("config", &self.config)
            .field("matting", &self.matting)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl PipelineOrchestrator {
    /// Orchestrator reading a fresh config snapshot from `config_store` per image
    ///
    /// # Errors
    /// - `config` fails validation
    pub fn new(
        config: OrchestratorConfig,
        services: InferenceServices,
        config_store: Arc<dyn ConfigStore>,
    ) -> Result<Self> {
        config.validate()?;
        let matting = AlphaMattingRetryEngine::default().enabled(config.alpha_matting);
        Ok(Self {
            config,
            services,
            config_store,
            coordinator: Arc::new(ArtifactLifecycleCoordinator::new()),
            matting,
            reporter: Arc::new(NoOpProgressReporter),
            cancel: CancelHandle::new(),
            context: None,
        })
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replace the alpha matting backend (matting stays on/off per config)
    #[must_use]
    pub fn with_matting_backend(mut self, backend: Arc<dyn MattingBackend>) -> Self {
        self.matting = AlphaMattingRetryEngine::new(backend).enabled(self.config.alpha_matting);
        self
    }

    /// Share a cleanup coordinator with other components
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<ArtifactLifecycleCoordinator>) -> Self {
        self.coordinator = coordinator;
        self
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    #[must_use]
    pub fn coordinator(&self) -> Arc<ArtifactLifecycleCoordinator> {
        self.coordinator.clone()
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Inference context, once the first image has created it
    #[must_use]
    pub fn inference_context(&self) -> Option<&InferenceContext> {
        match &self.context {
            Some(ContextState::Ready(context)) => Some(context),
            _ => None,
        }
    }

    /// Run the batch on a dedicated worker thread
    ///
    /// # Errors
    /// - The worker thread could not be spawned
    pub fn spawn(self, inputs: Vec<PathBuf>) -> Result<BatchHandle> {
        let cancel = self.cancel.clone();
        let mut orchestrator = self;
        let handle = std::thread::Builder::new()
            .name("cutout-pipeline".to_string())
            .spawn(move || orchestrator.run_batch(&inputs))
            .map_err(|e| PipelineError::internal(format!("failed to spawn pipeline worker: {e}")))?;
        Ok(BatchHandle { handle, cancel })
    }

    /// Process `inputs` in order; a failing image never stops the batch
    #[instrument(skip(self, inputs), fields(files = inputs.len()))]
    pub fn run_batch(&mut self, inputs: &[PathBuf]) -> BatchSummary {
        tracing::info!(files = inputs.len(), "starting batch");
        let mut tracker = ProgressTracker::new(self.reporter.clone(), inputs.len());
        let mut outcomes = Vec::with_capacity(inputs.len());

        for (index, path) in inputs.iter().enumerate() {
            if self.cancel.is_cancelled() {
                outcomes.push(Self::not_started(index, path));
                continue;
            }
            tracker.begin_image(index, path);
            let outcome = self.process_image(index, path, &mut tracker);
            if let ImageStatus::Failed { reason, .. } = &outcome.status {
                tracker.report_error(reason);
            }
            tracker.file_completed();
            outcomes.push(outcome);
        }

        let swept = self.coordinator.process_pending_cleanup();
        if swept > 0 {
            tracing::debug!(swept, "end-of-batch cleanup sweep");
        }

        let elapsed = tracker.finish(inputs.len());
        let summary = BatchSummary { outcomes, elapsed };
        tracing::info!(
            completed = summary.completed(),
            failed = summary.failed(),
            cancelled = summary.cancelled(),
            elapsed_ms = elapsed.as_millis(),
            "batch finished"
        );
        summary
    }

    /// Run one image through every enabled stage
    pub fn process_image(&mut self, index: usize, path: &Path, tracker: &mut ProgressTracker) -> JobOutcome {
        let _span = info_span!("image", index, path = %path.display()).entered();

        let snapshot = match self.config_store.snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let output_dir = resolve_output_dir(path, self.config.output_dir.as_deref());
                let mut job = Job::new(index, path, output_dir, ConfigSnapshot::default());
                return self.finish_job(&mut job, Err(Interrupt::Failed(PipelineStage::Normalized, e)), None, tracker);
            },
        };
        self.coordinator.bind_snapshot(path, snapshot.clone());

        let output_dir = resolve_output_dir(path, self.config.output_dir.as_deref());
        let mut job = Job::new(index, path, output_dir, snapshot);
        let mut cutout = None;
        let result = self.run_stages(&mut job, &mut cutout, tracker);
        self.finish_job(&mut job, result, cutout, tracker)
    }

    fn run_stages(
        &mut self,
        job: &mut Job,
        cutout_slot: &mut Option<CutoutImage>,
        tracker: &mut ProgressTracker,
    ) -> std::result::Result<(), Interrupt> {
        // Normalized
        self.checkpoint()?;
        tracker.report_stage(PipelineStage::Normalized);
        let image = {
            let _stage = info_span!("stage", stage = "normalize").entered();
            ImageIOService::load_image(&job.source_path)
                .map(|img| img.to_rgb8())
                .map_err(|e| Interrupt::Failed(PipelineStage::Normalized, e))?
        };
        let source = job.source_path.clone();
        job.record(
            PipelineStage::Normalized,
            vec![(source, ArtifactKind::OriginalNormalized)],
        );

        // ModelPrepared
        self.checkpoint()?;
        let session = self.ensure_context(tracker)?;
        job.record(PipelineStage::ModelPrepared, Vec::new());

        // Inference and CutoutGenerated
        self.checkpoint()?;
        tracker.report_stage_with_description(
            PipelineStage::Inference,
            format!("Removing background ({})", session.provider()),
        );
        let cutout = match self.run_inference(&image, session) {
            Ok(cutout) => cutout,
            Err(e) => {
                if e.is_timeout() {
                    self.discard_timed_out_context();
                }
                return Err(Interrupt::Failed(PipelineStage::Inference, e));
            },
        };
        tracker.report_stage_with_description(PipelineStage::InferenceCompleted, cutout.matting.describe());
        // A cancel during inference lets it finish but skips everything after it
        self.checkpoint()?;

        tracker.report_stage(PipelineStage::CutoutGenerated);
        self.write_cutout(job, &cutout)
            .map_err(|e| Interrupt::Failed(PipelineStage::CutoutGenerated, e))?;
        let alpha = cutout.alpha.clone();
        *cutout_slot = Some(cutout);

        // LevelsAdjusted
        self.checkpoint()?;
        tracker.report_stage(PipelineStage::LevelsAdjusting);
        let mut transparent = self
            .adjust_levels(job, &image, &alpha)
            .map_err(|e| Interrupt::Failed(PipelineStage::LevelsAdjusted, e))?;
        tracker.report_stage(PipelineStage::LevelsAdjusted);

        // Cropped
        if job.snapshot.crop_enabled {
            self.checkpoint()?;
            match self.crop(job, &transparent) {
                Ok(Some(cropped)) => {
                    transparent = cropped;
                    tracker.report_stage(PipelineStage::Cropped);
                },
                Ok(None) => {},
                Err(e) => job.skip(PipelineStage::Cropped, &e),
            }
        }

        // SolidBackgroundApplied
        let mut jpg_source = None;
        if job.snapshot.solid_bg_enabled {
            self.checkpoint()?;
            match self.solid_background(job, &transparent) {
                Ok(composited) => {
                    jpg_source = Some(composited);
                    tracker.report_stage(PipelineStage::SolidBackgroundApplied);
                },
                Err(e) => job.skip(PipelineStage::SolidBackgroundApplied, &e),
            }
        }

        // JpgExported
        if job.snapshot.jpg_export_enabled {
            self.checkpoint()?;
            let source = jpg_source.as_ref().unwrap_or(&transparent);
            match self.export_jpg(job, source) {
                Ok(()) => tracker.report_stage(PipelineStage::JpgExported),
                Err(e) => job.skip(PipelineStage::JpgExported, &e),
            }
        }

        Ok(())
    }

    fn finish_job(
        &self,
        job: &mut Job,
        result: std::result::Result<(), Interrupt>,
        cutout: Option<CutoutImage>,
        tracker: &mut ProgressTracker,
    ) -> JobOutcome {
        let status = match result {
            Ok(()) => {
                tracker.report_stage(PipelineStage::Completed);
                job.record(PipelineStage::Completed, Vec::new());
                tracing::info!(
                    elapsed_ms = job.started_at.elapsed().as_millis(),
                    skipped = job.skipped.len(),
                    "image completed"
                );
                ImageStatus::Completed
            },
            Err(Interrupt::Cancelled) => {
                tracker.report_stage(PipelineStage::Cancelled);
                tracing::info!(after = ?job.last_stage(), "image cancelled");
                ImageStatus::Cancelled {
                    after: job.last_stage(),
                }
            },
            Err(Interrupt::Failed(stage, error)) => {
                tracker.report_stage_with_description(PipelineStage::Failed, error.to_string());
                tracing::error!(%stage, %error, class = ?error.class(), "image failed");
                ImageStatus::Failed {
                    stage,
                    reason: error.to_string(),
                    class: error.class(),
                    timed_out: error.is_timeout(),
                }
            },
        };

        // Nothing downstream runs after a terminal state, so masks go now
        if job.adjusted_mask.is_some() {
            self.coordinator.final_cleanup_for(&job.source_path);
        } else {
            self.coordinator.release_image(&job.source_path);
        }

        let (provider, model, matting) = match cutout {
            Some(c) => (Some(c.provider), Some(c.model_name), Some(c.matting)),
            None => (None, None, None),
        };
        let model_notice = self
            .inference_context()
            .and_then(InferenceContext::notice)
            .cloned();

        JobOutcome {
            job_id: job.id,
            source_path: job.source_path.clone(),
            status,
            final_output: job.final_output(),
            stage_results: std::mem::take(&mut job.stage_results),
            skipped: std::mem::take(&mut job.skipped),
            provider,
            model,
            model_notice,
            matting,
            elapsed: job.started_at.elapsed(),
        }
    }

    fn not_started(index: usize, path: &Path) -> JobOutcome {
        JobOutcome {
            job_id: index,
            source_path: path.to_path_buf(),
            status: ImageStatus::Cancelled { after: None },
            stage_results: Vec::new(),
            skipped: Vec::new(),
            final_output: None,
            provider: None,
            model: None,
            model_notice: None,
            matting: None,
            elapsed: Duration::ZERO,
        }
    }

    fn checkpoint(&self) -> std::result::Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Session for this batch, creating the inference context on first use
    fn ensure_context(&mut self, tracker: &mut ProgressTracker) -> std::result::Result<Arc<dyn Session>, Interrupt> {
        if self.context.is_none() {
            let _stage = info_span!("stage", stage = "prepare_model").entered();
            tracker.report_stage(PipelineStage::ModelPrepared);
            let preparation = InferenceContext::prepare_model(&self.services, &self.config);
            tracker.report_stage(PipelineStage::SessionLoaded);
            let state = match InferenceContext::load(&self.services, &self.config, preparation) {
                Ok(context) => {
                    if let Some(notice) = context.notice() {
                        tracing::warn!(%notice, "model substituted");
                    }
                    ContextState::Ready(context)
                },
                Err(PipelineError::SessionExhausted {
                    requested,
                    attempts,
                }) => ContextState::Failed {
                    requested,
                    attempts,
                },
                Err(e) => return Err(Interrupt::Failed(PipelineStage::ModelPrepared, e)),
            };
            self.context = Some(state);
        }

        match &self.context {
            Some(ContextState::Ready(context)) => Ok(context.session()),
            Some(ContextState::Failed {
                requested,
                attempts,
            }) => Err(Interrupt::Failed(
                PipelineStage::ModelPrepared,
                PipelineError::SessionExhausted {
                    requested: requested.clone(),
                    attempts: *attempts,
                },
            )),
            None => Err(Interrupt::Failed(
                PipelineStage::ModelPrepared,
                PipelineError::internal("inference context missing after preparation"),
            )),
        }
    }

    /// Drop the batch session after a timeout
    ///
    /// The abandoned worker may still be inside the session (and hold its locks),
    /// so the next image prepares a new context instead of queueing behind it.
    fn discard_timed_out_context(&mut self) {
        if let Some(ContextState::Ready(context)) = self.context.take() {
            tracing::warn!(
                model = %context.model_name(),
                provider = %context.provider(),
                "session left to a timed-out worker, next image creates a new one"
            );
        }
    }

    /// Run inference plus matting on a worker thread with a hard wait
    fn run_inference(&self, image: &RgbImage, session: Arc<dyn Session>) -> Result<CutoutImage> {
        let _stage = info_span!("stage", stage = "inference", provider = %session.provider()).entered();
        let timeout = self.config.inference_timeout;
        let (sender, receiver) = mpsc::channel();
        let engine = self.matting.clone();
        let image = image.clone();

        std::thread::Builder::new()
            .name("cutout-inference".to_string())
            .spawn(move || {
                let result = engine.remove_background_with_matting(&image, session.as_ref());
                if sender.send(result).is_err() {
                    tracing::debug!("inference result discarded, caller stopped waiting");
                }
            })
            .map_err(|e| PipelineError::internal(format!("failed to spawn inference worker: {e}")))?;

        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(
                    timeout_ms = timeout.as_millis(),
                    "inference timed out, abandoning worker thread"
                );
                Err(PipelineError::Timeout {
                    seconds: timeout.as_secs(),
                })
            },
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::inference(
                "inference worker terminated without a result",
            )),
        }
    }

    fn write_cutout(&self, job: &mut Job, cutout: &CutoutImage) -> Result<()> {
        let cutout_path = job.path_for(ArtifactKind::RawCutout);
        ImageIOService::save_png(&DynamicImage::ImageRgba8(cutout.image.clone()), &cutout_path)?;

        let mask_path = job.path_for(ArtifactKind::RawMask);
        ImageIOService::save_png(&DynamicImage::ImageLuma8(cutout.alpha.clone()), &mask_path)?;
        self.coordinator.track_artifact(&mask_path, &job.source_path);
        tracing::debug!(cutout = %cutout_path.display(), mask = %mask_path.display(), "cutout written");

        job.record(
            PipelineStage::CutoutGenerated,
            vec![
                (cutout_path, ArtifactKind::RawCutout),
                (mask_path, ArtifactKind::RawMask),
            ],
        );
        Ok(())
    }

    /// Levels-adjust the mask, write it and the transparent output
    fn adjust_levels(&self, job: &mut Job, image: &RgbImage, alpha: &GrayImage) -> Result<RgbaImage> {
        let _stage = info_span!("stage", stage = "levels").entered();
        let levels = job.snapshot.levels;
        let adjusted = adjust_mask_levels(alpha, levels);
        tracing::debug!(
            black = levels.black_point,
            mid = levels.mid_point,
            white = levels.white_point,
            binary = levels.is_extreme(),
            "levels applied"
        );

        let mask_path = job.path_for(ArtifactKind::AdjustedMask);
        ImageIOService::save_png(&DynamicImage::ImageLuma8(adjusted.clone()), &mask_path)?;
        self.coordinator.track_artifact(&mask_path, &job.source_path);
        self.coordinator.register_in_use(&mask_path);
        job.adjusted_mask = Some(mask_path.clone());

        let transparent = cutout_from_alpha(image, &adjusted);
        let transparent_path = job.path_for(ArtifactKind::Transparent);
        let written = ImageIOService::save_png(&DynamicImage::ImageRgba8(transparent.clone()), &transparent_path);
        self.coordinator.unregister_in_use(&mask_path);
        written?;

        job.record(
            PipelineStage::LevelsAdjusted,
            vec![
                (mask_path, ArtifactKind::AdjustedMask),
                (transparent_path, ArtifactKind::Transparent),
            ],
        );

        // The transparent output supersedes the raw cutout and mask
        let raw_cutout = job.path_for(ArtifactKind::RawCutout);
        let raw_mask = job.path_for(ArtifactKind::RawMask);
        self.coordinator.cleanup_original_temp_files(&raw_cutout, &raw_mask);
        job.forget(&[ArtifactKind::RawCutout, ArtifactKind::RawMask]);

        if self.coordinator.cleanup_after_levels(&job.source_path).is_some() {
            // Final cleanup already ran and released the image
            job.adjusted_mask = None;
        }
        Ok(transparent)
    }

    /// Hold the adjusted mask for a consumer stage, then release it
    ///
    /// When no later stage reads the mask, removal is attempted right away.
    fn with_adjusted_mask<T>(
        &self,
        job: &Job,
        later_consumers: bool,
        stage: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let mask_path = job
            .adjusted_mask
            .clone()
            .ok_or_else(|| PipelineError::internal("adjusted mask missing"))?;
        self.coordinator.register_in_use(&mask_path);
        let result = stage(&mask_path);
        self.coordinator.unregister_in_use(&mask_path);
        if !later_consumers {
            self.coordinator.try_cleanup(&mask_path);
        }
        result
    }

    /// Crop the transparent output to the mask content, overwriting it in place
    ///
    /// `Ok(None)` when the mask has no content above the detection threshold.
    fn crop(&self, job: &mut Job, transparent: &RgbaImage) -> Result<Option<RgbaImage>> {
        let _stage = info_span!("stage", stage = "crop").entered();
        let snapshot = job.snapshot.clone();
        let later = snapshot.solid_bg_enabled || snapshot.jpg_export_enabled;
        let cropped = self
            .with_adjusted_mask(job, later, |mask_path| {
                let mask = ImageIOService::load_image(mask_path)?.to_luma8();
                let Some(bounds) = crop_bounds(&mask, snapshot.crop_detection_threshold, snapshot.unified_margin)
                else {
                    tracing::info!("no content above detection threshold, crop skipped");
                    return Ok(None);
                };
                tracing::debug!(?bounds, "cropping to content");
                let cropped = image::imageops::crop_imm(
                    transparent,
                    bounds.left,
                    bounds.top,
                    bounds.width(),
                    bounds.height(),
                )
                .to_image();
                Ok(Some(cropped))
            })
            .map_err(|e| PipelineError::optional_stage("crop", e.to_string()))?;

        let Some(cropped) = cropped else {
            return Ok(None);
        };
        let path = job.path_for(ArtifactKind::Cropped);
        ImageIOService::save_png(&DynamicImage::ImageRgba8(cropped.clone()), &path)
            .map_err(|e| PipelineError::optional_stage("crop", e.to_string()))?;
        job.record(PipelineStage::Cropped, vec![(path, ArtifactKind::Cropped)]);
        Ok(Some(cropped))
    }

    fn solid_background(&self, job: &mut Job, transparent: &RgbaImage) -> Result<RgbaImage> {
        let _stage = info_span!("stage", stage = "solid_background").entered();
        let snapshot = job.snapshot.clone();
        let composited = self
            .with_adjusted_mask(job, snapshot.jpg_export_enabled, |_| {
                Ok(add_solid_background(
                    transparent,
                    snapshot.solid_bg_color,
                    snapshot.unified_margin,
                ))
            })
            .map_err(|e| PipelineError::optional_stage("solid background", e.to_string()))?;

        let path = job.path_for(ArtifactKind::SolidBackground);
        ImageIOService::save_png(&DynamicImage::ImageRgba8(composited.clone()), &path)
            .map_err(|e| PipelineError::optional_stage("solid background", e.to_string()))?;
        job.record(
            PipelineStage::SolidBackgroundApplied,
            vec![(path, ArtifactKind::SolidBackground)],
        );
        Ok(composited)
    }

    fn export_jpg(&self, job: &mut Job, source: &RgbaImage) -> Result<()> {
        let _stage = info_span!("stage", stage = "jpg_export").entered();
        let path = job.path_for(ArtifactKind::Jpg);
        let exporter = JpgExporter::new(job.snapshot.jpg_quality);
        self.with_adjusted_mask(job, false, |_| exporter.export(source, &path))
            .map_err(|e| PipelineError::optional_stage("JPG export", e.to_string()))?;
        job.record(PipelineStage::JpgExported, vec![(path, ArtifactKind::Jpg)]);
        Ok(())
    }
}

/// Running batch started with [`PipelineOrchestrator::spawn`]
#[derive(Debug)]
pub struct BatchHandle {
    handle: JoinHandle<BatchSummary>,
    cancel: CancelHandle,
}

impl BatchHandle {
    /// Stop at the next stage boundary
    pub fn request_cancel(&self) {
        self.cancel.request_cancel();
    }

    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the batch to end
    ///
    /// # Errors
    /// - The worker thread panicked
    pub fn join(self) -> Result<BatchSummary> {
        self.handle
            .join()
            .map_err(|_| PipelineError::internal("pipeline worker panicked"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{
        MockModelStore, MockProbe, MockSessionFactory, RecordingReporter,
    };
    use crate::services::config_store::MemoryConfigStore;
    use image::Rgb;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_source(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let image = RgbImage::from_fn(32, 32, |x, y| {
            if (8..24).contains(&x) && (8..24).contains(&y) {
                Rgb([200, 40, 40])
            } else {
                Rgb([10, 10, 10])
            }
        });
        image.save(&path).unwrap();
        path
    }

    fn orchestrator(store: MemoryConfigStore, factory: MockSessionFactory) -> PipelineOrchestrator {
        let services = InferenceServices::new(
            Arc::new(MockProbe::new(vec![ProviderKind::Cpu])),
            Arc::new(factory),
            Arc::new(MockModelStore::empty()),
        );
        let config = OrchestratorConfig::builder()
            .alpha_matting(false)
            .warm_up(false)
            .build()
            .unwrap();
        PipelineOrchestrator::new(config, services, Arc::new(store)).unwrap()
    }

    fn png_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn test_minimal_run_writes_transparent_only() {
        let dir = TempDir::new().unwrap();
        let source = write_source(dir.path(), "cat.png");
        let mut orchestrator = orchestrator(
            MemoryConfigStore::new(),
            MockSessionFactory::accepting(&["isnet-general-use"]),
        );

        let summary = orchestrator.run_batch(&[source]);
        assert_eq!(summary.completed(), 1);
        let outcome = &summary.outcomes[0];
        assert_eq!(
            outcome.completed_stages(),
            vec![
                PipelineStage::Normalized,
                PipelineStage::ModelPrepared,
                PipelineStage::CutoutGenerated,
                PipelineStage::LevelsAdjusted,
                PipelineStage::Completed,
            ]
        );

        let files = png_files(&dir.path().join("PNG"));
        assert_eq!(files.len(), 1, "unexpected files {files:?}");
        assert!(files[0].starts_with("cat_transparent_"));
        assert_eq!(
            outcome.final_output.as_ref().unwrap().file_name().unwrap().to_string_lossy(),
            files[0]
        );
        assert!(outcome.artifact(ArtifactKind::RawCutout).is_none());
        assert!(outcome.artifact(ArtifactKind::AdjustedMask).is_some());
    }

    #[test]
    fn test_save_mask_keeps_adjusted_mask() {
        let dir = TempDir::new().unwrap();
        let source = write_source(dir.path(), "cat.png");
        let store = MemoryConfigStore::with_overrides(json!({
            "image_processing": {"save_mask": true},
            "image_cropping": {"enabled": true}
        }));
        let mut orchestrator = orchestrator(store, MockSessionFactory::accepting(&["isnet-general-use"]));

        let summary = orchestrator.run_batch(&[source]);
        assert_eq!(summary.completed(), 1);
        let files = png_files(&dir.path().join("PNG"));
        assert!(files.iter().any(|f| f.starts_with("cat_mask_adjusted_")));
        assert!(files.iter().any(|f| f.starts_with("cat_transparent_")));
    }

    #[test]
    fn test_all_stages_then_masks_cleaned() {
        let dir = TempDir::new().unwrap();
        let source = write_source(dir.path(), "cat.png");
        let store = MemoryConfigStore::with_overrides(json!({
            "image_cropping": {"enabled": true},
            "solid_background": {"enabled": true, "color": "#00FF00"},
            "image_processing": {"jpg_export": {"enabled": true}}
        }));
        let reporter = Arc::new(RecordingReporter::default());
        let mut orchestrator = orchestrator(store, MockSessionFactory::accepting(&["isnet-general-use"]))
            .with_reporter(reporter.clone());

        let summary = orchestrator.run_batch(&[source.clone()]);
        let outcome = &summary.outcomes[0];
        assert!(outcome.is_completed(), "{:?}", outcome.status);
        assert!(outcome.skipped.is_empty(), "{:?}", outcome.skipped);
        assert!(outcome.artifact(ArtifactKind::Cropped).is_some());
        assert!(outcome.artifact(ArtifactKind::SolidBackground).is_some());

        let jpg = dir.path().join("JPG").join("cat.jpg");
        assert!(jpg.exists());
        assert_eq!(outcome.final_output.as_deref(), Some(jpg.as_path()));

        let files = png_files(&dir.path().join("PNG"));
        assert!(files.iter().all(|f| !f.contains("_mask")), "masks left: {files:?}");
        assert!(orchestrator.coordinator().pending().is_empty());

        assert_eq!(reporter.completed_files(), vec![source]);
        assert_eq!(reporter.finished(), Some(1));
        let stages = reporter.stages();
        assert_eq!(stages.first(), Some(&PipelineStage::Normalized));
        assert_eq!(stages.last(), Some(&PipelineStage::Completed));
    }

    #[test]
    fn test_crop_trims_transparent_output() {
        let dir = TempDir::new().unwrap();
        let source = write_source(dir.path(), "cat.png");
        let store = MemoryConfigStore::with_overrides(json!({
            "image_cropping": {"enabled": true},
            "image_processing": {"unified_margin": 0}
        }));
        let mut orchestrator = orchestrator(store, MockSessionFactory::accepting(&["isnet-general-use"]));
        let summary = orchestrator.run_batch(&[source]);
        let output = summary.outcomes[0].final_output.clone().unwrap();
        let cropped = image::open(output).unwrap();
        // Mock mask is opaque where the source is bright
        assert_eq!((cropped.width(), cropped.height()), (16, 16));
    }

    #[test]
    fn test_corrupt_input_fails_but_batch_continues() {
        let dir = TempDir::new().unwrap();
        let broken = dir.path().join("broken.png");
        std::fs::write(&broken, b"not an image").unwrap();
        let good = write_source(dir.path(), "good.png");
        let mut orchestrator = orchestrator(
            MemoryConfigStore::new(),
            MockSessionFactory::accepting(&["isnet-general-use"]),
        );

        let summary = orchestrator.run_batch(&[broken, good]);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.completed(), 1);
        match &summary.outcomes[0].status {
            ImageStatus::Failed { stage, class, .. } => {
                assert_eq!(*stage, PipelineStage::Normalized);
                assert_eq!(*class, ErrorClass::ImageFatal);
            },
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_sessions_fail_every_image() {
        let dir = TempDir::new().unwrap();
        let a = write_source(dir.path(), "a.png");
        let b = write_source(dir.path(), "b.png");
        let factory = MockSessionFactory::accepting(&[]);
        let mut orchestrator = orchestrator(MemoryConfigStore::new(), factory);

        let summary = orchestrator.run_batch(&[a, b]);
        assert_eq!(summary.failed(), 2);
        for outcome in &summary.outcomes {
            assert!(matches!(
                outcome.status,
                ImageStatus::Failed { stage: PipelineStage::ModelPrepared, .. }
            ));
        }
    }

    #[test]
    fn test_inference_timeout_fails_image() {
        let dir = TempDir::new().unwrap();
        let a = write_source(dir.path(), "a.png");
        let b = write_source(dir.path(), "b.png");
        let services = InferenceServices::new(
            Arc::new(MockProbe::new(vec![ProviderKind::Cpu])),
            Arc::new(
                MockSessionFactory::accepting(&["isnet-general-use"]).with_delay(Duration::from_millis(400)),
            ),
            Arc::new(MockModelStore::empty()),
        );
        let config = OrchestratorConfig::builder()
            .alpha_matting(false)
            .warm_up(false)
            .inference_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let mut orchestrator =
            PipelineOrchestrator::new(config, services, Arc::new(MemoryConfigStore::new())).unwrap();

        let started = Instant::now();
        let summary = orchestrator.run_batch(&[a, b]);
        assert!(started.elapsed() < Duration::from_millis(700));
        assert_eq!(summary.failed(), 2);
        for outcome in &summary.outcomes {
            match &outcome.status {
                ImageStatus::Failed {
                    stage, timed_out, ..
                } => {
                    assert_eq!(*stage, PipelineStage::Inference);
                    assert!(*timed_out);
                },
                other => panic!("unexpected status {other:?}"),
            }
            assert!(outcome.final_output.is_none());
        }
    }

    #[test]
    fn test_cancel_before_start_cancels_everything() {
        let dir = TempDir::new().unwrap();
        let source = write_source(dir.path(), "cat.png");
        let mut orchestrator = orchestrator(
            MemoryConfigStore::new(),
            MockSessionFactory::accepting(&["isnet-general-use"]),
        );
        orchestrator.cancel_handle().request_cancel();
        let summary = orchestrator.run_batch(&[source]);
        assert_eq!(summary.cancelled(), 1);
        assert!(!dir.path().join("PNG").exists());
    }

    #[test]
    fn test_spawned_batch_joins() {
        let dir = TempDir::new().unwrap();
        let source = write_source(dir.path(), "cat.png");
        let orchestrator = orchestrator(
            MemoryConfigStore::new(),
            MockSessionFactory::accepting(&["isnet-general-use"]),
        );
        let handle = orchestrator.spawn(vec![source]).unwrap();
        let summary = handle.join().unwrap();
        assert_eq!(summary.completed(), 1);
        assert!(summary.is_success());
    }

    #[test]
    fn test_cancel_handle_reset() {
        let handle = CancelHandle::new();
        handle.request_cancel();
        assert!(handle.clone().is_cancelled());
        handle.reset();
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn test_final_output_prefers_downstream_artifacts() {
        let mut job = Job::new(0, Path::new("/p/cat.png"), PathBuf::from("/p/PNG"), ConfigSnapshot::default());
        job.record(
            PipelineStage::CutoutGenerated,
            vec![(PathBuf::from("/p/PNG/raw.png"), ArtifactKind::RawCutout)],
        );
        assert_eq!(job.final_output(), Some(PathBuf::from("/p/PNG/raw.png")));
        job.record(
            PipelineStage::LevelsAdjusted,
            vec![(PathBuf::from("/p/PNG/t.png"), ArtifactKind::Transparent)],
        );
        job.record(
            PipelineStage::SolidBackgroundApplied,
            vec![(PathBuf::from("/p/PNG/s.png"), ArtifactKind::SolidBackground)],
        );
        assert_eq!(job.final_output(), Some(PathBuf::from("/p/PNG/s.png")));
        job.forget(&[ArtifactKind::SolidBackground]);
        assert_eq!(job.final_output(), Some(PathBuf::from("/p/PNG/t.png")));
    }
}
