//! Progress reporting service
//!
//! Separates progress reporting from the pipeline so different front ends (CLI
//! progress bar, GUI channel, logs) can observe a batch without touching it.

use crate::processor::{ImageStatus, JobOutcome};
use instant::Instant;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

/// Per-image pipeline stages in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    /// Source decoded and converted to RGB
    Normalized,
    /// Provider selected and model prepared
    ModelPrepared,
    /// Inference session created
    SessionLoaded,
    /// Inference dispatched to the worker thread
    Inference,
    /// Inference returned, matting finished
    InferenceCompleted,
    /// Raw cutout and mask written
    CutoutGenerated,
    /// Levels adjustment running
    LevelsAdjusting,
    /// Transparent output written from the adjusted mask
    LevelsAdjusted,
    Cropped,
    SolidBackgroundApplied,
    JpgExported,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStage {
    /// Human-readable description of the stage
    #[must_use]
    pub fn description(&self) -> &'static str {
        match self {
            Self::Normalized => "Loading input image",
            Self::ModelPrepared => "Preparing model",
            Self::SessionLoaded => "Loading inference session",
            Self::Inference => "Removing background",
            Self::InferenceCompleted => "Refining edges",
            Self::CutoutGenerated => "Saving cutout",
            Self::LevelsAdjusting => "Adjusting mask levels",
            Self::LevelsAdjusted => "Saving transparent image",
            Self::Cropped => "Cropping to content",
            Self::SolidBackgroundApplied => "Adding solid background",
            Self::JpgExported => "Exporting JPG",
            Self::Completed => "Processing completed",
            Self::Failed => "Processing failed",
            Self::Cancelled => "Processing cancelled",
        }
    }

    /// Typical per-image progress percentage once this stage is reached
    #[must_use]
    pub fn progress_percentage(&self) -> u8 {
        match self {
            Self::Normalized => 5,
            Self::ModelPrepared => 10,
            Self::SessionLoaded => 20,
            Self::Inference => 30,
            Self::InferenceCompleted => 40,
            Self::CutoutGenerated => 50,
            Self::LevelsAdjusting => 65,
            Self::LevelsAdjusted => 80,
            Self::Cropped => 90,
            Self::SolidBackgroundApplied => 93,
            Self::JpgExported => 97,
            Self::Completed | Self::Failed | Self::Cancelled => 100,
        }
    }

    /// Whether processing of the image ends in this stage
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description())
    }
}

/// Progress update for the current image
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stage: PipelineStage,
    /// Overall batch progress (0-100)
    pub progress: u8,
    /// Message shown to the user
    pub description: String,
    pub image_path: Option<PathBuf>,
    /// Zero-based index of the current image
    pub file_index: usize,
    pub file_count: usize,
    /// Elapsed time since the batch started (milliseconds)
    pub elapsed_ms: u64,
}

impl ProgressUpdate {
    /// Update for `stage` of image `file_index` out of `file_count`
    #[must_use]
    pub fn new(
        stage: PipelineStage,
        image_path: Option<&Path>,
        file_index: usize,
        file_count: usize,
        start_time: Instant,
    ) -> Self {
        Self {
            progress: overall_progress(stage, file_index, file_count),
            description: stage.description().to_string(),
            image_path: image_path.map(Path::to_path_buf),
            file_index,
            file_count,
            elapsed_ms: u64::try_from(start_time.elapsed().as_millis()).unwrap_or(u64::MAX),
            stage,
        }
    }

    /// Replace the stage description
    #[must_use]
    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = description.into();
        self
    }
}

/// Batch percentage: finished images plus the stage share of the current one
fn overall_progress(stage: PipelineStage, file_index: usize, file_count: usize) -> u8 {
    if file_count == 0 {
        return stage.progress_percentage();
    }
    let done = file_index.min(file_count) * 100 + usize::from(stage.progress_percentage());
    u8::try_from((done / file_count).min(100)).unwrap_or(100)
}

/// Observer for batch progress
///
/// Implementations must be cheap: callbacks run on the pipeline worker thread.
pub trait ProgressReporter: Send + Sync {
    /// A stage was reached for the current image
    fn on_progress(&self, update: ProgressUpdate);

    /// One image left the pipeline (completed, failed or cancelled)
    fn on_file_completed(&self, image_path: &Path);

    /// The whole batch ended
    fn on_finished(&self, elapsed_seconds: f64, file_count: usize);

    /// An image failed in `stage`
    fn report_error(&self, stage: PipelineStage, image_path: &Path, error: &str) {
        log::error!(
            "❌ Error during {} for {}: {}",
            stage.description(),
            image_path.display(),
            error
        );
    }
}

/// No-op progress reporter that discards all progress updates
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn on_progress(&self, _update: ProgressUpdate) {}

    fn on_file_completed(&self, _image_path: &Path) {}

    fn on_finished(&self, _elapsed_seconds: f64, _file_count: usize) {}

    fn report_error(&self, _stage: PipelineStage, _image_path: &Path, _error: &str) {}
}

/// Console progress reporter that logs progress through `log`
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    /// # Arguments
    /// * `verbose` - Whether to include elapsed time and file positions
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn on_progress(&self, update: ProgressUpdate) {
        let name = update
            .image_path
            .as_deref()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.verbose {
            log::info!(
                "[{}%] ({}/{}) {} {} ({}ms elapsed)",
                update.progress,
                update.file_index + 1,
                update.file_count,
                name,
                update.description,
                update.elapsed_ms
            );
        } else {
            log::info!("[{}%] {} {}", update.progress, name, update.description);
        }
    }

    fn on_file_completed(&self, image_path: &Path) {
        if self.verbose {
            log::info!("📄 Finished {}", image_path.display());
        }
    }

    fn on_finished(&self, elapsed_seconds: f64, file_count: usize) {
        log::info!("✅ Processed {file_count} file(s) in {elapsed_seconds:.2}s");
    }
}

/// Events forwarded by [`ChannelProgressReporter`]
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Progress(ProgressUpdate),
    FileCompleted(PathBuf),
    Finished {
        elapsed_seconds: f64,
        file_count: usize,
    },
    Error {
        stage: PipelineStage,
        image_path: PathBuf,
        message: String,
    },
}

/// Forwards progress to another thread over an mpsc channel
///
/// Send failures mean the receiver is gone; they are ignored so a closed UI never
/// stalls the batch.
pub struct ChannelProgressReporter {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgressReporter {
    /// Reporter plus the receiving end of its channel
    #[must_use]
    pub fn new() -> (Self, Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: ProgressEvent) {
        if self.sender.send(event).is_err() {
            log::trace!("Progress receiver dropped");
        }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn on_progress(&self, update: ProgressUpdate) {
        self.send(ProgressEvent::Progress(update));
    }

    fn on_file_completed(&self, image_path: &Path) {
        self.send(ProgressEvent::FileCompleted(image_path.to_path_buf()));
    }

    fn on_finished(&self, elapsed_seconds: f64, file_count: usize) {
        self.send(ProgressEvent::Finished {
            elapsed_seconds,
            file_count,
        });
    }

    fn report_error(&self, stage: PipelineStage, image_path: &Path, error: &str) {
        self.send(ProgressEvent::Error {
            stage,
            image_path: image_path.to_path_buf(),
            message: error.to_string(),
        });
    }
}

/// Progress tracker that manages timing and the current batch position
pub struct ProgressTracker {
    reporter: Arc<dyn ProgressReporter>,
    start_time: Instant,
    file_index: usize,
    file_count: usize,
    current_image: Option<PathBuf>,
    current_stage: Option<PipelineStage>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new(reporter: Arc<dyn ProgressReporter>, file_count: usize) -> Self {
        Self {
            reporter,
            start_time: Instant::now(),
            file_index: 0,
            file_count,
            current_image: None,
            current_stage: None,
        }
    }

    /// Tracker with a no-op reporter
    #[must_use]
    pub fn no_op(file_count: usize) -> Self {
        Self::new(Arc::new(NoOpProgressReporter), file_count)
    }

    /// Start reporting for image `index`
    pub fn begin_image(&mut self, index: usize, image_path: &Path) {
        self.file_index = index;
        self.current_image = Some(image_path.to_path_buf());
        self.current_stage = None;
    }

    pub fn report_stage(&mut self, stage: PipelineStage) {
        let update = self.update_for(stage);
        self.reporter.on_progress(update);
    }

    pub fn report_stage_with_description<S: Into<String>>(&mut self, stage: PipelineStage, description: S) {
        let update = self.update_for(stage).with_description(description);
        self.reporter.on_progress(update);
    }

    fn update_for(&mut self, stage: PipelineStage) -> ProgressUpdate {
        self.current_stage = Some(stage);
        ProgressUpdate::new(
            stage,
            self.current_image.as_deref(),
            self.file_index,
            self.file_count,
            self.start_time,
        )
    }

    /// Report an error against the current image and stage
    pub fn report_error(&self, error: &str) {
        let stage = self.current_stage.unwrap_or(PipelineStage::Normalized);
        let path = self.current_image.as_deref().unwrap_or_else(|| Path::new(""));
        self.reporter.report_error(stage, path, error);
    }

    pub fn file_completed(&self) {
        if let Some(path) = &self.current_image {
            self.reporter.on_file_completed(path);
        }
    }

    /// Report the end of the batch and return the elapsed time
    pub fn finish(&self, file_count: usize) -> Duration {
        let elapsed = self.start_time.elapsed();
        self.reporter.on_finished(elapsed.as_secs_f64(), file_count);
        elapsed
    }

    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    #[must_use]
    pub fn current_stage(&self) -> Option<PipelineStage> {
        self.current_stage
    }
}

/// Result of a whole batch
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub outcomes: Vec<JobOutcome>,
    pub elapsed: Duration,
}

impl BatchSummary {
    #[must_use]
    pub fn completed(&self) -> usize {
        self.count(|s| matches!(s, ImageStatus::Completed))
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ImageStatus::Failed { .. }))
    }

    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, ImageStatus::Cancelled { .. }))
    }

    /// True when no image failed (cancelled images do not count as failures)
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, predicate: impl Fn(&ImageStatus) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(&o.status)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_percentages_are_monotonic() {
        let order = [
            PipelineStage::Normalized,
            PipelineStage::ModelPrepared,
            PipelineStage::SessionLoaded,
            PipelineStage::Inference,
            PipelineStage::InferenceCompleted,
            PipelineStage::CutoutGenerated,
            PipelineStage::LevelsAdjusting,
            PipelineStage::LevelsAdjusted,
            PipelineStage::Cropped,
            PipelineStage::SolidBackgroundApplied,
            PipelineStage::JpgExported,
            PipelineStage::Completed,
        ];
        let values: Vec<u8> = order.iter().map(PipelineStage::progress_percentage).collect();
        assert_eq!(values, vec![5, 10, 20, 30, 40, 50, 65, 80, 90, 93, 97, 100]);
        assert!(PipelineStage::Failed.is_terminal());
        assert!(!PipelineStage::Cropped.is_terminal());
    }

    #[test]
    fn test_overall_progress() {
        assert_eq!(overall_progress(PipelineStage::Normalized, 0, 1), 5);
        assert_eq!(overall_progress(PipelineStage::Completed, 0, 2), 50);
        assert_eq!(overall_progress(PipelineStage::LevelsAdjusted, 1, 2), 90);
        assert_eq!(overall_progress(PipelineStage::Completed, 3, 4), 100);
        assert_eq!(overall_progress(PipelineStage::Cropped, 0, 0), 90);
    }

    #[test]
    fn test_channel_reporter_forwards_events() {
        let (reporter, events) = ChannelProgressReporter::new();
        let mut tracker = ProgressTracker::new(Arc::new(reporter), 2);
        tracker.begin_image(0, Path::new("a.png"));
        tracker.report_stage(PipelineStage::Normalized);
        tracker.report_error("boom");
        tracker.file_completed();
        tracker.finish(2);

        let events: Vec<ProgressEvent> = events.try_iter().collect();
        assert_eq!(events.len(), 4);
        match &events[0] {
            ProgressEvent::Progress(update) => {
                assert_eq!(update.stage, PipelineStage::Normalized);
                assert_eq!(update.progress, 2);
                assert_eq!(update.image_path.as_deref(), Some(Path::new("a.png")));
            },
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            &events[1],
            ProgressEvent::Error { stage: PipelineStage::Normalized, message, .. } if message == "boom"
        ));
        assert_eq!(events[2], ProgressEvent::FileCompleted(PathBuf::from("a.png")));
        assert!(matches!(events[3], ProgressEvent::Finished { file_count: 2, .. }));
    }

    #[test]
    fn test_channel_reporter_tolerates_dropped_receiver() {
        let (reporter, events) = ChannelProgressReporter::new();
        drop(events);
        reporter.on_file_completed(Path::new("a.png"));
        reporter.on_finished(1.0, 1);
    }

    #[test]
    fn test_no_op_reporter() {
        let reporter = NoOpProgressReporter;
        let update = ProgressUpdate::new(PipelineStage::Inference, None, 0, 1, Instant::now());
        reporter.on_progress(update);
        reporter.on_file_completed(Path::new("x.png"));
        reporter.on_finished(0.0, 0);
        reporter.report_error(PipelineStage::Inference, Path::new("x.png"), "ignored");
    }

    #[test]
    fn test_description_override() {
        let update = ProgressUpdate::new(PipelineStage::Inference, None, 0, 1, Instant::now())
            .with_description("Removing background (cuda)");
        assert_eq!(update.description, "Removing background (cuda)");
        assert_eq!(update.progress, 30);
    }
}
