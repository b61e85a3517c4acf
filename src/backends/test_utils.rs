//! Test utilities and mock backends
//!
//! Mock implementations of the provider probe, session factory, model store and
//! matting backend so the pipeline can be exercised without ONNX Runtime or model
//! files. Every mock records its calls for verification in tests.

use crate::{
    error::{PipelineError, Result},
    matting::{AlphaMattingParams, MattingBackend},
    providers::{ProbeReport, ProviderKind, ProviderProbe},
    services::progress::{PipelineStage, ProgressReporter, ProgressUpdate},
    session::{ModelStore, PreparedModel, Session, SessionFactory},
};
use image::{GrayImage, Luma, RgbImage};
use instant::Duration;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Mock session producing a deterministic mask
///
/// Pixels whose brightest channel is at least 128 are foreground (255), the rest
/// background (0).
#[derive(Debug, Clone)]
pub struct MockSession {
    model_name: String,
    provider: ProviderKind,
    mask_size: Option<(u32, u32)>,
    delay: Duration,
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl MockSession {
    #[must_use]
    pub fn new(model_name: &str, provider: ProviderKind) -> Self {
        Self {
            model_name: model_name.to_string(),
            provider,
            mask_size: None,
            delay: Duration::ZERO,
            fail: false,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Return masks at a fixed resolution, like a model with a fixed input size
    #[must_use]
    pub fn with_mask_size(mut self, width: u32, height: u32) -> Self {
        self.mask_size = Some((width, height));
        self
    }

    /// Sleep before every prediction
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every prediction
    #[must_use]
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Number of predictions run
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Session for MockSession {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn predict_mask(&self, image: &RgbImage) -> Result<GrayImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if self.fail {
            return Err(PipelineError::inference("mock inference failure"));
        }

        let (width, height) = self.mask_size.unwrap_or_else(|| image.dimensions());
        let (src_w, src_h) = image.dimensions();
        Ok(GrayImage::from_fn(width, height, |x, y| {
            let sx = (u64::from(x) * u64::from(src_w) / u64::from(width.max(1))) as u32;
            let sy = (u64::from(y) * u64::from(src_h) / u64::from(height.max(1))) as u32;
            let pixel = image.get_pixel(sx.min(src_w - 1), sy.min(src_h - 1));
            let brightest = pixel.0.iter().copied().max().unwrap_or(0);
            Luma([if brightest >= 128 { 255 } else { 0 }])
        }))
    }
}

/// Mock session factory accepting a fixed set of model names
#[derive(Debug, Default)]
pub struct MockSessionFactory {
    accepted: Vec<String>,
    accept_paths: bool,
    delay: Duration,
    failing_sessions: bool,
    /// Call history for verification in tests
    call_history: Arc<Mutex<Vec<String>>>,
}

impl MockSessionFactory {
    /// Factory whose `from_name` succeeds only for `names`; paths are rejected
    #[must_use]
    pub fn accepting(names: &[&str]) -> Self {
        Self {
            accepted: names.iter().map(|n| (*n).to_string()).collect(),
            ..Self::default()
        }
    }

    /// Also accept every `from_path` call
    #[must_use]
    pub fn accepting_paths(mut self) -> Self {
        self.accept_paths = true;
        self
    }

    /// Sessions created by this factory sleep before each prediction
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sessions created by this factory fail every prediction
    #[must_use]
    pub fn with_failing_sessions(mut self) -> Self {
        self.failing_sessions = true;
        self
    }

    /// Calls in order, as `from_name:<name>` or `from_path:<path>`
    pub fn history(&self) -> Vec<String> {
        self.call_history.lock().unwrap().clone()
    }

    fn session(&self, name: &str, provider: ProviderKind) -> Arc<dyn Session> {
        let mut session = MockSession::new(name, provider).with_delay(self.delay);
        if self.failing_sessions {
            session = session.failing();
        }
        Arc::new(session)
    }
}

impl SessionFactory for MockSessionFactory {
    fn from_name(&self, name: &str, provider: ProviderKind) -> Result<Arc<dyn Session>> {
        self.call_history.lock().unwrap().push(format!("from_name:{name}"));
        if self.accepted.iter().any(|n| n == name) {
            Ok(self.session(name, provider))
        } else {
            Err(PipelineError::model(format!("mock model '{name}' unavailable")))
        }
    }

    fn from_path(&self, path: &Path, provider: ProviderKind) -> Result<Arc<dyn Session>> {
        self.call_history
            .lock()
            .unwrap()
            .push(format!("from_path:{}", path.display()));
        if self.accept_paths {
            let name = path
                .file_stem()
                .map_or_else(|| "mock".to_string(), |s| s.to_string_lossy().into_owned());
            Ok(self.session(&name, provider))
        } else {
            Err(PipelineError::model(format!("mock path '{}' unavailable", path.display())))
        }
    }
}

/// Mock model store with an explicit name → path table
#[derive(Debug, Default)]
pub struct MockModelStore {
    paths: HashMap<String, PathBuf>,
}

impl MockModelStore {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_path<P: Into<PathBuf>>(mut self, name: &str, path: P) -> Self {
        self.paths.insert(name.to_string(), path.into());
        self
    }
}

impl ModelStore for MockModelStore {
    fn prepare(&self, model_name: &str) -> Result<PreparedModel> {
        self.paths
            .get(model_name)
            .cloned()
            .map(PreparedModel::Path)
            .ok_or_else(|| PipelineError::model(format!("mock store has no '{model_name}'")))
    }

    fn resolve_path(&self, model_name: &str) -> Option<PathBuf> {
        self.paths.get(model_name).cloned()
    }
}

/// How [`MockProbe`] answers a verification request
#[derive(Debug, Clone, Default)]
pub enum ProbeBehavior {
    /// Report that the requested provider ran the probe
    #[default]
    Confirms,
    /// Report that a different provider ran the probe
    RunsOn(ProviderKind),
    /// Return an error
    Fails(String),
    /// Panic inside the probe
    Panics,
    /// Sleep, then confirm
    Sleeps(Duration),
}

/// Mock provider probe with per-provider behaviour
#[derive(Debug, Default)]
pub struct MockProbe {
    available: Vec<ProviderKind>,
    behaviors: HashMap<ProviderKind, ProbeBehavior>,
    verify_calls: AtomicUsize,
}

impl MockProbe {
    #[must_use]
    pub fn new(available: Vec<ProviderKind>) -> Self {
        Self {
            available,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_behavior(mut self, kind: ProviderKind, behavior: ProbeBehavior) -> Self {
        self.behaviors.insert(kind, behavior);
        self
    }

    /// Number of `verify` calls made so far
    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

impl ProviderProbe for MockProbe {
    fn available_providers(&self) -> Vec<ProviderKind> {
        self.available.clone()
    }

    fn verify(&self, kind: ProviderKind, _budget: Duration) -> Result<ProbeReport> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let report = |active| ProbeReport {
            requested: kind,
            active,
            elapsed: Duration::from_millis(1),
        };
        match self.behaviors.get(&kind).cloned().unwrap_or_default() {
            ProbeBehavior::Confirms => Ok(report(kind)),
            ProbeBehavior::RunsOn(active) => Ok(report(active)),
            ProbeBehavior::Fails(message) => Err(PipelineError::inference(message)),
            ProbeBehavior::Panics => panic!("mock probe panic for {kind}"),
            ProbeBehavior::Sleeps(duration) => {
                std::thread::sleep(duration);
                Ok(report(kind))
            },
        }
    }
}

/// Mock matting backend failing a fixed number of times before succeeding
#[derive(Debug, Default)]
pub struct MockMattingBackend {
    failures_before_success: usize,
    calls: AtomicUsize,
}

impl MockMattingBackend {
    /// Value of every pixel in a successful estimate
    pub const SUCCESS_VALUE: u8 = 123;

    #[must_use]
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures_before_success: failures,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MattingBackend for MockMattingBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn estimate_alpha(
        &self,
        _image: &RgbImage,
        mask: &GrayImage,
        params: &AlphaMattingParams,
    ) -> Result<GrayImage> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures_before_success {
            return Err(PipelineError::matting(format!(
                "mock matting failure {} ({params})",
                call + 1
            )));
        }
        Ok(GrayImage::from_pixel(
            mask.width(),
            mask.height(),
            Luma([Self::SUCCESS_VALUE]),
        ))
    }
}

/// Progress reporter that records every callback
#[derive(Debug, Default)]
pub struct RecordingReporter {
    updates: Mutex<Vec<ProgressUpdate>>,
    completed: Mutex<Vec<PathBuf>>,
    errors: Mutex<Vec<(PipelineStage, String)>>,
    finished: Mutex<Option<usize>>,
}

impl RecordingReporter {
    pub fn stages(&self) -> Vec<PipelineStage> {
        self.updates.lock().unwrap().iter().map(|u| u.stage).collect()
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn completed_files(&self) -> Vec<PathBuf> {
        self.completed.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(PipelineStage, String)> {
        self.errors.lock().unwrap().clone()
    }

    /// File count passed to `on_finished`, if it was called
    pub fn finished(&self) -> Option<usize> {
        *self.finished.lock().unwrap()
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_progress(&self, update: ProgressUpdate) {
        self.updates.lock().unwrap().push(update);
    }

    fn on_file_completed(&self, image_path: &Path) {
        self.completed.lock().unwrap().push(image_path.to_path_buf());
    }

    fn on_finished(&self, _elapsed_seconds: f64, file_count: usize) {
        *self.finished.lock().unwrap() = Some(file_count);
    }

    fn report_error(&self, stage: PipelineStage, _image_path: &Path, error: &str) {
        self.errors.lock().unwrap().push((stage, error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_mock_session_thresholds_brightness() {
        let image = RgbImage::from_fn(4, 1, |x, _| if x < 2 { Rgb([0, 0, 0]) } else { Rgb([0, 200, 0]) });
        let session = MockSession::new("u2net", ProviderKind::Cpu);
        let mask = session.predict_mask(&image).unwrap();
        assert_eq!(mask.as_raw(), &vec![0, 0, 255, 255]);
        assert_eq!(session.call_count(), 1);
    }

    #[test]
    fn test_factory_records_history() {
        let factory = MockSessionFactory::accepting(&["u2net"]);
        assert!(factory.from_name("isnet-anime", ProviderKind::Cpu).is_err());
        assert!(factory.from_path(Path::new("/m/u2net.onnx"), ProviderKind::Cpu).is_err());
        let session = factory.from_name("u2net", ProviderKind::Cuda).unwrap();
        assert_eq!(session.provider(), ProviderKind::Cuda);
        assert_eq!(
            factory.history(),
            vec!["from_name:isnet-anime", "from_path:/m/u2net.onnx", "from_name:u2net"]
        );
    }

    #[test]
    fn test_probe_behaviours() {
        let probe = MockProbe::new(vec![ProviderKind::Cuda])
            .with_behavior(ProviderKind::Rocm, ProbeBehavior::RunsOn(ProviderKind::Cpu));
        let budget = Duration::from_secs(1);
        assert_eq!(probe.verify(ProviderKind::Cuda, budget).unwrap().active, ProviderKind::Cuda);
        assert_eq!(probe.verify(ProviderKind::Rocm, budget).unwrap().active, ProviderKind::Cpu);
        assert_eq!(probe.verify_calls(), 2);
    }
}
