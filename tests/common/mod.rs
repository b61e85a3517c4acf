//! Shared mocks and fixtures for integration tests
//!
//! The mocks mirror the crate's own unit-test doubles: a session whose mask is
//! derived from pixel brightness, a factory that accepts a fixed set of names,
//! and a probe that reports a fixed provider list.

#![allow(dead_code)]

use cutout_pipeline::{
    error::{PipelineError, Result},
    matting::{AlphaMattingParams, MattingBackend},
    providers::{ProbeReport, ProviderKind, ProviderProbe},
    services::{ProgressReporter, ProgressUpdate},
    session::{ModelStore, PreparedModel, Session, SessionFactory},
    CancelHandle, InferenceServices, MemoryConfigStore, OrchestratorConfig, PipelineOrchestrator,
};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Session that marks bright pixels as foreground
pub struct BrightnessSession {
    pub name: String,
    pub provider: ProviderKind,
    pub delay: Duration,
}

impl Session for BrightnessSession {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn predict_mask(&self, image: &RgbImage) -> Result<GrayImage> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let brightest = image.get_pixel(x, y).0.iter().copied().max().unwrap_or(0);
            Luma([if brightest >= 128 { 255 } else { 0 }])
        }))
    }
}

/// Factory accepting a fixed set of names and, optionally, any path
#[derive(Default)]
pub struct NamedFactory {
    pub accepted: Vec<String>,
    pub accept_paths: bool,
    pub delay: Duration,
    pub calls: Mutex<Vec<String>>,
}

impl NamedFactory {
    pub fn accepting(names: &[&str]) -> Self {
        Self {
            accepted: names.iter().map(|n| (*n).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_paths(mut self) -> Self {
        self.accept_paths = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn session(&self, name: &str, provider: ProviderKind) -> Arc<dyn Session> {
        Arc::new(BrightnessSession {
            name: name.to_string(),
            provider,
            delay: self.delay,
        })
    }
}

impl SessionFactory for NamedFactory {
    fn from_name(&self, name: &str, provider: ProviderKind) -> Result<Arc<dyn Session>> {
        self.calls.lock().unwrap().push(format!("name:{name}"));
        if self.accepted.iter().any(|n| n == name) {
            Ok(self.session(name, provider))
        } else {
            Err(PipelineError::model(format!("unknown model {name}")))
        }
    }

    fn from_path(&self, path: &Path, provider: ProviderKind) -> Result<Arc<dyn Session>> {
        self.calls.lock().unwrap().push(format!("path:{}", path.display()));
        if self.accept_paths {
            let stem = path.file_stem().unwrap().to_string_lossy().into_owned();
            Ok(self.session(&stem, provider))
        } else {
            Err(PipelineError::model(format!("cannot load {}", path.display())))
        }
    }
}

/// Session that serialises predictions behind its own lock, like a runtime session
pub struct LockedSession {
    pub name: String,
    pub provider: ProviderKind,
    pub lock: Mutex<()>,
    pub stall: Duration,
    pub predictions: Arc<AtomicUsize>,
}

impl Session for LockedSession {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn predict_mask(&self, image: &RgbImage) -> Result<GrayImage> {
        let _guard = self.lock.lock().unwrap();
        // Only the first prediction across all sessions stalls
        if self.predictions.fetch_add(1, Ordering::SeqCst) == 0 {
            std::thread::sleep(self.stall);
        }
        Ok(GrayImage::from_fn(image.width(), image.height(), |x, y| {
            let brightest = image.get_pixel(x, y).0.iter().copied().max().unwrap_or(0);
            Luma([if brightest >= 128 { 255 } else { 0 }])
        }))
    }
}

/// Factory producing a fresh [`LockedSession`] per call
pub struct StallOnceFactory {
    pub stall: Duration,
    pub predictions: Arc<AtomicUsize>,
    pub sessions_created: AtomicUsize,
}

impl StallOnceFactory {
    pub fn new(stall: Duration) -> Self {
        Self {
            stall,
            predictions: Arc::new(AtomicUsize::new(0)),
            sessions_created: AtomicUsize::new(0),
        }
    }
}

impl SessionFactory for StallOnceFactory {
    fn from_name(&self, name: &str, provider: ProviderKind) -> Result<Arc<dyn Session>> {
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LockedSession {
            name: name.to_string(),
            provider,
            lock: Mutex::new(()),
            stall: self.stall,
            predictions: self.predictions.clone(),
        }))
    }

    fn from_path(&self, path: &Path, _provider: ProviderKind) -> Result<Arc<dyn Session>> {
        Err(PipelineError::model(format!("cannot load {}", path.display())))
    }
}

/// Model store that knows no files
pub struct NoFiles;

impl ModelStore for NoFiles {
    fn prepare(&self, model_name: &str) -> Result<PreparedModel> {
        Ok(PreparedModel::Symbolic(model_name.to_string()))
    }

    fn resolve_path(&self, _model_name: &str) -> Option<PathBuf> {
        None
    }
}

/// Probe reporting `available`; verification runs on `runs_on` when set
pub struct FixedProbe {
    pub available: Vec<ProviderKind>,
    pub runs_on: Option<ProviderKind>,
    pub verify_calls: AtomicUsize,
}

impl FixedProbe {
    pub fn new(available: Vec<ProviderKind>) -> Self {
        Self {
            available,
            runs_on: None,
            verify_calls: AtomicUsize::new(0),
        }
    }

    pub fn running_on(mut self, kind: ProviderKind) -> Self {
        self.runs_on = Some(kind);
        self
    }
}

impl ProviderProbe for FixedProbe {
    fn available_providers(&self) -> Vec<ProviderKind> {
        self.available.clone()
    }

    fn verify(&self, kind: ProviderKind, _budget: Duration) -> Result<ProbeReport> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProbeReport {
            requested: kind,
            active: self.runs_on.unwrap_or(kind),
            elapsed: Duration::from_millis(1),
        })
    }
}

/// Matting backend failing a fixed number of times, then echoing the mask
pub struct FlakyMatting {
    pub failures_left: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FlakyMatting {
    pub fn failing_first(n: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(n),
            calls: AtomicUsize::new(0),
        }
    }
}

impl MattingBackend for FlakyMatting {
    fn name(&self) -> &str {
        "flaky"
    }

    fn estimate_alpha(
        &self,
        _image: &RgbImage,
        mask: &GrayImage,
        _params: &AlphaMattingParams,
    ) -> Result<GrayImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::matting("matrix is singular"));
        }
        Ok(mask.clone())
    }
}

/// Reporter that requests a cancel once `after` files have completed
pub struct CancelAfter {
    pub after: usize,
    pub cancel: CancelHandle,
    pub completed: AtomicUsize,
}

impl ProgressReporter for CancelAfter {
    fn on_progress(&self, _update: ProgressUpdate) {}

    fn on_file_completed(&self, _image_path: &Path) {
        if self.completed.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
            self.cancel.request_cancel();
        }
    }

    fn on_finished(&self, _elapsed_seconds: f64, _file_count: usize) {}
}

/// 32x32 image with a bright 16x16 square at (8, 8)
pub fn write_square(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    RgbImage::from_fn(32, 32, |x, y| {
        if (8..24).contains(&x) && (8..24).contains(&y) {
            Rgb([220, 180, 60])
        } else {
            Rgb([12, 12, 12])
        }
    })
    .save(&path)
    .unwrap();
    path
}

pub fn cpu_services(factory: NamedFactory) -> InferenceServices {
    InferenceServices::new(
        Arc::new(FixedProbe::new(vec![ProviderKind::Cpu])),
        Arc::new(factory),
        Arc::new(NoFiles),
    )
}

/// Route `log` output from the crate into the test harness
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .is_test(true)
        .try_init();
}

/// Orchestrator with matting and warm-up off
pub fn orchestrator(store: MemoryConfigStore, factory: NamedFactory) -> PipelineOrchestrator {
    init_logging();
    let config = OrchestratorConfig::builder()
        .alpha_matting(false)
        .warm_up(false)
        .build()
        .unwrap();
    PipelineOrchestrator::new(config, cpu_services(factory), Arc::new(store)).unwrap()
}

/// Sorted file names in `dir` (empty when it does not exist)
pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(std::result::Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
