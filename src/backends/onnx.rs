//! ONNX Runtime backend
//!
//! Implements the provider probe, session factory and model store on top of
//! `ort`. Sessions registered on a GPU provider use `error_on_failure()` so a
//! failed registration is an error instead of a silent CPU session.

use crate::error::{PipelineError, Result};
use crate::providers::{ProbeReport, ProviderKind, ProviderProbe};
use crate::session::{ModelStore, PreparedModel, Session, SessionFactory, DEFAULT_MODEL};
use crate::utils::{ImagePreprocessor, ModelInputSpec};
use image::{GrayImage, Rgb, RgbImage};
use instant::{Duration, Instant};
use ndarray::Ix4;
use ort::execution_providers::{
    CUDAExecutionProvider, DirectMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
    ExecutionProviderDispatch, ROCmExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session as OrtRuntimeSession};
use ort::value::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Side length of the probe image
const PROBE_IMAGE_SIZE: u32 = 64;

/// Model files live under `{models_dir}/{name}.onnx`
#[derive(Debug, Clone)]
pub struct FsModelStore {
    models_dir: PathBuf,
}

impl FsModelStore {
    #[must_use]
    pub fn new<P: Into<PathBuf>>(models_dir: P) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    /// Store under the platform cache dir (`{cache}/cutout-pipeline/models`)
    ///
    /// # Errors
    /// - The platform has no cache directory
    pub fn default_location() -> Result<Self> {
        let cache = dirs::cache_dir()
            .ok_or_else(|| PipelineError::invalid_config("no platform cache directory for models"))?;
        Ok(Self::new(cache.join("cutout-pipeline").join("models")))
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Expected location of `model_name`, whether or not it exists
    #[must_use]
    pub fn model_path(&self, model_name: &str) -> PathBuf {
        self.models_dir.join(format!("{model_name}.onnx"))
    }

    /// Names of the `.onnx` files present, sorted
    #[must_use]
    pub fn available_models(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.models_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("onnx")))
            .filter_map(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        names
    }
}

impl ModelStore for FsModelStore {
    fn prepare(&self, model_name: &str) -> Result<PreparedModel> {
        let path = self.model_path(model_name);
        if path.is_file() {
            log::debug!("📦 Model '{model_name}' found at {}", path.display());
            Ok(PreparedModel::Path(path))
        } else {
            Err(PipelineError::model(format!(
                "model '{model_name}' not found at {} (place the .onnx file there)",
                path.display()
            )))
        }
    }

    fn resolve_path(&self, model_name: &str) -> Option<PathBuf> {
        Some(self.model_path(model_name)).filter(|p| p.is_file())
    }
}

/// Execution provider registration for `kind`; `None` for CPU
fn dispatch_for(kind: ProviderKind) -> Option<ExecutionProviderDispatch> {
    match kind {
        ProviderKind::Cuda => Some(CUDAExecutionProvider::default().build()),
        ProviderKind::DirectMl => Some(DirectMLExecutionProvider::default().build()),
        ProviderKind::Rocm => Some(ROCmExecutionProvider::default().build()),
        ProviderKind::Cpu => None,
    }
}

/// Whether the linked ONNX Runtime reports `kind` as available
fn runtime_has(kind: ProviderKind) -> bool {
    let available = match kind {
        ProviderKind::Cuda => CUDAExecutionProvider::default().is_available(),
        ProviderKind::DirectMl => DirectMLExecutionProvider::default().is_available(),
        ProviderKind::Rocm => ROCmExecutionProvider::default().is_available(),
        ProviderKind::Cpu => return true,
    };
    available.unwrap_or(false)
}

/// Every provider with its availability and a short description
#[must_use]
pub fn describe_providers() -> Vec<(ProviderKind, bool, &'static str)> {
    log::debug!("🔍 Platform: {} {}", std::env::consts::OS, std::env::consts::ARCH);
    ProviderKind::ALL
        .iter()
        .map(|&kind| {
            let description = match kind {
                ProviderKind::Cuda => "NVIDIA GPU acceleration (requires CUDA toolkit and compatible GPU)",
                ProviderKind::DirectMl => "DirectX 12 GPU acceleration (Windows)",
                ProviderKind::Rocm => "AMD GPU acceleration (requires ROCm)",
                ProviderKind::Cpu => "Always available, uses CPU for inference",
            };
            (kind, runtime_has(kind), description)
        })
        .collect()
}

/// Provider a session built for `requested` ends up executing on
///
/// Registration is strict, so a committed session runs on the requested provider
/// unless the runtime does not report that provider at all; then only the CPU
/// provider can have executed the graph.
fn registered_provider(requested: ProviderKind) -> ProviderKind {
    if requested.is_gpu() && runtime_has(requested) {
        requested
    } else {
        ProviderKind::Cpu
    }
}

/// Build a runtime session for `path` on `provider`
///
/// Returns the session and the provider it actually executes on.
fn build_session(path: &Path, provider: ProviderKind) -> Result<(OrtRuntimeSession, ProviderKind)> {
    let started = Instant::now();
    let map_err = |step: &str, e: ort::Error| {
        PipelineError::inference_error_with_provider(provider.ort_name(), step, &e.to_string())
    };

    let mut builder = OrtRuntimeSession::builder()
        .map_err(|e| map_err("create session builder", e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| map_err("set optimization level", e))?;

    if let Some(dispatch) = dispatch_for(provider) {
        builder = builder
            .with_execution_providers([dispatch.error_on_failure()])
            .map_err(|e| map_err("register execution provider", e))?;
    }

    let intra_threads = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(8);
    let session = builder
        .with_intra_threads(intra_threads)
        .map_err(|e| map_err("set intra threads", e))?
        .commit_from_file(path)
        .map_err(|e| map_err("load model", e))?;

    log::info!(
        "✅ ONNX Runtime session for {} on {} ({:.0}ms)",
        path.display(),
        provider.ort_name(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok((session, registered_provider(provider)))
}

/// Segmentation session backed by ONNX Runtime
pub struct OrtSession {
    session: Mutex<OrtRuntimeSession>,
    model_name: String,
    provider: ProviderKind,
    spec: ModelInputSpec,
}

impl std::fmt::Debug for OrtSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrtSession")
            .field("model_name", &self.model_name)
            .field("provider", &self.provider)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl OrtSession {
    /// Load `path` on `provider`; the input geometry is chosen from `model_name`
    ///
    /// # Errors
    /// - The provider cannot be registered or the model cannot be loaded
    pub fn load(path: &Path, model_name: &str, provider: ProviderKind) -> Result<Self> {
        let (session, active) = build_session(path, provider)?;
        if active != provider {
            log::warn!(
                "⚠️ {} requested but the session runs on {}",
                provider.ort_name(),
                active.ort_name()
            );
        }
        Ok(Self {
            session: Mutex::new(session),
            model_name: model_name.to_string(),
            provider: active,
            spec: ModelInputSpec::for_model(model_name),
        })
    }
}

impl Session for OrtSession {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn predict_mask(&self, image: &RgbImage) -> Result<GrayImage> {
        let (width, height) = image.dimensions();
        let inference_start = Instant::now();
        let tensor = ImagePreprocessor::to_tensor(image, &self.spec);
        log::debug!("🚀 Starting inference with input shape: {:?}", tensor.dim());

        let input_value = Value::from_array(tensor)
            .map_err(|e| PipelineError::processing(format!("Failed to convert input tensor: {e}")))?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| PipelineError::inference(format!("ONNX inference failed: {e}")))?;

        let keys: Vec<_> = outputs.keys().collect();
        let first_key = keys
            .first()
            .ok_or_else(|| PipelineError::inference("No output tensors found"))?;
        let output = outputs
            .get(first_key)
            .ok_or_else(|| PipelineError::inference("First output tensor not found"))?
            .try_extract_array::<f32>()
            .map_err(|e| PipelineError::inference(format!("Failed to extract output tensor: {e}")))?;
        let output = output.into_dimensionality::<Ix4>().map_err(|e| {
            PipelineError::inference(format!("Expected 4D output tensor: {e}"))
        })?;

        let mask = ImagePreprocessor::to_mask(output, width, height)?;
        log::debug!(
            "📊 Inference complete: {:.2}ms on {}",
            inference_start.elapsed().as_secs_f64() * 1000.0,
            self.provider.ort_name()
        );
        Ok(mask)
    }
}

/// Creates [`OrtSession`]s from the model store
#[derive(Debug, Clone)]
pub struct OrtSessionFactory {
    store: Arc<FsModelStore>,
}

impl OrtSessionFactory {
    #[must_use]
    pub fn new(store: Arc<FsModelStore>) -> Self {
        Self { store }
    }
}

impl SessionFactory for OrtSessionFactory {
    fn from_name(&self, name: &str, provider: ProviderKind) -> Result<Arc<dyn Session>> {
        let path = self.store.resolve_path(name).ok_or_else(|| {
            PipelineError::model(format!(
                "model '{name}' is not in {}",
                self.store.models_dir().display()
            ))
        })?;
        Ok(Arc::new(OrtSession::load(&path, name, provider)?))
    }

    fn from_path(&self, path: &Path, provider: ProviderKind) -> Result<Arc<dyn Session>> {
        if !path.is_file() {
            return Err(PipelineError::model(format!(
                "model file {} does not exist",
                path.display()
            )));
        }
        let name = path
            .file_stem()
            .map_or_else(|| DEFAULT_MODEL.to_string(), |s| s.to_string_lossy().into_owned());
        Ok(Arc::new(OrtSession::load(path, &name, provider)?))
    }
}

/// Verifies providers by loading a real model and running one small inference
#[derive(Debug, Clone)]
pub struct OrtProviderProbe {
    store: Arc<FsModelStore>,
}

impl OrtProviderProbe {
    #[must_use]
    pub fn new(store: Arc<FsModelStore>) -> Self {
        Self { store }
    }

    /// Model used for probing: the default model, else any model present
    fn probe_model(&self) -> Option<(PathBuf, String)> {
        if let Some(path) = self.store.resolve_path(DEFAULT_MODEL) {
            return Some((path, DEFAULT_MODEL.to_string()));
        }
        self.store
            .available_models()
            .into_iter()
            .next()
            .map(|name| (self.store.model_path(&name), name))
    }
}

impl ProviderProbe for OrtProviderProbe {
    fn available_providers(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .iter()
            .copied()
            .filter(|&kind| {
                let available = runtime_has(kind);
                log::debug!(
                    "{} {} execution provider",
                    if available { "✅" } else { "❌" },
                    kind.ort_name()
                );
                available
            })
            .collect()
    }

    /// Commit a session on `kind` and run one inference through it
    ///
    /// Confirmation comes from the strict `error_on_failure()` registration: a
    /// provider that cannot take the graph fails the commit instead of leaving it
    /// on CPU. `active` is the provider the committed session registered, which is
    /// CPU when the runtime does not report `kind` as available.
    fn verify(&self, kind: ProviderKind, budget: Duration) -> Result<ProbeReport> {
        let started = Instant::now();
        let (path, name) = self.probe_model().ok_or_else(|| {
            PipelineError::model(format!(
                "no model in {} to probe {} with",
                self.store.models_dir().display(),
                kind.ort_name()
            ))
        })?;

        // Strict registration: success means the provider really runs the graph
        let session = OrtSession::load(&path, &name, kind).map_err(|e| PipelineError::ProviderUnconfirmed {
            provider: kind.ort_name().to_string(),
            reason: e.to_string(),
        })?;
        let probe = RgbImage::from_pixel(PROBE_IMAGE_SIZE, PROBE_IMAGE_SIZE, Rgb([255, 255, 255]));
        session.predict_mask(&probe)?;

        let elapsed = started.elapsed();
        if elapsed > budget {
            log::warn!(
                "⚠️ {} probe took {:.0}ms, over the {:.0}ms budget",
                kind.ort_name(),
                elapsed.as_secs_f64() * 1000.0,
                budget.as_secs_f64() * 1000.0
            );
        }
        Ok(ProbeReport {
            requested: kind,
            active: session.provider(),
            elapsed,
        })
    }
}
