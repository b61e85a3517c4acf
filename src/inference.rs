//! Explicit inference state owned by the orchestrator
//!
//! Provider selection, model preparation and session creation happen once per batch
//! and live in an [`InferenceContext`] that is passed by reference. No session or
//! model state is kept in globals.

use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::providers::{ProviderKind, ProviderProbe, ProviderSelection, ProviderSelector};
use crate::session::{
    ModelSelector, ModelStore, PreparedModel, Session, SessionChain, SessionFactory,
    SessionNotice, SessionOutcome,
};
use image::{Rgb, RgbImage};
use instant::{Duration, Instant};
use std::fmt;
use std::sync::Arc;

/// Side length of the warm-up image
pub const WARM_UP_SIZE: u32 = 64;

/// Warm-up slower than this on a GPU provider suggests silent CPU execution
pub const SLOW_GPU_WARM_UP: Duration = Duration::from_secs(1);

/// Collaborators that produce inference sessions
#[derive(Clone)]
pub struct InferenceServices {
    pub probe: Arc<dyn ProviderProbe>,
    pub sessions: Arc<dyn SessionFactory>,
    pub models: Arc<dyn ModelStore>,
}

impl fmt::Debug for InferenceServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceServices").finish_non_exhaustive()
    }
}

impl InferenceServices {
    #[must_use]
    pub fn new(
        probe: Arc<dyn ProviderProbe>,
        sessions: Arc<dyn SessionFactory>,
        models: Arc<dyn ModelStore>,
    ) -> Self {
        Self {
            probe,
            sessions,
            models,
        }
    }

    /// ONNX Runtime services reading models from `models_dir` (or the default cache)
    ///
    /// # Errors
    /// - No models directory could be determined
    #[cfg(feature = "onnx")]
    pub fn onnx(models_dir: Option<std::path::PathBuf>) -> Result<Self> {
        use crate::backends::onnx::{FsModelStore, OrtProviderProbe, OrtSessionFactory};

        let store = match models_dir {
            Some(dir) => FsModelStore::new(dir),
            None => FsModelStore::default_location()?,
        };
        let store = Arc::new(store);
        Ok(Self::new(
            Arc::new(OrtProviderProbe::new(store.clone())),
            Arc::new(OrtSessionFactory::new(store.clone())),
            store,
        ))
    }
}

/// Provider choice and model preparation, before a session exists
#[derive(Debug, Clone)]
pub struct ModelPreparation {
    pub selection: ProviderSelection,
    /// `None` when preparation was skipped or failed
    pub prepared: Option<PreparedModel>,
}

/// Session and provider used for every image of a batch
#[derive(Clone)]
pub struct InferenceContext {
    selection: ProviderSelection,
    outcome: SessionOutcome,
    prepared: Option<PreparedModel>,
    warm_up: Option<Duration>,
}

impl fmt::Debug for InferenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceContext")
            .field("provider", &self.provider())
            .field("model", &self.model_name())
            .field("notice", &self.outcome.notice)
            .field("warm_up", &self.warm_up)
            .finish_non_exhaustive()
    }
}

impl InferenceContext {
    /// Select a provider and prepare the model
    ///
    /// A model store failure is logged and tolerated; the session chain still runs.
    #[must_use]
    pub fn prepare_model(services: &InferenceServices, config: &OrchestratorConfig) -> ModelPreparation {
        let selection = ProviderSelector::new(services.probe.clone())
            .with_budget(config.probe_budget)
            .with_preference(config.provider)
            .select();

        let prepared = match &config.model {
            ModelSelector::Name(name) => match services.models.prepare(name) {
                Ok(prepared) => {
                    tracing::debug!(model = %name, ?prepared, "model prepared");
                    Some(prepared)
                },
                Err(e) => {
                    tracing::warn!(
                        model = %name,
                        error = %e,
                        "model preparation failed, continuing with session fallbacks"
                    );
                    None
                },
            },
            ModelSelector::Path(_) | ModelSelector::Unresolved => None,
        };

        ModelPreparation {
            selection,
            prepared,
        }
    }

    /// Create the session on the selected provider and optionally warm it up
    ///
    /// # Errors
    /// - [`crate::PipelineError::SessionExhausted`] when no model could be loaded
    pub fn load(
        services: &InferenceServices,
        config: &OrchestratorConfig,
        preparation: ModelPreparation,
    ) -> Result<Self> {
        let chain = SessionChain::new(services.sessions.clone(), services.models.clone());
        let outcome = chain.create_session_with(
            &config.model,
            preparation.selection.candidate.kind,
            preparation.prepared.as_ref(),
        )?;
        let warm_up = config.warm_up.then(|| warm_up(outcome.session.as_ref())).flatten();

        Ok(Self {
            selection: preparation.selection,
            outcome,
            prepared: preparation.prepared,
            warm_up,
        })
    }

    /// [`Self::prepare_model`] followed by [`Self::load`]
    ///
    /// # Errors
    /// - See [`Self::load`]
    pub fn prepare(services: &InferenceServices, config: &OrchestratorConfig) -> Result<Self> {
        let preparation = Self::prepare_model(services, config);
        Self::load(services, config, preparation)
    }

    #[must_use]
    pub fn session(&self) -> Arc<dyn Session> {
        self.outcome.session.clone()
    }

    #[must_use]
    pub fn provider(&self) -> ProviderKind {
        self.outcome.session.provider()
    }

    #[must_use]
    pub fn model_name(&self) -> &str {
        self.outcome.session.model_name()
    }

    /// Fallback notice when the session is not the requested model by name
    #[must_use]
    pub fn notice(&self) -> Option<&SessionNotice> {
        self.outcome.notice.as_ref()
    }

    #[must_use]
    pub fn selection(&self) -> &ProviderSelection {
        &self.selection
    }

    #[must_use]
    pub fn prepared_model(&self) -> Option<&PreparedModel> {
        self.prepared.as_ref()
    }

    #[must_use]
    pub fn warm_up_time(&self) -> Option<Duration> {
        self.warm_up
    }
}

/// Run one small inference so the first real image does not pay initialisation cost
///
/// Failures are logged only; the real inference reports its own errors.
fn warm_up(session: &dyn Session) -> Option<Duration> {
    let image = RgbImage::from_pixel(WARM_UP_SIZE, WARM_UP_SIZE, Rgb([255, 255, 255]));
    let start = Instant::now();
    match session.predict_mask(&image) {
        Ok(_) => {
            let elapsed = start.elapsed();
            let provider = session.provider();
            if provider.is_gpu() && elapsed > SLOW_GPU_WARM_UP {
                tracing::warn!(
                    %provider,
                    elapsed_ms = elapsed.as_millis(),
                    "slow warm-up, the session may be running on CPU"
                );
            } else {
                tracing::debug!(%provider, elapsed_ms = elapsed.as_millis(), "session warmed up");
            }
            Some(elapsed)
        },
        Err(e) => {
            tracing::warn!(error = %e, "warm-up inference failed");
            None
        },
    }
}
