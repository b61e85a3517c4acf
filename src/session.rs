//! Inference sessions and the session creation fallback chain
//!
//! A model can be requested by symbolic name, by file path, or not at all. The
//! chain tries the name, then the on-disk path, then a small family of known-safe
//! models. Every substitution produces a [`SessionNotice`] so that a different
//! model than the one requested is never used silently.

use crate::error::{PipelineError, Result};
use crate::providers::ProviderKind;
use image::{GrayImage, RgbImage};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Model used when nothing else is requested
pub const DEFAULT_MODEL: &str = "isnet-general-use";

/// Fallback models, tried by substring match first, then in this order
pub const SAFE_FAMILY_MODELS: [&str; 4] = ["isnet-general-use", "u2net", "u2netp", "silueta"];

/// How the caller identifies the model
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelSelector {
    /// Symbolic model name, e.g. `isnet-general-use`
    Name(String),
    /// Explicit model file
    Path(PathBuf),
    /// Selection could not be resolved; only the safe family is tried
    Unresolved,
}

impl Default for ModelSelector {
    fn default() -> Self {
        Self::Name(DEFAULT_MODEL.to_string())
    }
}

impl fmt::Display for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "{name}"),
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Unresolved => write!(f, "<unresolved>"),
        }
    }
}

impl ModelSelector {
    /// Interpret user input: file-like strings become paths, blank input is unresolved
    #[must_use]
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::Unresolved;
        }
        let path = Path::new(trimmed);
        let has_extension = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
        if has_extension || trimmed.contains('/') || trimmed.contains('\\') {
            Self::Path(path.to_path_buf())
        } else {
            Self::Name(trimmed.to_string())
        }
    }

    /// Name used for substring matching against the safe family
    #[must_use]
    pub fn requested_name(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Path(path) => path
                .file_stem()
                .map_or_else(|| path.display().to_string(), |s| s.to_string_lossy().into_owned()),
            Self::Unresolved => self.to_string(),
        }
    }
}

/// A loaded model ready for inference
pub trait Session: Send + Sync {
    /// Name of the model actually loaded
    fn model_name(&self) -> &str;

    /// Provider the session runs on
    fn provider(&self) -> ProviderKind;

    /// Predict a foreground mask; the result may differ in size from the input
    ///
    /// # Errors
    /// - Inference failed
    fn predict_mask(&self, image: &RgbImage) -> Result<GrayImage>;
}

/// Creates sessions from names or files
pub trait SessionFactory: Send + Sync {
    /// # Errors
    /// - Name is unknown or the model cannot be loaded
    fn from_name(&self, name: &str, provider: ProviderKind) -> Result<Arc<dyn Session>>;

    /// # Errors
    /// - File is missing or is not a loadable model
    fn from_path(&self, path: &Path, provider: ProviderKind) -> Result<Arc<dyn Session>>;
}

/// What [`ModelStore::prepare`] produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedModel {
    Path(PathBuf),
    Symbolic(String),
}

/// Local model storage; preparation may block on a download
pub trait ModelStore: Send + Sync {
    /// Make the model available locally
    ///
    /// # Errors
    /// - Model cannot be made available (the chain still runs)
    fn prepare(&self, model_name: &str) -> Result<PreparedModel>;

    /// On-disk location of a model, if known
    fn resolve_path(&self, model_name: &str) -> Option<PathBuf>;
}

/// Which link of the chain produced the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FallbackStep {
    ByName,
    ByPath,
    Family,
}

impl fmt::Display for FallbackStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ByName => write!(f, "by name"),
            Self::ByPath => write!(f, "by file path"),
            Self::Family => write!(f, "safe family fallback"),
        }
    }
}

/// User-visible notice that the chain fell back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotice {
    pub requested: String,
    pub used: String,
    pub step: FallbackStep,
}

impl fmt::Display for SessionNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.requested == self.used {
            write!(f, "Model '{}' loaded {}", self.used, self.step)
        } else {
            write!(
                f,
                "Model '{}' used instead of requested '{}' ({})",
                self.used, self.requested, self.step
            )
        }
    }
}

/// One failed link of the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAttempt {
    pub step: FallbackStep,
    pub target: String,
    pub error: String,
}

/// Session produced by the chain plus how it got there
#[derive(Clone)]
pub struct SessionOutcome {
    pub session: Arc<dyn Session>,
    pub notice: Option<SessionNotice>,
    pub failed_attempts: Vec<SessionAttempt>,
}

impl fmt::Debug for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOutcome")
            .field("model", &self.session.model_name())
            .field("provider", &self.session.provider())
            .field("notice", &self.notice)
            .field("failed_attempts", &self.failed_attempts)
            .finish()
    }
}

/// Fallback models for `requested`: substring matches first, otherwise all
#[must_use]
pub fn family_candidates(requested: &str) -> Vec<&'static str> {
    let requested = requested.to_ascii_lowercase();
    let others = SAFE_FAMILY_MODELS
        .into_iter()
        .filter(|model| *model != requested);
    let matched: Vec<&'static str> = others
        .clone()
        .filter(|model| model.contains(requested.as_str()) || requested.contains(model))
        .collect();
    if matched.is_empty() {
        others.collect()
    } else {
        matched
    }
}

/// Session creation fallback chain
#[derive(Clone)]
pub struct SessionChain {
    factory: Arc<dyn SessionFactory>,
    store: Arc<dyn ModelStore>,
}

impl fmt::Debug for SessionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionChain").finish_non_exhaustive()
    }
}

impl SessionChain {
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>, store: Arc<dyn ModelStore>) -> Self {
        Self { factory, store }
    }

    /// Create a session for `selector` on `provider`
    ///
    /// # Errors
    /// - [`PipelineError::SessionExhausted`] when every link of the chain failed
    pub fn create_session(
        &self,
        selector: &ModelSelector,
        provider: ProviderKind,
    ) -> Result<SessionOutcome> {
        self.create_session_with(selector, provider, None)
    }

    /// [`Self::create_session`] with the result of [`ModelStore::prepare`]
    ///
    /// A prepared file path is the by-path candidate for a named model; the
    /// store's `resolve_path` is consulted only when preparation gave no path.
    ///
    /// # Errors
    /// - [`PipelineError::SessionExhausted`] when every link of the chain failed
    pub fn create_session_with(
        &self,
        selector: &ModelSelector,
        provider: ProviderKind,
        prepared: Option<&PreparedModel>,
    ) -> Result<SessionOutcome> {
        let requested = selector.requested_name();
        let _span = tracing::info_span!("create_session", model = %requested, %provider).entered();
        let mut failures: Vec<SessionAttempt> = Vec::new();

        let mut record = |step: FallbackStep, target: String, error: &PipelineError| {
            tracing::warn!(%step, %target, %error, "session creation failed");
            failures.push(SessionAttempt {
                step,
                target,
                error: error.to_string(),
            });
        };

        // 1. By symbolic name
        if let ModelSelector::Name(name) = selector {
            match self.factory.from_name(name, provider) {
                Ok(session) => {
                    return Ok(self.finish(session, &requested, FallbackStep::ByName, failures));
                },
                Err(e) => record(FallbackStep::ByName, name.clone(), &e),
            }
        }

        // 2. By resolved on-disk path
        let path = match selector {
            ModelSelector::Path(path) => Some(path.clone()),
            ModelSelector::Name(name) => match prepared {
                Some(PreparedModel::Path(path)) => Some(path.clone()),
                _ => self.store.resolve_path(name),
            },
            ModelSelector::Unresolved => None,
        };
        if let Some(path) = path {
            match self.factory.from_path(&path, provider) {
                Ok(session) => {
                    return Ok(self.finish(session, &requested, FallbackStep::ByPath, failures));
                },
                Err(e) => record(FallbackStep::ByPath, path.display().to_string(), &e),
            }
        }

        // 3. Safe family
        for model in family_candidates(&requested) {
            match self.factory.from_name(model, provider) {
                Ok(session) => {
                    return Ok(self.finish(session, &requested, FallbackStep::Family, failures));
                },
                Err(e) => record(FallbackStep::Family, model.to_string(), &e),
            }
            if let Some(path) = self.store.resolve_path(model) {
                match self.factory.from_path(&path, provider) {
                    Ok(session) => {
                        return Ok(self.finish(session, &requested, FallbackStep::Family, failures));
                    },
                    Err(e) => record(FallbackStep::Family, path.display().to_string(), &e),
                }
            }
        }

        tracing::error!(model = %requested, attempts = failures.len(), "all session fallbacks exhausted");
        Err(PipelineError::SessionExhausted {
            requested,
            attempts: failures.len(),
        })
    }

    #[allow(clippy::unused_self)]
    fn finish(
        &self,
        session: Arc<dyn Session>,
        requested: &str,
        step: FallbackStep,
        failed_attempts: Vec<SessionAttempt>,
    ) -> SessionOutcome {
        let used = session.model_name().to_string();
        let notice = (step != FallbackStep::ByName).then(|| SessionNotice {
            requested: requested.to_string(),
            used: used.clone(),
            step,
        });
        match &notice {
            Some(notice) => tracing::warn!(%notice, "session fallback"),
            None => tracing::info!(model = %used, provider = %session.provider(), "session created"),
        }
        SessionOutcome {
            session,
            notice,
            failed_attempts,
        }
    }
}
