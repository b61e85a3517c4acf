//! Error types for the cutout pipeline

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// How the orchestrator reacts to a failure.
///
/// Every [`PipelineError`] belongs to exactly one class; the orchestrator decides
/// whether to continue, skip a stage or fail the current image from the class alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// A cheaper alternative exists (CPU provider, next matting parameters, family model)
    RecoverableWithFallback,
    /// The stage is skipped and the pre-stage artifact stays the output
    RecoverableWithSkip,
    /// The current image is marked failed, the batch continues
    ImageFatal,
    /// Logged and retried later, never blocks progress
    Warning,
}

/// Closed error taxonomy for the pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or encoding errors
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unsupported file format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Input exists but cannot be decoded into a usable image
    #[error("Corrupt input '{path}': {reason}")]
    CorruptInput { path: PathBuf, reason: String },

    /// Model preparation or resolution errors
    #[error("Model error: {0}")]
    Model(String),

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// A GPU provider did not prove that it actually executed
    #[error("Provider {provider} not confirmed: {reason}")]
    ProviderUnconfirmed { provider: String, reason: String },

    /// One alpha matting attempt failed numerically
    #[error("Alpha matting failed: {0}")]
    MattingFailed(String),

    /// Every session creation fallback failed
    #[error("No session could be created for '{requested}' after {attempts} attempts")]
    SessionExhausted { requested: String, attempts: usize },

    /// Inference did not finish within the per-image budget
    #[error("timeout: inference exceeded {seconds}s")]
    Timeout { seconds: u64 },

    /// Crop, solid background or JPG export failed
    #[error("Optional stage '{stage}' skipped: {reason}")]
    OptionalStage { stage: String, reason: String },

    /// Temporary artifact could not be removed
    #[error("Cleanup of '{path}' failed: {reason}")]
    Cleanup { path: PathBuf, reason: String },

    /// Cooperative cancellation observed at a stage checkpoint
    #[error("Processing cancelled")]
    Cancelled,

    /// Generic stage processing errors
    #[error("Processing error: {0}")]
    Processing(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new unsupported format error
    pub fn unsupported_format<S: Into<String>>(format: S) -> Self {
        Self::UnsupportedFormat(format.into())
    }

    /// Create a new model error
    pub fn model<S: Into<String>>(msg: S) -> Self {
        Self::Model(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new alpha matting error
    pub fn matting<S: Into<String>>(msg: S) -> Self {
        Self::MattingFailed(msg.into())
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an optional-stage error that the orchestrator turns into a skip
    pub fn optional_stage<S: Into<String>, R: Into<String>>(stage: S, reason: R) -> Self {
        Self::OptionalStage {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create a cleanup warning for the given path
    pub fn cleanup<P: AsRef<Path>, R: Into<String>>(path: P, reason: R) -> Self {
        Self::Cleanup {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Create a corrupt input error for the given path
    pub fn corrupt_input<P: AsRef<Path>, R: Into<String>>(path: P, reason: R) -> Self {
        Self::CorruptInput {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    // Enhanced contextual error creators

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<Path>>(operation: &str, path: P, error: &std::io::Error) -> Self {
        let path_display = path.as_ref().display();
        Self::Io(std::io::Error::new(
            error.kind(),
            format!("Failed to {operation} '{path_display}': {error}"),
        ))
    }

    /// Create image loading error, classifying undecodable data as corrupt input
    pub fn image_load_error<P: AsRef<Path>>(path: P, error: image::ImageError) -> Self {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        match error {
            image::ImageError::Unsupported(e) => Self::UnsupportedFormat(format!(
                "'{}' (format: {extension}): {e}. Supported formats: PNG, JPEG, WebP, BMP",
                path.as_ref().display()
            )),
            image::ImageError::IoError(e) => Self::file_io_error("read image", path, &e),
            other => Self::corrupt_input(path, other.to_string()),
        }
    }

    /// Create configuration error with valid ranges
    pub fn config_value_error<T: std::fmt::Display>(
        parameter: &str,
        value: T,
        valid_range: &str,
        recommended: Option<T>,
    ) -> Self {
        let recommendation = match recommended {
            Some(rec) => format!(" Recommended: {rec}"),
            None => String::new(),
        };

        Self::InvalidConfig(format!(
            "Invalid {parameter}: {value} (valid range: {valid_range}).{recommendation}"
        ))
    }

    /// Create inference error with provider context
    pub fn inference_error_with_provider(provider: &str, operation: &str, error: &str) -> Self {
        Self::Inference(format!("{operation} failed using '{provider}' provider: {error}"))
    }

    /// Create processing error with stage context
    pub fn processing_stage_error(stage: &str, details: &str, input_info: Option<&str>) -> Self {
        let input_context = match input_info {
            Some(info) => format!(" (input: {info})"),
            None => String::new(),
        };

        Self::Processing(format!(
            "Processing failed at stage '{stage}'{input_context}: {details}"
        ))
    }

    /// Classify this error within the pipeline taxonomy
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ProviderUnconfirmed { .. } | Self::MattingFailed(_) | Self::Model(_) => {
                ErrorClass::RecoverableWithFallback
            },
            Self::OptionalStage { .. } => ErrorClass::RecoverableWithSkip,
            Self::Cleanup { .. } => ErrorClass::Warning,
            Self::Io(_)
            | Self::Image(_)
            | Self::InvalidConfig(_)
            | Self::UnsupportedFormat(_)
            | Self::CorruptInput { .. }
            | Self::Inference(_)
            | Self::SessionExhausted { .. }
            | Self::Timeout { .. }
            | Self::Cancelled
            | Self::Processing(_)
            | Self::Internal(_) => ErrorClass::ImageFatal,
        }
    }

    /// Whether this error is the timeout failure
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
