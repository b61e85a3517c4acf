//! Retry engine for alpha matting

use super::params::{explain_alpha_matting_error, recommend_alpha_matting_params, AlphaMattingParams};
use super::solver::GuidedFilterMatting;
use super::MattingBackend;
use crate::error::Result;
use crate::providers::ProviderKind;
use crate::session::Session;
use image::imageops::{self, FilterType};
use image::{GrayImage, Rgba, RgbImage, RgbaImage};
use std::sync::Arc;

/// Number of parameter sets in the relaxation schedule
pub const MATTING_ATTEMPTS: usize = 5;

/// One failed matting attempt
#[derive(Debug, Clone, PartialEq)]
pub struct MattingFailure {
    /// 1-based attempt number
    pub attempt: usize,
    pub params: AlphaMattingParams,
    pub error: String,
}

/// Outcome of the matting pass for one image
#[derive(Debug, Clone, PartialEq)]
pub enum MattingStatus {
    /// Attempt `attempt` succeeded after `prior_failures`
    Applied {
        attempt: usize,
        params: AlphaMattingParams,
        prior_failures: Vec<MattingFailure>,
    },
    /// Every attempt failed; the cutout uses the unmatted model mask
    Unavailable { failures: Vec<MattingFailure> },
    /// Matting was switched off for this run
    Disabled,
}

impl MattingStatus {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Failures recorded before the final outcome
    #[must_use]
    pub fn failures(&self) -> &[MattingFailure] {
        match self {
            Self::Applied { prior_failures, .. } => prior_failures,
            Self::Unavailable { failures } => failures,
            Self::Disabled => &[],
        }
    }

    /// Short status line for progress messages
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Applied { attempt, .. } => format!("alpha matting applied (attempt {attempt})"),
            Self::Unavailable { failures } => format!(
                "matting unavailable, returned unmatted cutout ({} attempts failed)",
                failures.len()
            ),
            Self::Disabled => "alpha matting disabled".to_string(),
        }
    }
}

/// Background-removed image with the masks that produced it
#[derive(Debug, Clone)]
pub struct CutoutImage {
    /// Original RGB with the final alpha
    pub image: RgbaImage,
    /// Final alpha (matted when matting was applied)
    pub alpha: GrayImage,
    /// Mask as predicted by the model, resized to the input
    pub model_mask: GrayImage,
    pub provider: ProviderKind,
    pub model_name: String,
    pub matting: MattingStatus,
}

/// Combine RGB and an alpha mask of the same size
#[must_use]
pub fn cutout_from_alpha(image: &RgbImage, alpha: &GrayImage) -> RgbaImage {
    RgbaImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        Rgba([r, g, b, alpha.get_pixel(x, y).0[0]])
    })
}

/// Wraps alpha matting with a fixed five-step relaxation schedule
#[derive(Clone)]
pub struct AlphaMattingRetryEngine {
    backend: Arc<dyn MattingBackend>,
    enabled: bool,
}

impl std::fmt::Debug for AlphaMattingRetryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlphaMattingRetryEngine")
            .field("backend", &self.backend.name())
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl Default for AlphaMattingRetryEngine {
    fn default() -> Self {
        Self::new(Arc::new(GuidedFilterMatting::new()))
    }
}

impl AlphaMattingRetryEngine {
    #[must_use]
    pub fn new(backend: Arc<dyn MattingBackend>) -> Self {
        Self {
            backend,
            enabled: true,
        }
    }

    /// Turn matting on or off; a disabled engine still produces cutouts
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// The five parameter sets tried in order, seeded by `base`
    #[must_use]
    pub fn attempt_schedule(base: AlphaMattingParams) -> [AlphaMattingParams; MATTING_ATTEMPTS] {
        [
            base,
            base.with_shift(0.02),
            base.with_shift(0.05),
            base.with_discard_threshold(1e-5).with_shift(0.01),
            base.with_discard_threshold(1e-6).with_shift(0.1),
        ]
    }

    /// Refine `mask` with the first parameter set that succeeds
    ///
    /// Returns the model mask unchanged with [`MattingStatus::Unavailable`] when every
    /// attempt fails.
    #[must_use]
    pub fn refine_mask(&self, image: &RgbImage, mask: &GrayImage) -> (GrayImage, MattingStatus) {
        if !self.enabled {
            return (mask.clone(), MattingStatus::Disabled);
        }

        let base = recommend_alpha_matting_params(image);
        let mut failures = Vec::new();
        for (index, params) in Self::attempt_schedule(base).into_iter().enumerate() {
            let attempt = index + 1;
            match self.backend.estimate_alpha(image, mask, &params) {
                Ok(alpha) => {
                    tracing::info!(
                        attempt,
                        backend = self.backend.name(),
                        %params,
                        "alpha matting succeeded"
                    );
                    return (
                        alpha,
                        MattingStatus::Applied {
                            attempt,
                            params,
                            prior_failures: failures,
                        },
                    );
                },
                Err(e) => {
                    let error = e.to_string();
                    tracing::warn!(
                        attempt,
                        %params,
                        explanation = %explain_alpha_matting_error(&error),
                        "alpha matting attempt failed"
                    );
                    failures.push(MattingFailure {
                        attempt,
                        params,
                        error,
                    });
                },
            }
        }

        tracing::warn!(
            attempts = failures.len(),
            "matting unavailable, returned unmatted cutout"
        );
        (mask.clone(), MattingStatus::Unavailable { failures })
    }

    /// Predict the mask with `session`, then refine it with alpha matting
    ///
    /// Always yields a valid cutout once the model prediction succeeds; matting
    /// failures only degrade the edge quality and are reported in
    /// [`CutoutImage::matting`].
    ///
    /// # Errors
    /// - Model inference failed
    pub fn remove_background_with_matting(
        &self,
        image: &RgbImage,
        session: &dyn Session,
    ) -> Result<CutoutImage> {
        let (width, height) = image.dimensions();
        let mut mask = session.predict_mask(image)?;
        let (mask_width, mask_height) = mask.dimensions();
        if (mask_width, mask_height) != (width, height) {
            if mask_width > width * 2 || mask_height > height * 2 {
                tracing::warn!(
                    output = ?(mask_width, mask_height),
                    input = ?(width, height),
                    "abnormal output size from model, resizing to input"
                );
            } else {
                tracing::debug!(
                    output = ?(mask_width, mask_height),
                    input = ?(width, height),
                    "mask size differs from input, resizing"
                );
            }
            mask = imageops::resize(&mask, width, height, FilterType::Lanczos3);
        }

        let (alpha, matting) = self.refine_mask(image, &mask);
        Ok(CutoutImage {
            image: cutout_from_alpha(image, &alpha),
            alpha,
            model_mask: mask,
            provider: session.provider(),
            model_name: session.model_name().to_string(),
            matting,
        })
    }
}
