//! Alpha matting with progressive parameter relaxation
//!
//! Matting refines the soft edge of a model mask using the image colours. It is a
//! quality enhancement only: [`AlphaMattingRetryEngine`] walks a fixed schedule of
//! increasingly relaxed parameter sets and, if every attempt fails, hands back the
//! unmatted cutout with an explicit status instead of an error.

pub mod params;
pub mod retry;
pub mod solver;

pub use params::{
    explain_alpha_matting_error, image_statistics, recommend_alpha_matting_params,
    AlphaMattingParams, ContrastBucket, ImageStatistics,
};
pub use retry::{cutout_from_alpha, AlphaMattingRetryEngine, CutoutImage, MattingFailure, MattingStatus};
pub use solver::{build_trimap, GuidedFilterMatting};

use crate::error::Result;
use image::{GrayImage, RgbImage};

/// Alpha estimation backend used by the retry engine
pub trait MattingBackend: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Estimate a refined alpha for `image` from the model `mask`
    ///
    /// # Errors
    /// - [`crate::PipelineError::MattingFailed`] on numerical failure for these parameters
    fn estimate_alpha(
        &self,
        image: &RgbImage,
        mask: &GrayImage,
        params: &AlphaMattingParams,
    ) -> Result<GrayImage>;
}
