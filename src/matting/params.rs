//! Alpha matting parameters and the contrast-based recommendation heuristic

use image::RgbImage;
use std::fmt;

/// Parameters for one alpha matting attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlphaMattingParams {
    /// Mask values above this are definite foreground
    pub foreground_threshold: u8,
    /// Mask values below this are definite background
    pub background_threshold: u8,
    /// Square erosion kernel applied to both definite regions
    pub erode_size: u32,
    /// Alpha within this distance of 0 or 1 is snapped
    pub discard_threshold: f64,
    /// Diagonal regularisation of the local colour covariance
    pub shift: f64,
}

impl Default for AlphaMattingParams {
    fn default() -> Self {
        ContrastBucket::Medium.baseline()
    }
}

impl fmt::Display for AlphaMattingParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fg={} bg={} erode={} discard={:e} shift={}",
            self.foreground_threshold,
            self.background_threshold,
            self.erode_size,
            self.discard_threshold,
            self.shift
        )
    }
}

impl AlphaMattingParams {
    #[must_use]
    pub fn with_shift(mut self, shift: f64) -> Self {
        self.shift = shift;
        self
    }

    #[must_use]
    pub fn with_discard_threshold(mut self, discard_threshold: f64) -> Self {
        self.discard_threshold = discard_threshold;
        self
    }
}

/// Contrast class of an input image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContrastBucket {
    Low,
    Medium,
    High,
}

impl ContrastBucket {
    /// Starting parameters for this bucket
    #[must_use]
    pub fn baseline(self) -> AlphaMattingParams {
        match self {
            Self::Low => AlphaMattingParams {
                foreground_threshold: 220,
                background_threshold: 20,
                erode_size: 15,
                discard_threshold: 1e-4,
                shift: 0.02,
            },
            Self::Medium => AlphaMattingParams {
                foreground_threshold: 240,
                background_threshold: 10,
                erode_size: 10,
                discard_threshold: 1e-4,
                shift: 0.01,
            },
            Self::High => AlphaMattingParams {
                foreground_threshold: 250,
                background_threshold: 5,
                erode_size: 5,
                discard_threshold: 1e-4,
                shift: 0.001,
            },
        }
    }
}

/// Grayscale statistics of an image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageStatistics {
    pub min: u8,
    pub max: u8,
    pub mean: f64,
    pub std_dev: f64,
    /// `(max - min) / 255`
    pub contrast_ratio: f64,
}

impl ImageStatistics {
    #[must_use]
    pub fn bucket(&self) -> ContrastBucket {
        if self.contrast_ratio < 0.4 || self.std_dev < 30.0 {
            ContrastBucket::Low
        } else if self.contrast_ratio < 0.7 {
            ContrastBucket::Medium
        } else {
            ContrastBucket::High
        }
    }
}

/// ITU-R 601 luma, rounded like an 8-bit grayscale conversion
fn luma(pixel: [u8; 3]) -> u8 {
    let [r, g, b] = pixel.map(u32::from);
    ((r * 299 + g * 587 + b * 114 + 500) / 1000) as u8
}

/// Compute grayscale statistics for an image
///
/// An empty image yields all-zero statistics.
#[must_use]
pub fn image_statistics(image: &RgbImage) -> ImageStatistics {
    let count = u64::from(image.width()) * u64::from(image.height());
    if count == 0 {
        return ImageStatistics {
            min: 0,
            max: 0,
            mean: 0.0,
            std_dev: 0.0,
            contrast_ratio: 0.0,
        };
    }

    let mut min = u8::MAX;
    let mut max = u8::MIN;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for pixel in image.pixels() {
        let value = luma(pixel.0);
        min = min.min(value);
        max = max.max(value);
        let v = f64::from(value);
        sum += v;
        sum_sq += v * v;
    }

    let n = count as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    ImageStatistics {
        min,
        max,
        mean,
        std_dev: variance.sqrt(),
        contrast_ratio: f64::from(max - min) / 255.0,
    }
}

/// Pick the baseline matting parameters from image contrast
///
/// The contrast bucket, not the raw statistics, seeds the first attempt.
#[must_use]
pub fn recommend_alpha_matting_params(image: &RgbImage) -> AlphaMattingParams {
    let stats = image_statistics(image);
    let bucket = stats.bucket();
    tracing::debug!(
        min = stats.min,
        max = stats.max,
        mean = stats.mean,
        std_dev = stats.std_dev,
        contrast = stats.contrast_ratio,
        ?bucket,
        "alpha matting recommendation"
    );
    bucket.baseline()
}

/// Human-readable explanation of an alpha matting failure
#[must_use]
pub fn explain_alpha_matting_error(error_message: &str) -> String {
    let detail = if error_message.contains("Cholesky decomposition failed") {
        "numerical instability. The local colour covariance is not positive-definite, \
         which usually means very low contrast between foreground and background or very \
         complex edges. A larger shift regularises the system."
            .to_string()
    } else if error_message.contains("discard_threshold") {
        "the parameters need adjustment. The discard_threshold is too high or the shift \
         is too low for this image. Relax the parameters or disable alpha matting."
            .to_string()
    } else {
        format!("unknown alpha matting error: {error_message}")
    };
    format!("Error during alpha matting: {detail}")
}
