//! Mask levels adjustment
//!
//! Black/mid/white-point remapping of a single-channel mask. Settings near the ends
//! of the range make the gamma curve degenerate, so those switch to a hard binary
//! threshold. Both the preview lookup table and the full render go through
//! [`levels_lut`], which keeps the two branches identical at every call site.

use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Guards against `v * 255.0` landing a hair below an integer before truncation
const SNAP_TOLERANCE: f64 = 1e-3;

/// Black, mid and white points of a levels adjustment
///
/// Ordering between the three points is not enforced; inverted ranges are
/// clamped by the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelsParams {
    pub black_point: u8,
    pub mid_point: u8,
    pub white_point: u8,
}

impl Default for LevelsParams {
    fn default() -> Self {
        Self::new(0, 80, 230)
    }
}

impl LevelsParams {
    /// Parameters that leave a mask unchanged
    pub const IDENTITY: Self = Self::new(0, 128, 255);

    /// Fixed constants used to refine foreground alpha before compositing
    pub const EDGE_REFINEMENT: Self = Self::new(20, 128, 235);

    #[must_use]
    pub const fn new(black_point: u8, mid_point: u8, white_point: u8) -> Self {
        Self {
            black_point,
            mid_point,
            white_point,
        }
    }

    /// Whether these settings take the binary-threshold branch
    #[must_use]
    pub fn is_extreme(&self) -> bool {
        self.white_point < 10 || self.black_point > 240 || self.mid_point < 10
    }

    /// Threshold used by the binary branch, derived from the parameter that triggered it
    #[must_use]
    pub fn binary_threshold(&self) -> u8 {
        if self.white_point < 10 {
            (self.white_point * 10).max(10)
        } else if self.black_point > 240 {
            self.black_point.min(240)
        } else {
            127
        }
    }

    fn gamma(&self) -> Option<f64> {
        let mid = f64::from(self.mid_point);
        match self.mid_point {
            128 => None,
            m if m < 128 => Some(1.0 + (128.0 - mid) / 128.0),
            _ => Some(128.0 / mid),
        }
    }

    fn map_value(&self, value: u8) -> u8 {
        let black = f64::from(self.black_point);
        let white = f64::from(self.white_point);
        let clamped = f64::from(value).max(black).min(white);
        let range = (white - black).max(1.0);
        let mut normalized = ((clamped - black) / range).clamp(0.0, 1.0);
        if let Some(gamma) = self.gamma() {
            normalized = normalized.powf(gamma);
        }
        (normalized * 255.0 + SNAP_TOLERANCE).clamp(0.0, 255.0) as u8
    }
}

/// Build the 256-entry lookup table for a levels adjustment
///
/// Extreme settings produce the binary-threshold table, so applying this table is
/// byte-identical to [`adjust_mask_levels`] for every parameter set.
#[must_use]
pub fn levels_lut(params: LevelsParams) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if params.is_extreme() {
        let threshold = params.binary_threshold();
        for (value, slot) in (0u8..=255).zip(lut.iter_mut()) {
            *slot = if value > threshold { 255 } else { 0 };
        }
    } else {
        for (value, slot) in (0u8..=255).zip(lut.iter_mut()) {
            *slot = params.map_value(value);
        }
    }
    lut
}

/// Apply a prepared lookup table to every pixel of a mask
#[must_use]
pub fn apply_levels_lut(mask: &GrayImage, lut: &[u8; 256]) -> GrayImage {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = lut[usize::from(pixel.0[0])];
    }
    out
}

/// Remap a mask through black, mid and white points
///
/// Identity parameters `(0, 128, 255)` return the mask unchanged. Extreme
/// settings (`white < 10`, `black > 240` or `mid < 10`) fall back to
/// [`create_binary_mask`] with [`LevelsParams::binary_threshold`].
///
/// # Examples
///
/// ```rust
/// use cutout_pipeline::transforms::{adjust_mask_levels, LevelsParams};
/// use image::GrayImage;
///
/// let mask = GrayImage::from_fn(16, 1, |x, _| image::Luma([(x * 16) as u8]));
/// let same = adjust_mask_levels(&mask, LevelsParams::IDENTITY);
/// assert_eq!(mask, same);
/// ```
#[must_use]
pub fn adjust_mask_levels(mask: &GrayImage, params: LevelsParams) -> GrayImage {
    if params == LevelsParams::IDENTITY {
        return mask.clone();
    }
    if params.is_extreme() {
        tracing::debug!(
            black = params.black_point,
            mid = params.mid_point,
            white = params.white_point,
            "extreme levels settings, using binary threshold"
        );
        return create_binary_mask(mask, params.binary_threshold());
    }
    apply_levels_lut(mask, &levels_lut(params))
}

/// Hard threshold: values above `threshold` become 255, the rest 0
#[must_use]
pub fn create_binary_mask(mask: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = mask.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > threshold { 255 } else { 0 };
    }
    out
}
