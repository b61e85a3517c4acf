//! Tensor conversion around segmentation model inference
//!
//! Models take a square NCHW float tensor and return a single-channel saliency
//! map. [`ImagePreprocessor`] handles both directions so backends only deal with
//! the runtime call.

use crate::error::{PipelineError, Result};
use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use ndarray::{Array4, ArrayView4};

/// Input geometry and normalisation for one model family
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInputSpec {
    /// Square input side in pixels
    pub size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ModelInputSpec {
    /// ISNet models: 1024×1024, centred around 0.5
    pub const ISNET: Self = Self {
        size: 1024,
        mean: [0.5, 0.5, 0.5],
        std: [1.0, 1.0, 1.0],
    };

    /// U²-Net family and silueta: 320×320, ImageNet statistics
    pub const U2NET: Self = Self {
        size: 320,
        mean: [0.485, 0.456, 0.406],
        std: [0.229, 0.224, 0.225],
    };

    /// Spec for `model_name`; unknown names use the U²-Net geometry
    #[must_use]
    pub fn for_model(model_name: &str) -> Self {
        if model_name.to_ascii_lowercase().starts_with("isnet") {
            Self::ISNET
        } else {
            Self::U2NET
        }
    }
}

/// Image ↔ tensor conversion for segmentation models
pub struct ImagePreprocessor;

impl ImagePreprocessor {
    /// Resize to the model input and normalise into a `1×3×S×S` tensor
    ///
    /// Pixel values are scaled by the brightest channel value in the resized
    /// image before mean/std normalisation.
    #[must_use]
    pub fn to_tensor(image: &RgbImage, spec: &ModelInputSpec) -> Array4<f32> {
        let side = spec.size as usize;
        let resized = image::imageops::resize(image, spec.size, spec.size, FilterType::Lanczos3);
        let peak = resized
            .as_raw()
            .iter()
            .copied()
            .max()
            .map_or(1.0, |v| f32::from(v).max(1e-6));

        let mut tensor = Array4::<f32>::zeros((1, 3, side, side));
        #[allow(clippy::indexing_slicing)]
        // Safe: tensor dimensions match the resized image
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                let value = f32::from(pixel[channel]) / peak;
                tensor[[0, channel, y as usize, x as usize]] =
                    (value - spec.mean[channel]) / spec.std[channel];
            }
        }
        tensor
    }

    /// Min-max normalise the first output channel and resize it to `width×height`
    ///
    /// # Errors
    /// - The output has no spatial extent
    pub fn to_mask(output: ArrayView4<'_, f32>, width: u32, height: u32) -> Result<GrayImage> {
        let (_, _, out_h, out_w) = output.dim();
        if out_h == 0 || out_w == 0 {
            return Err(PipelineError::inference(format!(
                "model output has no spatial extent ({out_w}x{out_h})"
            )));
        }
        let plane = output.slice(ndarray::s![0, 0, .., ..]);
        let (min, max) = plane
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let range = (max - min).max(f32::EPSILON);

        let mask = GrayImage::from_fn(out_w as u32, out_h as u32, |x, y| {
            let value = plane
                .get([y as usize, x as usize])
                .map_or(0.0, |v| (v - min) / range);
            Luma([(value * 255.0).round().clamp(0.0, 255.0) as u8])
        });

        if mask.dimensions() == (width, height) {
            Ok(mask)
        } else {
            Ok(image::imageops::resize(&mask, width, height, FilterType::Lanczos3))
        }
    }
}
