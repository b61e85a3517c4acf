//! JPG export of finished cutouts

use crate::error::{PipelineError, Result};
use crate::services::io::ImageIOService;
use crate::transforms::flatten_onto_color;
use image::codecs::jpeg::JpegEncoder;
use image::RgbaImage;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Background used when flattening transparency for JPG
pub const JPG_MATTE_COLOR: [u8; 3] = [255, 255, 255];

/// Writes RGBA cutouts as baseline JPEG
#[derive(Debug, Clone, Copy)]
pub struct JpgExporter {
    quality: u8,
}

impl Default for JpgExporter {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_JPG_QUALITY)
    }
}

impl JpgExporter {
    /// Exporter with `quality` clamped to 1..=100
    #[must_use]
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    #[must_use]
    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Flatten `image` over white and write it to `path`
    ///
    /// # Errors
    /// - Output directory or file could not be created
    /// - JPEG encoding failed
    pub fn export(&self, image: &RgbaImage, path: &Path) -> Result<()> {
        ImageIOService::ensure_parent(path)?;
        let flattened = flatten_onto_color(image, JPG_MATTE_COLOR);
        let file = File::create(path)
            .map_err(|e| PipelineError::file_io_error("create JPG file", path, &e))?;
        let mut encoder = JpegEncoder::new_with_quality(BufWriter::new(file), self.quality);
        encoder.encode_image(&flattened).map_err(|e| {
            PipelineError::processing_stage_error(
                "JPG export",
                &e.to_string(),
                Some(&format!("path: {}, quality: {}", path.display(), self.quality)),
            )
        })?;
        log::debug!(
            "Exported JPG {} at quality {}",
            path.display(),
            self.quality
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use tempfile::TempDir;

    #[test]
    fn test_quality_is_clamped() {
        assert_eq!(JpgExporter::new(0).quality(), 1);
        assert_eq!(JpgExporter::new(250).quality(), 100);
        assert_eq!(JpgExporter::default().quality(), 90);
    }

    #[test]
    fn test_transparent_pixels_export_white() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("JPG").join("cat.jpg");
        let image = RgbaImage::from_pixel(16, 16, Rgba([0, 0, 0, 0]));
        JpgExporter::new(100).export(&image, &path).unwrap();

        let decoded = image::open(&path).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 16));
        assert!(decoded.pixels().all(|p| p.0.iter().all(|&c| c >= 250)));
    }
}
