//! Image I/O, artifact naming and input collection
//!
//! Every file the pipeline writes is named `{stem}_{suffix}_{tag}.png` where the tag
//! is the current unix time modulo 10000. Cleanup discovery relies on this layout, so
//! all paths are produced here.

use crate::error::{PipelineError, Result};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Output folder created next to the source images
pub const PNG_DIR_NAME: &str = "PNG";

/// Folder receiving JPG exports
pub const JPG_DIR_NAME: &str = "JPG";

/// Input extensions accepted by the pipeline (lowercase)
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp"];

/// Suffixes stripped from a stem to recover the source base name, in match order
pub const ARTIFACT_SUFFIXES: [&str; 4] = [
    "_transparent",
    "_mask_adjusted",
    "_mask",
    "_solid_background",
];

/// Kind of file produced or consumed by a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// The decoded source image
    OriginalNormalized,
    /// Model cutout before matting and levels
    RawCutout,
    /// Model mask (matted when matting succeeded)
    RawMask,
    /// Mask after levels adjustment
    AdjustedMask,
    /// Final transparent PNG
    Transparent,
    /// Transparent PNG after cropping (same file as `Transparent`)
    Cropped,
    SolidBackground,
    Jpg,
}

impl ArtifactKind {
    /// File name suffix used by [`ArtifactNaming`]
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::OriginalNormalized => "original",
            Self::RawCutout => "cutout",
            Self::RawMask => "mask",
            Self::AdjustedMask => "mask_adjusted",
            Self::Transparent | Self::Cropped => "transparent",
            Self::SolidBackground => "solid_background",
            Self::Jpg => "jpg",
        }
    }

    /// Whether the cleanup coordinator manages files of this kind
    #[must_use]
    pub fn is_lifecycle_tracked(self) -> bool {
        matches!(self, Self::RawMask | Self::AdjustedMask)
    }
}

/// Naming scheme for one image's artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactNaming {
    tag: u16,
}

impl Default for ArtifactNaming {
    fn default() -> Self {
        Self::now()
    }
}

impl ArtifactNaming {
    /// Tag derived from the current unix time
    ///
    /// Two images processed within the same second share a tag; the later write wins.
    #[must_use]
    pub fn now() -> Self {
        let tag = chrono::Utc::now().timestamp().rem_euclid(10_000);
        Self {
            tag: u16::try_from(tag).unwrap_or(0),
        }
    }

    /// Fixed tag, reduced modulo 10000
    #[must_use]
    pub fn with_tag(tag: u16) -> Self {
        Self { tag: tag % 10_000 }
    }

    #[must_use]
    pub fn tag(&self) -> String {
        format!("{:04}", self.tag)
    }

    /// Path of `kind` for source `stem` inside `output_dir`
    ///
    /// JPG exports are plain `{stem}.jpg`; every other kind carries suffix and tag.
    #[must_use]
    pub fn path_for(&self, output_dir: &Path, stem: &str, kind: ArtifactKind) -> PathBuf {
        match kind {
            ArtifactKind::Jpg => jpg_dir_for(output_dir).join(format!("{stem}.jpg")),
            _ => output_dir.join(format!("{stem}_{}_{}.png", kind.suffix(), self.tag())),
        }
    }
}

/// `{image dir}/PNG` unless an explicit directory was configured
#[must_use]
pub fn resolve_output_dir(image_path: &Path, explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(dir) => dir.to_path_buf(),
        None => image_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(PNG_DIR_NAME),
    }
}

/// JPG folder for a PNG output directory
///
/// A directory named `PNG` gets a sibling `JPG`; anything else gets a `JPG` child.
#[must_use]
pub fn jpg_dir_for(output_dir: &Path) -> PathBuf {
    match (is_png_output_dir(output_dir), output_dir.parent()) {
        (true, Some(parent)) => parent.join(JPG_DIR_NAME),
        _ => output_dir.join(JPG_DIR_NAME),
    }
}

/// Collect supported images from files and directories
///
/// Directories are walked recursively, skipping any folder named `PNG` so earlier
/// outputs are never reprocessed. `pattern` filters file names. The result is
/// sorted and deduplicated.
///
/// # Errors
/// - An explicit input path does not exist
/// - `pattern` is not a valid glob
pub fn collect_inputs(inputs: &[PathBuf], pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let pattern = pattern
        .map(glob::Pattern::new)
        .transpose()
        .map_err(|e| PipelineError::invalid_config(format!("invalid file pattern: {e}")))?;
    let matches_pattern = |path: &Path| {
        pattern.as_ref().map_or(true, |p| {
            path.file_name()
                .is_some_and(|name| p.matches(&name.to_string_lossy()))
        })
    };

    let mut files = Vec::new();
    for input in inputs {
        if input.is_file() {
            if ImageIOService::is_supported_format(input) && matches_pattern(input) {
                files.push(input.clone());
            } else {
                tracing::debug!(path = %input.display(), "skipping unsupported input");
            }
        } else if input.is_dir() {
            let walker = WalkDir::new(input).follow_links(true).into_iter();
            let walker = walker.filter_entry(|e| {
                !(e.depth() > 0 && e.file_type().is_dir() && is_png_output_dir(e.path()))
            });
            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to read directory entry");
                        continue;
                    },
                };
                let path = entry.path();
                if entry.file_type().is_file()
                    && ImageIOService::is_supported_format(path)
                    && matches_pattern(path)
                {
                    files.push(path.to_path_buf());
                }
            }
        } else {
            return Err(PipelineError::file_io_error(
                "read input",
                input,
                &std::io::Error::new(std::io::ErrorKind::NotFound, "path does not exist"),
            ));
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

/// Whether `path` is a `PNG` output folder (case-insensitive)
#[must_use]
pub fn is_png_output_dir(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().eq_ignore_ascii_case(PNG_DIR_NAME))
}

/// Service for handling image file input/output operations
pub struct ImageIOService;

impl ImageIOService {
    /// Load an image from a file path
    ///
    /// Falls back to content-based format detection when the extension lies.
    ///
    /// # Errors
    /// - File missing or unreadable
    /// - [`PipelineError::UnsupportedFormat`] or [`PipelineError::CorruptInput`] when decoding fails
    pub fn load_image<P: AsRef<Path>>(path: P) -> Result<DynamicImage> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(PipelineError::file_io_error(
                "read image file",
                path_ref,
                &std::io::Error::new(std::io::ErrorKind::NotFound, "file does not exist"),
            ));
        }

        match image::open(path_ref) {
            Ok(img) => Ok(img),
            Err(e) => {
                log::debug!(
                    "Extension-based loading failed for {}: {}. Attempting content-based detection.",
                    path_ref.display(),
                    e
                );
                let data = std::fs::read(path_ref)
                    .map_err(|io_err| PipelineError::file_io_error("read image data", path_ref, &io_err))?;
                image::load_from_memory(&data).map_err(|content_err| {
                    PipelineError::image_load_error(path_ref, content_err)
                })
            },
        }
    }

    /// Save an image as PNG, creating parent directories
    ///
    /// # Errors
    /// - Directory creation or encoding failed
    pub fn save_png<P: AsRef<Path>>(image: &DynamicImage, path: P) -> Result<()> {
        let path_ref = path.as_ref();
        Self::ensure_parent(path_ref)?;
        image
            .save_with_format(path_ref, image::ImageFormat::Png)
            .map_err(|e| {
                PipelineError::processing_stage_error(
                    "PNG encoding",
                    &e.to_string(),
                    Some(&format!("path: {}", path_ref.display())),
                )
            })
    }

    /// Create the parent directory of `path` if missing
    ///
    /// # Errors
    /// - Directory creation failed
    pub fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::file_io_error("create output directory", parent, &e))?;
        }
        Ok(())
    }

    /// Check if a file extension is an accepted input format (case-insensitive)
    #[must_use]
    pub fn is_supported_format<P: AsRef<Path>>(path: P) -> bool {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    }
}
