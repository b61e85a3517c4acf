//! Configuration types for the cutout pipeline
//!
//! Two layers live here:
//!
//! - [`AppConfig`] mirrors the persisted JSON document (see
//!   [`crate::services::config_store`]). Every section defaults field by field, so a
//!   partial file deserializes cleanly.
//! - [`ConfigSnapshot`] is the typed, validated view the orchestrator takes once per
//!   image. Stage gating and cleanup deferral read the snapshot, never the live store.
//!
//! [`OrchestratorConfig`] carries the process-level knobs (model, provider, timeouts)
//! that do not belong in the user-editable document.

use crate::error::{PipelineError, Result};
use crate::providers::ProviderPreference;
use crate::session::ModelSelector;
use crate::transforms::LevelsParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default per-image inference timeout
pub const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default time budget for one provider verification probe
pub const DEFAULT_PROBE_BUDGET: Duration = Duration::from_secs(30);

/// Default JPG export quality
pub const DEFAULT_JPG_QUALITY: u8 = 90;

/// Persisted application configuration document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub image_processing: ImageProcessingSection,
    pub image_cropping: ImageCroppingSection,
    pub solid_background: SolidBackgroundSection,
    pub app: AppSection,
}

/// `image_processing.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageProcessingSection {
    /// Keep adjusted masks on disk after the pipeline finishes
    pub save_mask: bool,
    /// Margin in pixels used by both crop and solid background
    pub unified_margin: u32,
    pub jpg_export: JpgExportSection,
    pub levels_adjustment: LevelsAdjustmentSection,
}

impl Default for ImageProcessingSection {
    fn default() -> Self {
        Self {
            save_mask: false,
            unified_margin: 10,
            jpg_export: JpgExportSection::default(),
            levels_adjustment: LevelsAdjustmentSection::default(),
        }
    }
}

/// `image_processing.jpg_export.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JpgExportSection {
    pub enabled: bool,
    pub quality: u8,
}

impl Default for JpgExportSection {
    fn default() -> Self {
        Self {
            enabled: false,
            quality: DEFAULT_JPG_QUALITY,
        }
    }
}

/// `image_processing.levels_adjustment.*`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelsAdjustmentSection {
    pub default: LevelsParams,
}

/// `image_cropping.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageCroppingSection {
    pub enabled: bool,
    /// Alpha value (0-255) above which a pixel counts as content
    pub detection_threshold: u8,
}

impl Default for ImageCroppingSection {
    fn default() -> Self {
        Self {
            enabled: false,
            detection_threshold: 5,
        }
    }
}

/// `solid_background.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolidBackgroundSection {
    pub enabled: bool,
    /// Hex colour `#RRGGBB`
    pub color: String,
}

impl Default for SolidBackgroundSection {
    fn default() -> Self {
        Self {
            enabled: false,
            color: "#FFFFFF".to_string(),
        }
    }
}

/// `app.*`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub show_success_stats: bool,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            show_success_stats: true,
        }
    }
}

/// Parse a `#RRGGBB` (or `RRGGBB`) colour string
///
/// # Errors
/// - String is not six hexadecimal digits after an optional `#`
pub fn parse_hex_color(value: &str) -> Result<[u8; 3]> {
    let hex = value.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return Err(PipelineError::config_value_error(
            "solid_background.color",
            value,
            "#RRGGBB",
            Some("#FFFFFF"),
        ));
    }
    let channel = |range: std::ops::Range<usize>| {
        hex.get(range)
            .and_then(|digits| u8::from_str_radix(digits, 16).ok())
            .ok_or_else(|| {
                PipelineError::config_value_error(
                    "solid_background.color",
                    value,
                    "#RRGGBB",
                    Some("#FFFFFF"),
                )
            })
    };
    Ok([channel(0..2)?, channel(2..4)?, channel(4..6)?])
}

/// Read-only, typed configuration taken once per image
///
/// The snapshot is immutable for the lifetime of one image so that stage gating
/// and cleanup deferral can never disagree if the settings change mid-batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub save_mask: bool,
    pub crop_enabled: bool,
    pub crop_detection_threshold: u8,
    pub unified_margin: u32,
    pub solid_bg_enabled: bool,
    pub solid_bg_color: [u8; 3],
    pub jpg_export_enabled: bool,
    pub jpg_quality: u8,
    pub levels: LevelsParams,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            save_mask: false,
            crop_enabled: false,
            crop_detection_threshold: 5,
            unified_margin: 10,
            solid_bg_enabled: false,
            solid_bg_color: [255, 255, 255],
            jpg_export_enabled: false,
            jpg_quality: DEFAULT_JPG_QUALITY,
            levels: LevelsParams::default(),
        }
    }
}

impl ConfigSnapshot {
    /// Create a new snapshot builder starting from defaults
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cutout_pipeline::config::ConfigSnapshot;
    ///
    /// let snapshot = ConfigSnapshot::builder()
    ///     .crop_enabled(true)
    ///     .solid_bg_color([0, 0, 0])
    ///     .build()
    ///     .unwrap();
    /// assert!(snapshot.crop_enabled);
    /// assert!(snapshot.has_downstream_mask_consumers());
    /// ```
    #[must_use]
    pub fn builder() -> ConfigSnapshotBuilder {
        ConfigSnapshotBuilder::default()
    }

    /// Build a snapshot from the persisted document
    ///
    /// # Errors
    /// - Solid background colour is not a valid `#RRGGBB` string
    /// - JPG quality is outside 1-100 after clamping (never for u8 input)
    pub fn from_app_config(config: &AppConfig) -> Result<Self> {
        let processing = &config.image_processing;
        let snapshot = Self {
            save_mask: processing.save_mask,
            crop_enabled: config.image_cropping.enabled,
            crop_detection_threshold: config.image_cropping.detection_threshold,
            unified_margin: processing.unified_margin,
            solid_bg_enabled: config.solid_background.enabled,
            solid_bg_color: parse_hex_color(&config.solid_background.color)?,
            jpg_export_enabled: processing.jpg_export.enabled,
            jpg_quality: processing.jpg_export.quality.clamp(1, 100),
            levels: processing.levels_adjustment.default,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Validate all snapshot parameters
    ///
    /// # Validation Rules
    ///
    /// - JPG quality: 1-100 (inclusive)
    /// - Margin: at most 10000 pixels
    ///
    /// Levels points are deliberately not ordered here; the levels transform clamps
    /// inverted ranges itself.
    ///
    /// # Errors
    /// - Invalid JPG quality
    /// - Unreasonable margin
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.jpg_quality) {
            return Err(PipelineError::config_value_error(
                "JPG quality",
                self.jpg_quality,
                "1-100",
                Some(DEFAULT_JPG_QUALITY),
            ));
        }

        if self.unified_margin > 10_000 {
            return Err(PipelineError::config_value_error(
                "unified_margin",
                self.unified_margin,
                "0-10000",
                Some(10),
            ));
        }

        Ok(())
    }

    /// Whether any stage after levels adjustment will read the adjusted mask
    #[must_use]
    pub fn has_downstream_mask_consumers(&self) -> bool {
        self.crop_enabled || self.solid_bg_enabled || self.jpg_export_enabled
    }
}

/// Builder for [`ConfigSnapshot`]
#[derive(Debug, Default)]
pub struct ConfigSnapshotBuilder {
    snapshot: ConfigSnapshot,
}

impl ConfigSnapshotBuilder {
    #[must_use]
    pub fn save_mask(mut self, save: bool) -> Self {
        self.snapshot.save_mask = save;
        self
    }

    #[must_use]
    pub fn crop_enabled(mut self, enabled: bool) -> Self {
        self.snapshot.crop_enabled = enabled;
        self
    }

    #[must_use]
    pub fn crop_detection_threshold(mut self, threshold: u8) -> Self {
        self.snapshot.crop_detection_threshold = threshold;
        self
    }

    #[must_use]
    pub fn unified_margin(mut self, margin: u32) -> Self {
        self.snapshot.unified_margin = margin;
        self
    }

    #[must_use]
    pub fn solid_bg_enabled(mut self, enabled: bool) -> Self {
        self.snapshot.solid_bg_enabled = enabled;
        self
    }

    #[must_use]
    pub fn solid_bg_color(mut self, color: [u8; 3]) -> Self {
        self.snapshot.solid_bg_color = color;
        self
    }

    #[must_use]
    pub fn jpg_export_enabled(mut self, enabled: bool) -> Self {
        self.snapshot.jpg_export_enabled = enabled;
        self
    }

    /// Set JPG quality (clamped to 1-100)
    #[must_use]
    pub fn jpg_quality(mut self, quality: u8) -> Self {
        self.snapshot.jpg_quality = quality.clamp(1, 100);
        self
    }

    #[must_use]
    pub fn levels(mut self, levels: LevelsParams) -> Self {
        self.snapshot.levels = levels;
        self
    }

    /// Build and validate the snapshot
    ///
    /// # Errors
    /// - Any rule of [`ConfigSnapshot::validate`] fails
    pub fn build(self) -> Result<ConfigSnapshot> {
        let snapshot = self.snapshot;
        snapshot.validate()?;
        Ok(snapshot)
    }
}

/// Process-level orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Model requested for background removal
    pub model: ModelSelector,
    /// Provider selection policy
    pub provider: ProviderPreference,
    /// Hard wait for one inference call
    pub inference_timeout: Duration,
    /// Budget for each provider verification probe
    pub probe_budget: Duration,
    /// Explicit output directory (None = `{image dir}/PNG`)
    pub output_dir: Option<PathBuf>,
    /// Run the alpha matting retry engine on the cutout
    pub alpha_matting: bool,
    /// Run a 64x64 warm-up inference after creating the session
    pub warm_up: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            model: ModelSelector::default(),
            provider: ProviderPreference::Auto,
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
            probe_budget: DEFAULT_PROBE_BUDGET,
            output_dir: None,
            alpha_matting: true,
            warm_up: true,
        }
    }
}

impl OrchestratorConfig {
    /// Create a new configuration builder
    ///
    /// # Examples
    ///
    /// ```rust
    /// use cutout_pipeline::config::OrchestratorConfig;
    /// use cutout_pipeline::providers::{ProviderKind, ProviderPreference};
    /// use std::time::Duration;
    ///
    /// let config = OrchestratorConfig::builder()
    ///     .provider(ProviderPreference::Force(ProviderKind::Cpu))
    ///     .inference_timeout(Duration::from_secs(60))
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(config.inference_timeout.as_secs(), 60);
    /// ```
    #[must_use]
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    /// Validate timeouts
    ///
    /// # Errors
    /// - Zero inference timeout or probe budget
    pub fn validate(&self) -> Result<()> {
        if self.inference_timeout.is_zero() {
            return Err(PipelineError::config_value_error(
                "inference timeout (s)",
                0,
                ">= 1",
                Some(300),
            ));
        }
        if self.probe_budget.is_zero() {
            return Err(PipelineError::config_value_error(
                "probe budget (s)",
                0,
                ">= 1",
                Some(30),
            ));
        }
        Ok(())
    }
}

/// Builder for [`OrchestratorConfig`]
#[derive(Debug, Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    #[must_use]
    pub fn model(mut self, model: ModelSelector) -> Self {
        self.config.model = model;
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: ProviderPreference) -> Self {
        self.config.provider = provider;
        self
    }

    #[must_use]
    pub fn inference_timeout(mut self, timeout: Duration) -> Self {
        self.config.inference_timeout = timeout;
        self
    }

    #[must_use]
    pub fn probe_budget(mut self, budget: Duration) -> Self {
        self.config.probe_budget = budget;
        self
    }

    #[must_use]
    pub fn output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.output_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn alpha_matting(mut self, enabled: bool) -> Self {
        self.config.alpha_matting = enabled;
        self
    }

    #[must_use]
    pub fn warm_up(mut self, enabled: bool) -> Self {
        self.config.warm_up = enabled;
        self
    }

    /// Build and validate the configuration
    ///
    /// # Errors
    /// - Any rule of [`OrchestratorConfig::validate`] fails
    pub fn build(self) -> Result<OrchestratorConfig> {
        let config = self.config;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document() {
        let config = AppConfig::default();
        assert!(!config.image_processing.save_mask);
        assert_eq!(config.image_processing.unified_margin, 10);
        assert_eq!(config.image_processing.jpg_export.quality, 90);
        assert_eq!(
            config.image_processing.levels_adjustment.default,
            LevelsParams::new(0, 80, 230)
        );
        assert!(!config.image_cropping.enabled);
        assert_eq!(config.image_cropping.detection_threshold, 5);
        assert_eq!(config.solid_background.color, "#FFFFFF");
        assert!(config.app.show_success_stats);
    }

    #[test]
    fn test_partial_document_deserializes() {
        let json = r##"{"image_cropping": {"enabled": true}, "solid_background": {"color": "#102030"}}"##;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert!(config.image_cropping.enabled);
        assert_eq!(config.image_cropping.detection_threshold, 5);
        assert_eq!(config.image_processing.unified_margin, 10);

        let snapshot = ConfigSnapshot::from_app_config(&config).unwrap();
        assert_eq!(snapshot.solid_bg_color, [0x10, 0x20, 0x30]);
        assert!(snapshot.crop_enabled);
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#FFFFFF").unwrap(), [255, 255, 255]);
        assert_eq!(parse_hex_color("00ff7f").unwrap(), [0, 255, 127]);
        assert!(parse_hex_color("#FFF").is_err());
        assert!(parse_hex_color("#GGGGGG").is_err());
        assert!(parse_hex_color("#ÿÿÿ").is_err());
    }

    #[test]
    fn test_snapshot_builder_and_validation() {
        let snapshot = ConfigSnapshot::builder().jpg_quality(0).build().unwrap();
        assert_eq!(snapshot.jpg_quality, 1);

        let snapshot = ConfigSnapshot::builder().jpg_quality(200).build().unwrap();
        assert_eq!(snapshot.jpg_quality, 100);

        assert!(ConfigSnapshot::builder()
            .unified_margin(20_000)
            .build()
            .is_err());
    }

    #[test]
    fn test_downstream_consumers() {
        assert!(!ConfigSnapshot::default().has_downstream_mask_consumers());
        for snapshot in [
            ConfigSnapshot::builder().crop_enabled(true),
            ConfigSnapshot::builder().solid_bg_enabled(true),
            ConfigSnapshot::builder().jpg_export_enabled(true),
        ] {
            assert!(snapshot.build().unwrap().has_downstream_mask_consumers());
        }
    }

    #[test]
    fn test_orchestrator_config_validation() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.inference_timeout, Duration::from_secs(300));
        assert!(config.validate().is_ok());

        assert!(OrchestratorConfig::builder()
            .inference_timeout(Duration::ZERO)
            .build()
            .is_err());
    }
}
