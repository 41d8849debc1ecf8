//! Analysis configuration.
//!
//! One serde document groups the tuning of every stage. Every field has a
//! default, so a config file only needs to mention what it changes:
//!
//! ```json
//! { "dpi": 200, "detection": { "confidence_threshold": 0.5 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::config::CONFIG_PATH_ENV;
use crate::pipeline::detection::{DetectionFilterConfig, DetectorKind};
use crate::pipeline::language::LanguageConfig;
use crate::pipeline::ocr::OcrLanguagePolicy;
use crate::pipeline::pdfium::DEFAULT_RENDER_DPI;
use crate::pipeline::preprocess::NormalizerConfig;
use crate::pipeline::segment::SegmenterConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Per-stage deadlines, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub text_layer_secs: u64,
    /// Covers rasterization plus normalization and segmentation of every page.
    pub preprocess_secs: u64,
    /// Applied to each OCR page call separately.
    pub ocr_page_secs: u64,
    /// Applied to each detector call separately.
    pub detection_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            text_layer_secs: 30,
            preprocess_secs: 60,
            ocr_page_secs: 30,
            detection_secs: 30,
        }
    }
}

impl StageTimeouts {
    pub fn text_layer(&self) -> Duration {
        Duration::from_secs(self.text_layer_secs)
    }

    pub fn preprocess(&self) -> Duration {
        Duration::from_secs(self.preprocess_secs)
    }

    pub fn ocr_page(&self) -> Duration {
        Duration::from_secs(self.ocr_page_secs)
    }

    pub fn detection(&self) -> Duration {
        Duration::from_secs(self.detection_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub normalizer: NormalizerConfig,
    pub segmenter: SegmenterConfig,
    pub detection: DetectionFilterConfig,
    pub language: LanguageConfig,
    pub timeouts: StageTimeouts,
    /// Rasterization resolution.
    pub dpi: u32,
    pub detector: DetectorKind,
    pub ocr: OcrLanguagePolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            segmenter: SegmenterConfig::default(),
            detection: DetectionFilterConfig::default(),
            language: LanguageConfig::default(),
            timeouts: StageTimeouts::default(),
            dpi: DEFAULT_RENDER_DPI,
            detector: DetectorKind::default(),
            ocr: OcrLanguagePolicy::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

impl AnalysisConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json_str(&raw)?;
        info!(path = %path.display(), "Loaded analysis config");
        Ok(config)
    }

    /// Load from the file named by `CONTRACT_LENS_CONFIG`, or use defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let det = &self.detection;
        check_probability("detection.confidence_threshold", det.confidence_threshold)?;
        for (label, threshold) in &det.class_thresholds {
            check_probability(&format!("detection.class_thresholds.{label}"), *threshold)?;
        }
        check_probability("detection.nms_threshold", det.nms_threshold)?;
        if !(det.max_bbox_ratio > 0.0 && det.max_bbox_ratio <= 1.0) {
            return Err(invalid(format!(
                "detection.max_bbox_ratio must be in (0, 1], got {}",
                det.max_bbox_ratio
            )));
        }
        if !(det.min_aspect_ratio >= 0.0 && det.min_aspect_ratio <= det.max_aspect_ratio) {
            return Err(invalid(format!(
                "detection aspect range [{}, {}] is inverted or negative",
                det.min_aspect_ratio, det.max_aspect_ratio
            )));
        }

        let t = &self.timeouts;
        for (name, secs) in [
            ("timeouts.text_layer_secs", t.text_layer_secs),
            ("timeouts.preprocess_secs", t.preprocess_secs),
            ("timeouts.ocr_page_secs", t.ocr_page_secs),
            ("timeouts.detection_secs", t.detection_secs),
        ] {
            if secs == 0 {
                return Err(invalid(format!("{name} must be positive")));
            }
        }

        if self.dpi == 0 {
            return Err(invalid("dpi must be positive".into()));
        }
        if self.normalizer.max_upscale < 1.0 {
            return Err(invalid(format!(
                "normalizer.max_upscale must be >= 1, got {}",
                self.normalizer.max_upscale
            )));
        }
        if self.language.preview_chars == 0 {
            return Err(invalid("language.preview_chars must be positive".into()));
        }
        Ok(())
    }
}

fn check_probability(name: &str, value: f32) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be within [0, 1], got {value}")))
    }
}

fn invalid(message: String) -> ConfigError {
    ConfigError::Invalid(message)
}
