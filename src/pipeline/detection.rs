//! Object detection post-processing: class canonicalization, noise filtering,
//! and page/document summaries.
//!
//! Detectors report raw label strings and pixel boxes. The filter keeps a box
//! only when its confidence clears the class threshold and its geometry is
//! plausible for a signature, stamp or QR code. Rejections are silent.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use image::RgbImage;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use super::traits::ObjectDetector;
use super::types::{Detection, PageDetections, RawDetection};
use super::CollaboratorError;

// ═══════════════════════════════════════════════════════════
// Detection classes
// ═══════════════════════════════════════════════════════════

/// What the detector can find. Unknown labels are kept, not rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DetectionClass {
    Signature,
    Stamp,
    QrCode,
    Unknown(String),
}

impl DetectionClass {
    /// Map a detector label (name, alias or numeric class id) to a class.
    pub fn canonicalize(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed.to_lowercase().as_str() {
            "signature" | "sign" => Self::Signature,
            "stamp" | "seal" => Self::Stamp,
            "qr_code" | "qr" | "qr-code" | "qrcode" => Self::QrCode,
            other => match other.parse::<u32>() {
                Ok(id) => Self::from_id(id),
                Err(_) => Self::Unknown(trimmed.to_string()),
            },
        }
    }

    /// Class ids as trained: 0 signature, 1 stamp, 2 QR code.
    pub fn from_id(id: u32) -> Self {
        match id {
            0 => Self::Signature,
            1 => Self::Stamp,
            2 => Self::QrCode,
            other => Self::Unknown(format!("class_{other}")),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Signature => "signature",
            Self::Stamp => "stamp",
            Self::QrCode => "qr_code",
            Self::Unknown(raw) => raw,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown(_))
    }
}

impl fmt::Display for DetectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for DetectionClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DetectionClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::canonicalize(&raw))
    }
}

// ═══════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionFilterConfig {
    /// Used for every class without an override.
    pub confidence_threshold: f32,
    /// Per-class overrides keyed by canonical label. Replaces the global threshold.
    pub class_thresholds: BTreeMap<String, f32>,
    pub min_bbox_area: f32,
    /// Largest box area as a fraction of the page area.
    pub max_bbox_ratio: f32,
    pub min_aspect_ratio: f32,
    pub max_aspect_ratio: f32,
    /// Forwarded to the detector; the filter does not run NMS itself.
    pub nms_threshold: f32,
    pub max_detections: usize,
    pub image_size: u32,
}

impl Default for DetectionFilterConfig {
    fn default() -> Self {
        let class_thresholds = [("signature", 0.35), ("stamp", 0.40), ("qr_code", 0.45)]
            .into_iter()
            .map(|(label, t)| (label.to_string(), t))
            .collect();
        Self {
            confidence_threshold: 0.35,
            class_thresholds,
            min_bbox_area: 100.0,
            max_bbox_ratio: 0.8,
            min_aspect_ratio: 0.1,
            max_aspect_ratio: 10.0,
            nms_threshold: 0.4,
            max_detections: 100,
            image_size: 640,
        }
    }
}

impl DetectionFilterConfig {
    pub fn detector_params(&self) -> DetectorParams {
        DetectorParams {
            confidence_threshold: self.confidence_threshold,
            nms_threshold: self.nms_threshold,
            max_detections: self.max_detections,
            image_size: self.image_size,
        }
    }
}

/// Inference settings handed to the detector as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorParams {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub max_detections: usize,
    pub image_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        DetectionFilterConfig::default().detector_params()
    }
}

// ═══════════════════════════════════════════════════════════
// Filter
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct DetectionFilter {
    config: DetectionFilterConfig,
}

impl DetectionFilter {
    pub fn new(config: DetectionFilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionFilterConfig {
        &self.config
    }

    /// Threshold for a class: its override if configured, else the global one.
    pub fn threshold_for(&self, class: &DetectionClass) -> f32 {
        self.config
            .class_thresholds
            .get(class.as_str())
            .copied()
            .unwrap_or(self.config.confidence_threshold)
    }

    /// Box plausibility against a `(width, height)` page.
    pub fn has_valid_geometry(&self, bbox: &[f32; 4], image_size: (u32, u32)) -> bool {
        let cfg = &self.config;
        let width = bbox[2] - bbox[0];
        let height = bbox[3] - bbox[1];
        // Also rejects NaN coordinates.
        if !(width > 0.0 && height > 0.0) {
            return false;
        }

        let area = width * height;
        let page_area = image_size.0 as f32 * image_size.1 as f32;
        let aspect = width / height;

        area >= cfg.min_bbox_area
            && area <= cfg.max_bbox_ratio * page_area
            && aspect >= cfg.min_aspect_ratio
            && aspect <= cfg.max_aspect_ratio
    }

    /// Keep the raw detections that pass confidence and geometry checks.
    pub fn filter(
        &self,
        page: usize,
        raw: Vec<RawDetection>,
        image_size: (u32, u32),
    ) -> Vec<Detection> {
        let total = raw.len();
        let kept: Vec<Detection> = raw
            .into_iter()
            .filter_map(|r| {
                let label = DetectionClass::canonicalize(&r.label);
                if !(r.confidence >= self.threshold_for(&label)) {
                    return None;
                }
                if !self.has_valid_geometry(&r.bbox, image_size) {
                    return None;
                }
                Some(Detection {
                    page,
                    label,
                    bbox: r.bbox,
                    confidence: round_confidence(r.confidence),
                })
            })
            .collect();

        debug!(page, raw = total, kept = kept.len(), "Detections filtered");
        kept
    }

    /// Per-page view of a filtered list.
    pub fn page_summary(page: usize, detections: Vec<Detection>) -> PageDetections {
        PageDetections {
            page,
            detection_count: detections.len(),
            detections,
        }
    }
}

/// Count detections by label. Unknown labels count under their raw name.
pub fn summarize(detections: &[Detection]) -> BTreeMap<String, usize> {
    let mut summary = BTreeMap::new();
    for d in detections {
        *summary.entry(d.label.as_str().to_string()).or_insert(0) += 1;
    }
    summary
}

fn round_confidence(c: f32) -> f32 {
    (c * 10_000.0).round() / 10_000.0
}

// ═══════════════════════════════════════════════════════════
// Detector selection
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Fixed placeholder boxes, used until a trained model is wired in.
    #[default]
    Mock,
    /// No detection at all.
    None,
}

pub fn build_detector(kind: DetectorKind) -> Option<Box<dyn ObjectDetector>> {
    match kind {
        DetectorKind::Mock => Some(Box::new(MockDetector::new())),
        DetectorKind::None => None,
    }
}

// ═══════════════════════════════════════════════════════════
// Mock implementations (for testing)
// ═══════════════════════════════════════════════════════════

enum MockDetectorMode {
    Placeholder,
    Fixed(Vec<RawDetection>),
    Fail(CollaboratorError),
}

/// Emits one signature (lower left) and one stamp (upper right) per page,
/// placed relative to the page size.
pub struct MockDetector {
    mode: MockDetectorMode,
}

impl MockDetector {
    pub fn new() -> Self {
        Self {
            mode: MockDetectorMode::Placeholder,
        }
    }

    /// Returns the given raw detections for every page.
    pub fn with_detections(detections: Vec<RawDetection>) -> Self {
        Self {
            mode: MockDetectorMode::Fixed(detections),
        }
    }

    pub fn failing() -> Self {
        Self {
            mode: MockDetectorMode::Fail(CollaboratorError::Failed(
                "Mock detector failure".into(),
            )),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            mode: MockDetectorMode::Fail(CollaboratorError::Unavailable(
                "Mock detector offline".into(),
            )),
        }
    }
}

impl Default for MockDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectDetector for MockDetector {
    async fn predict(
        &self,
        _page: usize,
        image: &RgbImage,
        _params: &DetectorParams,
    ) -> Result<Vec<RawDetection>, CollaboratorError> {
        match &self.mode {
            MockDetectorMode::Fail(err) => Err(err.clone()),
            MockDetectorMode::Fixed(detections) => Ok(detections.clone()),
            MockDetectorMode::Placeholder => {
                let (w, h) = (image.width() as f32, image.height() as f32);
                Ok(vec![
                    RawDetection::new("signature", [0.1 * w, 0.7 * h, 0.3 * w, 0.85 * h], 0.92),
                    RawDetection::new("stamp", [0.7 * w, 0.15 * h, 0.9 * w, 0.35 * h], 0.88),
                ])
            }
        }
    }
}
