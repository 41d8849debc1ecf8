use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::confidence::ConfidenceBand;
use super::detection::DetectionClass;

/// Stages that run against a collaborator and carry their own deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    TextLayer,
    Preprocess,
    Detection,
    Ocr,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextLayer => "text_layer",
            Self::Preprocess => "preprocess",
            Self::Detection => "detection",
            Self::Ocr => "ocr",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Pages and blocks ──────────────────────────────────────

/// One rasterized page. `index` is 1-based.
#[derive(Debug, Clone)]
pub struct Page {
    pub index: usize,
    pub image: RgbImage,
}

impl Page {
    pub fn new(index: usize, image: RgbImage) -> Self {
        Self { index, image }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// A page after deskew and binarization, still 3-channel.
#[derive(Debug, Clone)]
pub struct NormalizedPage {
    pub index: usize,
    pub image: RgbImage,
    /// Rotation applied during deskew, in degrees. 0 when none was applied.
    pub skew_angle: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Title,
    Paragraph,
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// A segmented region of a normalized page.
#[derive(Debug, Clone)]
pub struct ContentBlock {
    /// Position in top-to-bottom scan order, counting discarded contours.
    pub index: usize,
    pub bbox: BoundingBox,
    pub block_type: BlockType,
    pub image: RgbImage,
}

/// Output of the preprocessing stage for one page.
#[derive(Debug, Clone)]
pub struct SegmentedPage {
    pub page: NormalizedPage,
    pub blocks: Vec<ContentBlock>,
}

impl SegmentedPage {
    pub fn index(&self) -> usize {
        self.page.index
    }
}

// ── Detections ────────────────────────────────────────────

/// Detector output before filtering. The label is whatever the model emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub label: String,
    /// `[x1, y1, x2, y2]` in page pixels.
    pub bbox: [f32; 4],
    pub confidence: f32,
}

impl RawDetection {
    pub fn new(label: &str, bbox: [f32; 4], confidence: f32) -> Self {
        Self {
            label: label.to_string(),
            bbox,
            confidence,
        }
    }
}

/// A detection that survived filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub page: usize,
    pub label: DetectionClass,
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// Per-page detection outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageDetections {
    pub page: usize,
    pub detection_count: usize,
    pub detections: Vec<Detection>,
}

// ── Language ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageScore {
    pub lang: String,
    pub prob: f64,
}

impl LanguageScore {
    pub fn new(lang: &str, prob: f64) -> Self {
        Self {
            lang: lang.to_string(),
            prob,
        }
    }
}

/// Language detection result for one paragraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextChunk {
    pub index: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub preview: String,
    pub languages: Vec<LanguageScore>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LanguageMeta {
    pub paragraphs_detected: usize,
    pub chunk_min_chars: usize,
    pub doc_char_limit: usize,
    /// Input was cut at `doc_char_limit` before reflow.
    pub truncated: bool,
}

/// Everything the language aggregator produces for one text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageReport {
    pub document_languages: Vec<LanguageScore>,
    pub top_language: Option<String>,
    pub chunks: Vec<TextChunk>,
    pub meta: LanguageMeta,
}

// ── Collaborator payloads ─────────────────────────────────

/// What a text-layer read found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextLayer {
    Text(String),
    /// The document carries no machine-readable text. Not an error.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub text: String,
    /// Advisory only.
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrReport {
    pub language: String,
    pub pages_attempted: usize,
    pub pages_succeeded: usize,
    pub failed_pages: Vec<usize>,
    /// Weighted by recognized text length.
    pub mean_confidence: f32,
    pub quality: ConfidenceBand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageNormalization {
    pub page: usize,
    pub width: u32,
    pub height: u32,
    pub skew_angle: f32,
    pub blocks: usize,
    pub titles: usize,
}

// ── Run outcome ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    TextLayer,
    OcrFallback,
}

/// Orchestrator states, in the order a full fallback run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisState {
    Start,
    TryTextLayer,
    DoneFromText,
    NeedsFallback,
    Preprocess,
    DetectObjects,
    Ocr,
    TryTextFromOcr,
    DoneFromOcr,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub request_id: Uuid,
    pub filename: String,
    pub provenance: Provenance,
    pub document_languages: Vec<LanguageScore>,
    pub top_language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_chunk: Option<Vec<TextChunk>>,
    pub detections: Vec<Detection>,
    pub detection_summary: BTreeMap<String, usize>,
    pub page_detections: Vec<PageDetections>,
    /// Known only when pages were rasterized.
    pub page_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr: Option<OcrReport>,
    pub normalization: Vec<PageNormalization>,
    pub meta: LanguageMeta,
    pub states: Vec<AnalysisState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Structured failure handed back to callers instead of an error chain.
#[derive(Error, Debug, Clone, Serialize)]
#[error("{reason_code} after {furthest_state:?}: {message}")]
pub struct AnalysisFailure {
    pub request_id: Uuid,
    pub filename: String,
    pub reason_code: String,
    /// Last state entered before failing.
    pub furthest_state: AnalysisState,
    pub states: Vec<AnalysisState>,
    pub message: String,
}
