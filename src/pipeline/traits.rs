//! Trait definitions for the document-analysis pipeline.
//!
//! Four async traits are the collaborator boundary (no transport assumed):
//! - Rasterizer: document bytes to ordered pages
//! - TextLayerExtractor: embedded text, or a distinct "absent" signal
//! - OcrEngine: normalized page to text + advisory confidence
//! - ObjectDetector: page image to raw (unfiltered) detections
//!
//! Two synchronous traits are in-process seams:
//! - PagePreprocessor: normalize + segment one page (CPU-bound, worker pool)
//! - LanguageIdentifier: language distribution for one paragraph

use async_trait::async_trait;
use image::RgbImage;

use super::detection::DetectorParams;
use super::types::{LanguageScore, OcrOutput, Page, RawDetection, SegmentedPage, TextLayer};
use super::{CollaboratorError, NormalizeError};

/// Renders a document into pages, preserving page order.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    async fn render(&self, document: &[u8], dpi: u32) -> Result<Vec<Page>, CollaboratorError>;
}

/// Reads machine-readable text from a document.
#[async_trait]
pub trait TextLayerExtractor: Send + Sync {
    /// `Ok(TextLayer::Absent)` is the fallback trigger; every `Err` is fatal.
    async fn extract_text(&self, document: &[u8]) -> Result<TextLayer, CollaboratorError>;
}

/// Recognizes text on one segmented page.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(
        &self,
        page: &SegmentedPage,
        lang: &str,
    ) -> Result<OcrOutput, CollaboratorError>;
}

/// Predicts signatures, stamps and QR codes on one page image.
#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn predict(
        &self,
        page: usize,
        image: &RgbImage,
        params: &DetectorParams,
    ) -> Result<Vec<RawDetection>, CollaboratorError>;
}

/// Turns a rasterized page into a normalized, segmented page.
pub trait PagePreprocessor: Send + Sync {
    fn preprocess(&self, page: Page) -> Result<SegmentedPage, NormalizeError>;
}

/// Failure of the underlying language model for one paragraph.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("language identification failed: {0}")]
pub struct IdentifyError(pub String);

/// Scores one paragraph. Implementations need not normalize; the aggregator does.
pub trait LanguageIdentifier: Send + Sync {
    fn identify(&self, text: &str) -> Result<Vec<LanguageScore>, IdentifyError>;
}
