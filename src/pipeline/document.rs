//! Format-dispatching collaborators.
//!
//! PDFs go to the wrapped PDF collaborator. PNG, JPEG and TIFF inputs are
//! decoded in-process into a single page and never carry a text layer.

use std::time::Duration;

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use tracing::debug;

use super::format::DocumentFormat;
use super::traits::{Rasterizer, TextLayerExtractor};
use super::types::{Page, TextLayer};
use super::CollaboratorError;

fn sniff(document: &[u8]) -> Result<DocumentFormat, CollaboratorError> {
    DocumentFormat::sniff(document)
        .ok_or_else(|| CollaboratorError::InvalidInput("unrecognized document format".into()))
}

/// Decode an image document into page 1. Multi-frame TIFFs yield their first frame.
pub fn decode_image_page(document: &[u8]) -> Result<Page, CollaboratorError> {
    let decoded = image::load_from_memory(document)
        .map_err(|e| CollaboratorError::InvalidInput(format!("image decoding failed: {e}")))?;
    let image = decoded.to_rgb8();
    if image.width() == 0 || image.height() == 0 {
        return Err(CollaboratorError::InvalidInput("image has no pixels".into()));
    }
    Ok(Page::new(1, image))
}

pub struct DocumentRasterizer {
    pdf: Box<dyn Rasterizer>,
}

impl DocumentRasterizer {
    pub fn new(pdf: Box<dyn Rasterizer>) -> Self {
        Self { pdf }
    }
}

#[async_trait]
impl Rasterizer for DocumentRasterizer {
    async fn render(&self, document: &[u8], dpi: u32) -> Result<Vec<Page>, CollaboratorError> {
        let format = sniff(document)?;
        if !format.is_image() {
            return self.pdf.render(document, dpi).await;
        }

        debug!(format = format.as_str(), mime = format.mime_type(), "Decoding image document");
        let bytes = document.to_vec();
        let page = tokio::task::spawn_blocking(move || decode_image_page(&bytes))
            .await
            .map_err(|e| CollaboratorError::Failed(format!("image decoder panicked: {e}")))??;
        Ok(vec![page])
    }
}

pub struct DocumentTextLayer {
    pdf: Box<dyn TextLayerExtractor>,
}

impl DocumentTextLayer {
    pub fn new(pdf: Box<dyn TextLayerExtractor>) -> Self {
        Self { pdf }
    }
}

#[async_trait]
impl TextLayerExtractor for DocumentTextLayer {
    async fn extract_text(&self, document: &[u8]) -> Result<TextLayer, CollaboratorError> {
        match sniff(document)? {
            DocumentFormat::Pdf => self.pdf.extract_text(document).await,
            // Scans have no embedded text.
            _ => Ok(TextLayer::Absent),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Mock implementations (for testing)
// ═══════════════════════════════════════════════════════════

/// Produces `page_count` blank pages of a fixed size.
pub struct MockRasterizer {
    page_count: usize,
    size: (u32, u32),
    error: Option<CollaboratorError>,
    delay: Option<Duration>,
}

impl MockRasterizer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            size: (120, 160),
            error: None,
            delay: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            error: Some(CollaboratorError::Failed("Mock rasterizer failure".into())),
            ..Self::new(0)
        }
    }

    pub fn unavailable() -> Self {
        Self {
            error: Some(CollaboratorError::Unavailable("Mock rasterizer offline".into())),
            ..Self::new(0)
        }
    }

    #[cfg(test)]
    pub fn with_page_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    #[cfg(test)]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Rasterizer for MockRasterizer {
    async fn render(&self, _document: &[u8], _dpi: u32) -> Result<Vec<Page>, CollaboratorError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let (w, h) = self.size;
        Ok((1..=self.page_count)
            .map(|i| Page::new(i, RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))))
            .collect())
    }
}

/// Scripted text-layer reader.
pub struct MockTextLayer {
    result: Result<TextLayer, CollaboratorError>,
    delay: Option<Duration>,
}

impl MockTextLayer {
    pub fn with_text(text: &str) -> Self {
        Self {
            result: Ok(TextLayer::Text(text.to_string())),
            delay: None,
        }
    }

    pub fn absent() -> Self {
        Self {
            result: Ok(TextLayer::Absent),
            delay: None,
        }
    }

    /// The reader itself reports a deadline expiry.
    pub fn timing_out() -> Self {
        Self {
            result: Err(CollaboratorError::Timeout),
            delay: None,
        }
    }

    pub fn unavailable() -> Self {
        Self {
            result: Err(CollaboratorError::Unavailable("Mock text layer offline".into())),
            delay: None,
        }
    }

    pub fn malformed() -> Self {
        Self {
            result: Err(CollaboratorError::InvalidInput("Mock malformed PDF".into())),
            delay: None,
        }
    }

    /// Sleep before answering, so the caller's own deadline can fire.
    #[cfg(test)]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl TextLayerExtractor for MockTextLayer {
    async fn extract_text(&self, _document: &[u8]) -> Result<TextLayer, CollaboratorError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.result.clone()
    }
}
