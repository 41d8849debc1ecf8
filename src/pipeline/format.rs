use std::path::Path;

use serde::{Deserialize, Serialize};

use super::AnalysisError;
use crate::config::MAX_DOCUMENT_BYTES;

/// Document kinds the pipeline accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Pdf,
    Png,
    Jpeg,
    Tiff,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Png => "png",
            Self::Jpeg => "jpeg",
            Self::Tiff => "tiff",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Png => "image/png",
            Self::Jpeg => "image/jpeg",
            Self::Tiff => "image/tiff",
        }
    }

    pub fn is_image(&self) -> bool {
        !matches!(self, Self::Pdf)
    }

    /// Detect the format from magic bytes (never from the filename).
    pub fn detect(bytes: &[u8]) -> Result<Self, AnalysisError> {
        if bytes.is_empty() {
            return Err(AnalysisError::Input("empty document".into()));
        }
        if bytes.len() > MAX_DOCUMENT_BYTES {
            return Err(AnalysisError::Input(format!(
                "document too large: {} bytes (max {MAX_DOCUMENT_BYTES})",
                bytes.len()
            )));
        }

        Self::sniff(bytes).ok_or_else(|| {
            AnalysisError::Input(
                "unsupported document format (expected PDF, PNG, JPEG or TIFF)".into(),
            )
        })
    }

    /// Magic-byte match only, without size checks.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match &bytes[..bytes.len().min(8)] {
            // %PDF
            [0x25, 0x50, 0x44, 0x46, ..] => Some(Self::Pdf),
            [0x89, 0x50, 0x4E, 0x47, ..] => Some(Self::Png),
            [0xFF, 0xD8, 0xFF, ..] => Some(Self::Jpeg),
            // little-endian II*\0 or big-endian MM\0*
            [0x49, 0x49, 0x2A, 0x00, ..] | [0x4D, 0x4D, 0x00, 0x2A, ..] => Some(Self::Tiff),
            _ => None,
        }
    }
}

/// Strip path components and control bytes from a caller-supplied filename.
pub fn sanitize_filename(original: &str) -> String {
    let name = Path::new(original)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("document");

    let clean: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\') && !c.is_control())
        .take(255)
        .collect();

    if clean.is_empty() {
        "document".to_string()
    } else {
        clean
    }
}
