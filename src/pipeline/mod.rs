pub mod types;
pub mod traits;
pub mod format;
pub mod imaging;
pub mod denoise;
pub mod deskew;
pub mod preprocess;
pub mod segment;
pub mod detection;
pub mod language_detect;
pub mod language;
pub mod confidence;
pub mod ocr;
pub mod document;
pub mod pdfium;
pub mod orchestrator;

pub use types::*;
pub use traits::*;

use thiserror::Error;

/// What a collaborator (rasterizer, text layer, OCR, detector) may report.
///
/// The variants map one-to-one onto the orchestrator's failure taxonomy,
/// so collaborators never need to know about stages.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("deadline exceeded")]
    Timeout,

    #[error("collaborator unreachable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("collaborator failed: {0}")]
    Failed(String),
}

/// Failure of one of the pure image stages (normalization, segmentation).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("empty image ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("image processing error: {0}")]
    ImageProcessing(String),
}

/// Fatal outcomes of one analysis run.
///
/// "No text layer" and "partial OCR failure" are deliberately absent:
/// the first is the fallback trigger, the second is recorded in the OCR report.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("input error: {0}")]
    Input(String),

    #[error("{stage} stage timed out after {seconds}s")]
    StageTimeout { stage: Stage, seconds: u64 },

    #[error("{stage} stage unavailable: {reason}")]
    StageUnavailable { stage: Stage, reason: String },

    #[error("{stage} stage failed: {reason}")]
    StageFailed { stage: Stage, reason: String },

    #[error("page {page} could not be normalized: {source}")]
    Normalization {
        page: usize,
        #[source]
        source: NormalizeError,
    },

    #[error("OCR produced no usable text ({failed} of {attempted} pages failed)")]
    NoUsableText { attempted: usize, failed: usize },
}

impl AnalysisError {
    /// Stable machine-readable code carried by `AnalysisFailure`.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Input(_) => "input_error",
            Self::StageTimeout { .. } => "stage_timeout",
            Self::StageUnavailable { .. } => "stage_unavailable",
            Self::StageFailed { .. } => "stage_failed",
            Self::Normalization { .. } => "normalization_failed",
            Self::NoUsableText { .. } => "no_usable_text",
        }
    }

    /// Attribute a collaborator error to the stage that called it.
    pub fn from_collaborator(stage: Stage, timeout_secs: u64, err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Timeout => Self::StageTimeout {
                stage,
                seconds: timeout_secs,
            },
            CollaboratorError::Unavailable(reason) => Self::StageUnavailable { stage, reason },
            CollaboratorError::InvalidInput(reason) => Self::Input(reason),
            CollaboratorError::Failed(reason) => Self::StageFailed { stage, reason },
        }
    }
}
