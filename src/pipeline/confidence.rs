use serde::{Deserialize, Serialize};

use super::types::OcrOutput;

/// OCR confidence bands reported alongside the fallback result.
pub mod thresholds {
    /// Below this: recognition likely failed on most of the page.
    pub const VERY_LOW: f32 = 0.30;

    /// Below this: expect noticeable misreads.
    pub const LOW: f32 = 0.50;

    /// At or above this: clean scan.
    pub const HIGH: f32 = 0.85;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    VeryLow,
    Low,
    Moderate,
    High,
}

impl ConfidenceBand {
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence < thresholds::VERY_LOW {
            Self::VeryLow
        } else if confidence < thresholds::LOW {
            Self::Low
        } else if confidence < thresholds::HIGH {
            Self::Moderate
        } else {
            Self::High
        }
    }

    pub fn needs_review(&self) -> bool {
        matches!(self, Self::VeryLow | Self::Low)
    }
}

/// Mean OCR confidence weighted by recognized text length (in characters).
/// Pages with no text carry no weight; no text at all gives 0.
pub fn weighted_mean_confidence(outputs: &[&OcrOutput]) -> f32 {
    let total_chars: usize = outputs.iter().map(|o| o.text.chars().count()).sum();
    if total_chars == 0 {
        return 0.0;
    }

    let weighted_sum: f32 = outputs
        .iter()
        .map(|o| o.confidence.clamp(0.0, 1.0) * o.text.chars().count() as f32)
        .sum();

    weighted_sum / total_chars as f32
}
