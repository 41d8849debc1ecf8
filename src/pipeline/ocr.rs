//! OCR language policy and engine routing.
//!
//! The orchestrator holds exactly one `OcrEngine`. Multi-language deployments
//! plug an `OcrRouter` in that position: it picks a per-language engine and
//! falls back to its default engine for languages it does not know.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::traits::OcrEngine;
use super::types::{OcrOutput, SegmentedPage};
use super::CollaboratorError;

pub const DEFAULT_OCR_LANGUAGE: &str = "en";

/// How the OCR language is chosen for a fallback run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OcrLanguagePolicy {
    /// Always use this language.
    Fixed { lang: String },
    /// Use the caller's language hint when present, else `default`.
    FromTextLayerHint { default: String },
}

impl Default for OcrLanguagePolicy {
    fn default() -> Self {
        Self::Fixed {
            lang: DEFAULT_OCR_LANGUAGE.to_string(),
        }
    }
}

impl OcrLanguagePolicy {
    pub fn resolve(&self, hint: Option<&str>) -> String {
        match self {
            Self::Fixed { lang } => lang.clone(),
            Self::FromTextLayerHint { default } => hint
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .unwrap_or(default.as_str())
                .to_lowercase(),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Router
// ═══════════════════════════════════════════════════════════

/// Language-keyed engine table with a default.
pub struct OcrRouter {
    engines: HashMap<String, Box<dyn OcrEngine>>,
    default_engine: Box<dyn OcrEngine>,
}

impl OcrRouter {
    pub fn new(default_engine: Box<dyn OcrEngine>) -> Self {
        Self {
            engines: HashMap::new(),
            default_engine,
        }
    }

    /// Route `lang` to `engine`. Language codes are matched case-insensitively.
    pub fn with_engine(mut self, lang: &str, engine: Box<dyn OcrEngine>) -> Self {
        self.engines.insert(lang.to_lowercase(), engine);
        self
    }

    pub fn has_engine(&self, lang: &str) -> bool {
        self.engines.contains_key(&lang.to_lowercase())
    }

    fn engine_for(&self, lang: &str) -> &dyn OcrEngine {
        self.engines
            .get(&lang.to_lowercase())
            .map(|e| e.as_ref())
            .unwrap_or(self.default_engine.as_ref())
    }
}

#[async_trait]
impl OcrEngine for OcrRouter {
    async fn recognize(
        &self,
        page: &SegmentedPage,
        lang: &str,
    ) -> Result<OcrOutput, CollaboratorError> {
        debug!(
            page = page.index(),
            lang,
            dedicated = self.has_engine(lang),
            "Routing OCR request"
        );
        self.engine_for(lang).recognize(page, lang).await
    }
}

// ═══════════════════════════════════════════════════════════
// Mock implementations (for testing)
// ═══════════════════════════════════════════════════════════

/// Scripted OCR engine: one default answer, per-page overrides, optional delay.
pub struct MockOcrEngine {
    default: Result<OcrOutput, CollaboratorError>,
    pages: HashMap<usize, Result<OcrOutput, CollaboratorError>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(usize, String)>>,
}

impl MockOcrEngine {
    pub fn new(text: &str, confidence: f32) -> Self {
        Self::with_default(Ok(OcrOutput {
            text: text.to_string(),
            confidence,
        }))
    }

    pub fn failing() -> Self {
        Self::with_default(Err(CollaboratorError::Failed("Mock OCR failure".into())))
    }

    pub fn unavailable() -> Self {
        Self::with_default(Err(CollaboratorError::Unavailable(
            "Mock OCR offline".into(),
        )))
    }

    /// Engine that reports its own deadline expiry.
    pub fn timing_out() -> Self {
        Self::with_default(Err(CollaboratorError::Timeout))
    }

    fn with_default(default: Result<OcrOutput, CollaboratorError>) -> Self {
        Self {
            default,
            pages: HashMap::new(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_page(mut self, page: usize, text: &str, confidence: f32) -> Self {
        self.pages.insert(
            page,
            Ok(OcrOutput {
                text: text.to_string(),
                confidence,
            }),
        );
        self
    }

    pub fn with_failing_page(mut self, page: usize) -> Self {
        self.pages.insert(
            page,
            Err(CollaboratorError::Failed(format!("Mock OCR failure on page {page}"))),
        );
        self
    }

    /// Sleep before answering, to exercise caller deadlines.
    #[cfg(test)]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// `(page, lang)` of every call so far, in call order.
    pub fn calls(&self) -> Vec<(usize, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl OcrEngine for MockOcrEngine {
    async fn recognize(
        &self,
        page: &SegmentedPage,
        lang: &str,
    ) -> Result<OcrOutput, CollaboratorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((page.index(), lang.to_string()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.pages
            .get(&page.index())
            .unwrap_or(&self.default)
            .clone()
    }
}
