//! Analysis orchestrator: the fallback-driven state machine.
//!
//! ```text
//! START → TRY_TEXT_LAYER → DONE_FROM_TEXT
//!                        ↘ NEEDS_FALLBACK → PREPROCESS → DETECT_OBJECTS ∥ OCR
//!                                         → TRY_TEXT_FROM_OCR → DONE_FROM_OCR
//! any stage → FAILED
//! ```
//!
//! Every collaborator sits behind a trait object, so the whole machine runs
//! against mocks in tests. Runs share no mutable state; each gets its own
//! request id and tracing span.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use image::RgbImage;
use tokio::time::timeout;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::confidence::{weighted_mean_confidence, ConfidenceBand};
use super::detection::{build_detector, summarize, DetectionFilter};
use super::document::{DocumentRasterizer, DocumentTextLayer};
use super::format::{sanitize_filename, DocumentFormat};
use super::language::LanguageAggregator;
use super::language_detect::HeuristicLanguageIdentifier;
use super::pdfium::{PdfiumRasterizer, PdfiumTextLayer};
use super::preprocess::{ImageNormalizer, PreprocessingPipeline};
use super::segment::PageSegmenter;
use super::traits::{
    LanguageIdentifier, ObjectDetector, OcrEngine, PagePreprocessor, Rasterizer,
    TextLayerExtractor,
};
use super::types::{
    AnalysisFailure, AnalysisResult, AnalysisState, BlockType, LanguageReport, OcrOutput,
    OcrReport, PageDetections, PageNormalization, Provenance, SegmentedPage, Stage, TextLayer,
};
use super::{AnalysisError, CollaboratorError};
use crate::pipeline_config::AnalysisConfig;

// ═══════════════════════════════════════════════════════════
// Run bookkeeping
// ═══════════════════════════════════════════════════════════

/// State trace of one run.
struct Run {
    states: Vec<AnalysisState>,
}

impl Run {
    fn new() -> Self {
        Self { states: Vec::new() }
    }

    fn enter(&mut self, state: AnalysisState) {
        debug!(state = ?state, "Entering state");
        self.states.push(state);
    }

    fn furthest(&self) -> AnalysisState {
        self.states.last().copied().unwrap_or(AnalysisState::Start)
    }
}

/// What a successful run produced, before it is stamped with ids and times.
struct Outcome {
    provenance: Provenance,
    report: LanguageReport,
    page_detections: Vec<PageDetections>,
    page_count: Option<usize>,
    ocr: Option<OcrReport>,
    normalization: Vec<PageNormalization>,
}

// ═══════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════

pub struct AnalysisOrchestrator {
    config: AnalysisConfig,
    text_layer: Box<dyn TextLayerExtractor>,
    rasterizer: Box<dyn Rasterizer>,
    ocr: Box<dyn OcrEngine>,
    detector: Option<Box<dyn ObjectDetector>>,
    preprocessor: Arc<dyn PagePreprocessor>,
    language: LanguageAggregator,
    filter: DetectionFilter,
}

impl AnalysisOrchestrator {
    /// Build from config. The detector is chosen by `config.detector`; page
    /// preprocessing and language identification use the in-process defaults.
    pub fn new(
        config: AnalysisConfig,
        text_layer: Box<dyn TextLayerExtractor>,
        rasterizer: Box<dyn Rasterizer>,
        ocr: Box<dyn OcrEngine>,
    ) -> Self {
        let preprocessor = PreprocessingPipeline::new(
            ImageNormalizer::new(config.normalizer.clone()),
            PageSegmenter::new(config.segmenter.clone()),
        );
        Self {
            text_layer,
            rasterizer,
            ocr,
            detector: build_detector(config.detector),
            preprocessor: Arc::new(preprocessor),
            language: LanguageAggregator::new(
                config.language.clone(),
                Box::new(HeuristicLanguageIdentifier::new()),
            ),
            filter: DetectionFilter::new(config.detection.clone()),
            config,
        }
    }

    /// PDFium-backed text layer and rasterizer, with image inputs decoded in-process.
    pub fn with_pdfium(
        config: AnalysisConfig,
        ocr: Box<dyn OcrEngine>,
    ) -> Result<Self, CollaboratorError> {
        let text_layer = DocumentTextLayer::new(Box::new(PdfiumTextLayer::new()?));
        let rasterizer = DocumentRasterizer::new(Box::new(PdfiumRasterizer::new()?));
        Ok(Self::new(
            config,
            Box::new(text_layer),
            Box::new(rasterizer),
            ocr,
        ))
    }

    pub fn with_detector(mut self, detector: Box<dyn ObjectDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    pub fn without_detector(mut self) -> Self {
        self.detector = None;
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn PagePreprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn with_language_identifier(mut self, identifier: Box<dyn LanguageIdentifier>) -> Self {
        self.language = LanguageAggregator::new(self.config.language.clone(), identifier);
        self
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Analyze one document.
    pub async fn analyze(
        &self,
        document: &[u8],
        filename: &str,
    ) -> Result<AnalysisResult, AnalysisFailure> {
        self.analyze_with_hint(document, filename, None).await
    }

    /// Analyze one document with a caller-supplied language hint for OCR.
    /// The hint only matters under `OcrLanguagePolicy::FromTextLayerHint`.
    pub async fn analyze_with_hint(
        &self,
        document: &[u8],
        filename: &str,
        language_hint: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisFailure> {
        let request_id = Uuid::new_v4();
        let filename = sanitize_filename(filename);
        let span = info_span!("analyze", request_id = %request_id, filename = %filename);

        self.run(request_id, filename, document, language_hint)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        request_id: Uuid,
        filename: String,
        document: &[u8],
        language_hint: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisFailure> {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(bytes = document.len(), "Analysis started");

        let mut run = Run::new();
        match self.drive(&mut run, document, language_hint).await {
            Ok(outcome) => {
                let result =
                    self.build_result(request_id, filename, started_at, run.states, outcome);
                info!(
                    provenance = ?result.provenance,
                    top_language = result.top_language.as_deref().unwrap_or("none"),
                    detections = result.detections.len(),
                    elapsed_ms = clock.elapsed().as_millis() as u64,
                    "Analysis complete"
                );
                Ok(result)
            }
            Err(err) => {
                let furthest_state = run.furthest();
                run.enter(AnalysisState::Failed);
                warn!(
                    reason_code = err.reason_code(),
                    furthest_state = ?furthest_state,
                    error = %err,
                    elapsed_ms = clock.elapsed().as_millis() as u64,
                    "Analysis failed"
                );
                Err(AnalysisFailure {
                    request_id,
                    filename,
                    reason_code: err.reason_code().to_string(),
                    furthest_state,
                    states: run.states,
                    message: err.to_string(),
                })
            }
        }
    }

    async fn drive(
        &self,
        run: &mut Run,
        document: &[u8],
        language_hint: Option<&str>,
    ) -> Result<Outcome, AnalysisError> {
        run.enter(AnalysisState::Start);
        let format = DocumentFormat::detect(document)?;
        debug!(
            format = format.as_str(),
            mime = format.mime_type(),
            "Document format detected"
        );

        run.enter(AnalysisState::TryTextLayer);
        if let TextLayer::Text(text) = self.read_text_layer(document).await? {
            match self.language.detect_document_language(&text) {
                Some(report) if report.top_language.is_some() => {
                    run.enter(AnalysisState::DoneFromText);
                    let (page_count, page_detections) = self.detect_on_text_path(document).await;
                    return Ok(Outcome {
                        provenance: Provenance::TextLayer,
                        report,
                        page_detections,
                        page_count,
                        ocr: None,
                        normalization: Vec::new(),
                    });
                }
                _ => debug!(chars = text.len(), "Text layer has no scorable paragraphs"),
            }
        }

        run.enter(AnalysisState::NeedsFallback);
        run.enter(AnalysisState::Preprocess);
        let pages = self.preprocess(document).await?;

        run.enter(AnalysisState::DetectObjects);
        run.enter(AnalysisState::Ocr);
        let lang = self.config.ocr.resolve(language_hint);
        let images: Vec<(usize, &RgbImage)> =
            pages.iter().map(|p| (p.index(), &p.page.image)).collect();
        let (page_detections, ocr) =
            tokio::join!(self.detect_pages(&images), self.ocr_pages(&pages, &lang));
        let (text, ocr_report) = ocr?;

        run.enter(AnalysisState::TryTextFromOcr);
        let report = self.language.detect_document_language(&text).ok_or(
            AnalysisError::NoUsableText {
                attempted: ocr_report.pages_attempted,
                failed: ocr_report.failed_pages.len(),
            },
        )?;
        run.enter(AnalysisState::DoneFromOcr);

        Ok(Outcome {
            provenance: Provenance::OcrFallback,
            report,
            page_detections,
            page_count: Some(pages.len()),
            ocr: Some(ocr_report),
            normalization: pages.iter().map(page_normalization).collect(),
        })
    }

    // ── Text layer ────────────────────────────────────────

    async fn read_text_layer(&self, document: &[u8]) -> Result<TextLayer, AnalysisError> {
        let secs = self.config.timeouts.text_layer_secs;
        let extraction = self.text_layer.extract_text(document);
        match timeout(self.config.timeouts.text_layer(), extraction).await {
            Ok(result) => {
                result.map_err(|e| AnalysisError::from_collaborator(Stage::TextLayer, secs, e))
            }
            Err(_) => Err(AnalysisError::StageTimeout {
                stage: Stage::TextLayer,
                seconds: secs,
            }),
        }
    }

    /// Rasterize without normalization and run detection. Failures here only warn:
    /// the language result already stands on its own.
    async fn detect_on_text_path(&self, document: &[u8]) -> (Option<usize>, Vec<PageDetections>) {
        if self.detector.is_none() {
            return (None, Vec::new());
        }

        let render = timeout(
            self.config.timeouts.preprocess(),
            self.rasterizer.render(document, self.config.dpi),
        )
        .await;
        match render {
            Ok(Ok(pages)) => {
                let images: Vec<(usize, &RgbImage)> =
                    pages.iter().map(|p| (p.index, &p.image)).collect();
                let detections = self.detect_pages(&images).await;
                (Some(pages.len()), detections)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Rasterization for detection failed; no detections");
                (None, Vec::new())
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.timeouts.preprocess_secs,
                    "Rasterization for detection timed out; no detections"
                );
                (None, Vec::new())
            }
        }
    }

    // ── Preprocess ────────────────────────────────────────

    async fn preprocess(&self, document: &[u8]) -> Result<Vec<SegmentedPage>, AnalysisError> {
        let secs = self.config.timeouts.preprocess_secs;
        let work = self.rasterize_and_segment(document);
        match timeout(self.config.timeouts.preprocess(), work).await {
            Ok(result) => result,
            Err(_) => Err(AnalysisError::StageTimeout {
                stage: Stage::Preprocess,
                seconds: secs,
            }),
        }
    }

    async fn rasterize_and_segment(
        &self,
        document: &[u8],
    ) -> Result<Vec<SegmentedPage>, AnalysisError> {
        let secs = self.config.timeouts.preprocess_secs;
        let pages = self
            .rasterizer
            .render(document, self.config.dpi)
            .await
            .map_err(|e| AnalysisError::from_collaborator(Stage::Preprocess, secs, e))?;
        if pages.is_empty() {
            return Err(AnalysisError::Input("document has no pages".into()));
        }
        info!(pages = pages.len(), dpi = self.config.dpi, "Document rasterized");

        // One blocking task per page; results come back in page order.
        let (indices, handles): (Vec<usize>, Vec<_>) = pages
            .into_iter()
            .map(|page| {
                let preprocessor = Arc::clone(&self.preprocessor);
                let index = page.index;
                (
                    index,
                    tokio::task::spawn_blocking(move || preprocessor.preprocess(page)),
                )
            })
            .unzip();

        let mut segmented = Vec::with_capacity(indices.len());
        for (index, joined) in indices.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(Ok(page)) => {
                    debug!(
                        page = index,
                        skew_angle = page.page.skew_angle,
                        blocks = page.blocks.len(),
                        "Page preprocessed"
                    );
                    segmented.push(page);
                }
                Ok(Err(source)) => return Err(AnalysisError::Normalization { page: index, source }),
                Err(e) => {
                    return Err(AnalysisError::StageFailed {
                        stage: Stage::Preprocess,
                        reason: format!("page {index} worker aborted: {e}"),
                    })
                }
            }
        }
        Ok(segmented)
    }

    // ── Detection ─────────────────────────────────────────

    /// Detect and filter per page. A page whose detector call fails or times
    /// out simply has no detections.
    async fn detect_pages(&self, pages: &[(usize, &RgbImage)]) -> Vec<PageDetections> {
        let Some(detector) = &self.detector else {
            return Vec::new();
        };
        let params = self.filter.config().detector_params();
        let deadline = self.config.timeouts.detection();

        let per_page = pages.iter().map(|&(index, image)| async move {
            let raw = match timeout(deadline, detector.predict(index, image, &params)).await {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => {
                    warn!(page = index, error = %e, "Detection failed for page");
                    Vec::new()
                }
                Err(_) => {
                    warn!(
                        page = index,
                        timeout_secs = self.config.timeouts.detection_secs,
                        "Detection timed out for page"
                    );
                    Vec::new()
                }
            };
            let kept = self.filter.filter(index, raw, image.dimensions());
            DetectionFilter::page_summary(index, kept)
        });
        join_all(per_page).await
    }

    // ── OCR ───────────────────────────────────────────────

    /// OCR every page concurrently. Returns the joined text and the report.
    async fn ocr_pages(
        &self,
        pages: &[SegmentedPage],
        lang: &str,
    ) -> Result<(String, OcrReport), AnalysisError> {
        let secs = self.config.timeouts.ocr_page_secs;
        let deadline = self.config.timeouts.ocr_page();
        info!(pages = pages.len(), lang, "Running OCR");

        let per_page = pages.iter().map(|page| async move {
            (page.index(), timeout(deadline, self.ocr.recognize(page, lang)).await)
        });

        let mut outputs: Vec<OcrOutput> = Vec::new();
        let mut failed_pages = Vec::new();
        for (index, outcome) in join_all(per_page).await {
            match outcome {
                Ok(Ok(output)) => {
                    debug!(
                        page = index,
                        chars = output.text.chars().count(),
                        confidence = output.confidence,
                        "OCR page done"
                    );
                    outputs.push(output);
                }
                Err(_) | Ok(Err(CollaboratorError::Timeout)) => {
                    return Err(AnalysisError::StageTimeout {
                        stage: Stage::Ocr,
                        seconds: secs,
                    })
                }
                Ok(Err(CollaboratorError::Unavailable(reason))) => {
                    return Err(AnalysisError::StageUnavailable {
                        stage: Stage::Ocr,
                        reason,
                    })
                }
                Ok(Err(e)) => {
                    warn!(page = index, error = %e, "OCR failed for page");
                    failed_pages.push(index);
                }
            }
        }

        if outputs.is_empty() {
            return Err(AnalysisError::NoUsableText {
                attempted: pages.len(),
                failed: failed_pages.len(),
            });
        }

        let refs: Vec<&OcrOutput> = outputs.iter().collect();
        let mean_confidence = weighted_mean_confidence(&refs);
        let quality = ConfidenceBand::from_confidence(mean_confidence);
        if quality.needs_review() {
            warn!(mean_confidence, quality = ?quality, "Low OCR confidence");
        }

        let text = outputs
            .iter()
            .map(|o| o.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let report = OcrReport {
            language: lang.to_string(),
            pages_attempted: pages.len(),
            pages_succeeded: outputs.len(),
            failed_pages,
            mean_confidence,
            quality,
        };
        Ok((text, report))
    }

    // ── Result ────────────────────────────────────────────

    fn build_result(
        &self,
        request_id: Uuid,
        filename: String,
        started_at: DateTime<Utc>,
        states: Vec<AnalysisState>,
        outcome: Outcome,
    ) -> AnalysisResult {
        let detections: Vec<_> = outcome
            .page_detections
            .iter()
            .flat_map(|p| p.detections.iter().cloned())
            .collect();
        let detection_summary = summarize(&detections);
        let report = outcome.report;
        let per_chunk = self.config.language.include_chunks.then_some(report.chunks);

        AnalysisResult {
            request_id,
            filename,
            provenance: outcome.provenance,
            document_languages: report.document_languages,
            top_language: report.top_language,
            per_chunk,
            detections,
            detection_summary,
            page_detections: outcome.page_detections,
            page_count: outcome.page_count,
            ocr: outcome.ocr,
            normalization: outcome.normalization,
            meta: report.meta,
            states,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn page_normalization(page: &SegmentedPage) -> PageNormalization {
    let (width, height) = page.page.image.dimensions();
    PageNormalization {
        page: page.index(),
        width,
        height,
        skew_angle: page.page.skew_angle,
        blocks: page.blocks.len(),
        titles: page
            .blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Title)
            .count(),
    }
}
