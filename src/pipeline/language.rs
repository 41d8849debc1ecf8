//! Document-level language detection.
//!
//! Raw text from a PDF text layer or from OCR is ragged: lines wrap wherever
//! the layout wrapped them. The aggregator first reflows soft wraps into
//! paragraphs, scores each paragraph independently, then sums the paragraph
//! distributions into one ranked document distribution. Voting across
//! paragraphs keeps a single quoted clause from flipping the document language.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::traits::LanguageIdentifier;
use super::types::{LanguageMeta, LanguageReport, LanguageScore, TextChunk};

/// Characters that end a line on purpose; a newline after them is kept.
const HARD_BREAK_AFTER: &[char] = &['.', '!', '?', '…', ':', ';'];

static PARAGRAPH_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{2,}").unwrap());
static HORIZONTAL_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t]+").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanguageConfig {
    /// Paragraphs shorter than this (in characters) are not scored.
    pub min_chars: usize,
    /// Input beyond this many characters is ignored.
    pub doc_char_limit: usize,
    pub preview_chars: usize,
    /// Whether per-paragraph results are returned to the caller.
    pub include_chunks: bool,
}

impl Default for LanguageConfig {
    fn default() -> Self {
        Self {
            min_chars: 40,
            doc_char_limit: 300_000,
            preview_chars: 120,
            include_chunks: true,
        }
    }
}

pub struct LanguageAggregator {
    config: LanguageConfig,
    identifier: Box<dyn LanguageIdentifier>,
}

impl LanguageAggregator {
    pub fn new(config: LanguageConfig, identifier: Box<dyn LanguageIdentifier>) -> Self {
        Self { config, identifier }
    }

    pub fn config(&self) -> &LanguageConfig {
        &self.config
    }

    /// Detect the language distribution of a whole document.
    ///
    /// `None` means the text reflowed into zero paragraphs: there is nothing to
    /// read and the caller should try OCR. A report with empty
    /// `document_languages` means there was text but no paragraph was scorable.
    pub fn detect_document_language(&self, raw: &str) -> Option<LanguageReport> {
        let (text, truncated) = truncate_chars(raw, self.config.doc_char_limit);
        if truncated {
            debug!(limit = self.config.doc_char_limit, "Text truncated before reflow");
        }

        let paragraphs = reflow_paragraphs(text);
        if paragraphs.is_empty() {
            return None;
        }

        let chunks = self.build_chunks(&paragraphs);
        let document_languages = aggregate(&chunks);
        let top_language = document_languages.first().map(|s| s.lang.clone());

        debug!(
            paragraphs = paragraphs.len(),
            scored = chunks.iter().filter(|c| !c.languages.is_empty()).count(),
            top_language = top_language.as_deref().unwrap_or("none"),
            "Document language aggregated"
        );

        Some(LanguageReport {
            document_languages,
            top_language,
            chunks,
            meta: LanguageMeta {
                paragraphs_detected: paragraphs.len(),
                chunk_min_chars: self.config.min_chars,
                doc_char_limit: self.config.doc_char_limit,
                truncated,
            },
        })
    }

    fn build_chunks(&self, paragraphs: &[String]) -> Vec<TextChunk> {
        let mut cursor = 0;
        paragraphs
            .iter()
            .enumerate()
            .map(|(index, paragraph)| {
                let len = paragraph.chars().count();
                let start_char = cursor;
                let end_char = start_char + len;
                // Paragraphs are conceptually rejoined with one blank line.
                cursor = end_char + 2;

                TextChunk {
                    index,
                    start_char,
                    end_char,
                    preview: preview(paragraph, self.config.preview_chars),
                    languages: self.score_paragraph(index, paragraph, len),
                }
            })
            .collect()
    }

    fn score_paragraph(&self, index: usize, paragraph: &str, len: usize) -> Vec<LanguageScore> {
        if len < self.config.min_chars {
            return Vec::new();
        }
        match self.identifier.identify(paragraph) {
            Ok(scores) => normalize_scores(scores),
            Err(e) => {
                warn!(chunk = index, error = %e, "Language identification failed for paragraph");
                Vec::new()
            }
        }
    }
}

// ── Reflow ────────────────────────────────────────────────

/// Merge soft-wrapped lines and split on blank lines.
///
/// A lone newline becomes a space unless it follows sentence or clause
/// punctuation. Line endings are normalized and trailing blanks stripped
/// first; runs of spaces and tabs collapse to one space. Empty paragraphs
/// are dropped.
pub fn reflow_paragraphs(raw: &str) -> Vec<String> {
    let text = raw
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .split('\n')
        .map(|line| line.trim_end_matches([' ', '\t']))
        .collect::<Vec<_>>()
        .join("\n");

    let chars: Vec<char> = text.chars().collect();
    let mut merged = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        let prev = i.checked_sub(1).and_then(|p| chars.get(p));
        let soft_wrap = c == '\n'
            && chars.get(i + 1) != Some(&'\n')
            && prev != Some(&'\n')
            && !prev.is_some_and(|p| HARD_BREAK_AFTER.contains(p));
        merged.push(if soft_wrap { ' ' } else { c });
    }

    PARAGRAPH_BREAK
        .split(&merged)
        .map(|p| HORIZONTAL_SPACE.replace_all(p, " ").trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

// ── Scores ────────────────────────────────────────────────

/// Scale scores to sum to 1 and sort descending. Non-positive entries are dropped.
pub fn normalize_scores(scores: Vec<LanguageScore>) -> Vec<LanguageScore> {
    let mut kept: Vec<LanguageScore> = scores
        .into_iter()
        .filter(|s| s.prob.is_finite() && s.prob > 0.0)
        .collect();
    let total: f64 = kept.iter().map(|s| s.prob).sum();
    if total <= 0.0 {
        return Vec::new();
    }
    for s in &mut kept {
        s.prob /= total;
    }
    kept.sort_by(|a, b| b.prob.total_cmp(&a.prob));
    kept
}

/// Sum per-language probability over scored chunks, then renormalize.
pub fn aggregate(chunks: &[TextChunk]) -> Vec<LanguageScore> {
    let mut sums: Vec<LanguageScore> = Vec::new();
    for score in chunks.iter().flat_map(|c| c.languages.iter()) {
        match sums.iter_mut().find(|s| s.lang == score.lang) {
            Some(existing) => existing.prob += score.prob,
            None => sums.push(score.clone()),
        }
    }
    normalize_scores(sums)
}

fn preview(paragraph: &str, max_chars: usize) -> String {
    match paragraph.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &paragraph[..cut]),
        None => paragraph.to_string(),
    }
}

/// Cut `text` to at most `limit` characters.
fn truncate_chars(text: &str, limit: usize) -> (&str, bool) {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => (&text[..cut], true),
        None => (text, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::language_detect::{HeuristicLanguageIdentifier, MockLanguageIdentifier};

    fn heuristic() -> LanguageAggregator {
        LanguageAggregator::new(
            LanguageConfig::default(),
            Box::new(HeuristicLanguageIdentifier::new()),
        )
    }

    const ENGLISH_PARA: &str =
        "The supplier shall deliver the goods to the buyer within thirty days of the order.";
    const RUSSIAN_PARA: &str =
        "Настоящий договор вступает в силу с момента подписания его обеими сторонами.";

    #[test]
    fn majority_language_wins_over_noise_paragraph() {
        let mut paragraphs = vec![ENGLISH_PARA; 9];
        paragraphs.insert(4, RUSSIAN_PARA);
        let report = heuristic()
            .detect_document_language(&paragraphs.join("\n\n"))
            .unwrap();

        assert_eq!(report.top_language.as_deref(), Some("en"));
        assert_eq!(report.meta.paragraphs_detected, 10);
        let ru = report
            .document_languages
            .iter()
            .find(|s| s.lang == "ru")
            .map(|s| s.prob)
            .unwrap_or(0.0);
        assert!(ru > 0.0 && ru < 0.2, "noise paragraph keeps a small share: {ru}");
    }

    #[test]
    fn document_scores_sum_to_one() {
        let aggregator = LanguageAggregator::new(
            LanguageConfig::default(),
            Box::new(MockLanguageIdentifier::fixed(vec![
                LanguageScore::new("en", 3.0),
                LanguageScore::new("kk", 1.5),
                LanguageScore::new("ru", 0.5),
            ])),
        );
        let text = format!("{ENGLISH_PARA}\n\n{ENGLISH_PARA}");
        let report = aggregator.detect_document_language(&text).unwrap();

        let total: f64 = report.document_languages.iter().map(|s| s.prob).sum();
        assert!((total - 1.0).abs() < 1e-6, "got {total}");
        for chunk in &report.chunks {
            let chunk_total: f64 = chunk.languages.iter().map(|s| s.prob).sum();
            assert!((chunk_total - 1.0).abs() < 1e-6);
        }
        assert_eq!(report.document_languages[0].lang, "en");
        assert!((report.document_languages[0].prob - 0.6).abs() < 1e-9);
    }

    #[test]
    fn soft_wraps_merge_and_hard_breaks_stay() {
        let raw = "First line\nsecond line.\nThird line\n\nNext   paragraph\there";
        assert_eq!(
            reflow_paragraphs(raw),
            vec![
                "First line second line.\nThird line".to_string(),
                "Next paragraph here".to_string()
            ]
        );
    }

    #[test]
    fn clause_punctuation_keeps_newline() {
        let raw = "Definitions:\nGoods means the items;\nPrice means the fee";
        assert_eq!(
            reflow_paragraphs(raw),
            vec!["Definitions:\nGoods means the items;\nPrice means the fee".to_string()]
        );
    }

    #[test]
    fn windows_line_endings_normalized() {
        assert_eq!(
            reflow_paragraphs("a b\r\nc\r\n\r\nd\re"),
            vec!["a b c".to_string(), "d e".to_string()]
        );
    }

    #[test]
    fn reflow_is_idempotent() {
        let raw = "Article 1.\nThe parties\nagree as follows:\n\n\n  Payment is due\n within 10 days.\n\nSigned";
        let once = reflow_paragraphs(raw);
        let twice = reflow_paragraphs(&once.join("\n\n"));
        assert_eq!(once, twice);
    }

    #[test]
    fn whitespace_only_text_has_no_paragraphs() {
        assert!(heuristic().detect_document_language("  \n\n \t \r\n").is_none());
        assert!(heuristic().detect_document_language("").is_none());
    }

    #[test]
    fn short_paragraphs_are_not_scored() {
        let report = heuristic()
            .detect_document_language("Page 1\n\nSignature: ____")
            .unwrap();
        assert_eq!(report.meta.paragraphs_detected, 2);
        assert!(report.document_languages.is_empty());
        assert!(report.top_language.is_none());
        assert!(report.chunks.iter().all(|c| c.languages.is_empty()));
    }

    #[test]
    fn chunk_offsets_count_characters() {
        let text = "Қазақ тілі\n\nSecond";
        let report = heuristic().detect_document_language(text).unwrap();
        let spans: Vec<(usize, usize)> = report
            .chunks
            .iter()
            .map(|c| (c.start_char, c.end_char))
            .collect();
        assert_eq!(spans, vec![(0, 10), (12, 18)]);
    }

    #[test]
    fn preview_truncated_with_ellipsis() {
        let long = "word ".repeat(60);
        let report = heuristic().detect_document_language(&long).unwrap();
        let preview = &report.chunks[0].preview;
        assert_eq!(preview.chars().count(), 121);
        assert!(preview.ends_with('…'));

        let short = heuristic().detect_document_language(ENGLISH_PARA).unwrap();
        assert_eq!(short.chunks[0].preview, ENGLISH_PARA);
    }

    #[test]
    fn identifier_failure_degrades_to_empty_scores() {
        let aggregator = LanguageAggregator::new(
            LanguageConfig::default(),
            Box::new(MockLanguageIdentifier::failing()),
        );
        let report = aggregator.detect_document_language(ENGLISH_PARA).unwrap();
        assert_eq!(report.chunks.len(), 1);
        assert!(report.chunks[0].languages.is_empty());
        assert!(report.top_language.is_none());
    }

    #[test]
    fn char_limit_truncates_before_reflow() {
        let aggregator = LanguageAggregator::new(
            LanguageConfig {
                doc_char_limit: 20,
                ..LanguageConfig::default()
            },
            Box::new(HeuristicLanguageIdentifier::new()),
        );
        let report = aggregator.detect_document_language(ENGLISH_PARA).unwrap();
        assert!(report.meta.truncated);
        assert_eq!(report.chunks[0].end_char, 20);

        let untouched = heuristic().detect_document_language(ENGLISH_PARA).unwrap();
        assert!(!untouched.meta.truncated);
    }

    #[test]
    fn normalize_drops_non_positive_scores() {
        let scores = normalize_scores(vec![
            LanguageScore::new("en", 0.0),
            LanguageScore::new("fr", f64::NAN),
            LanguageScore::new("de", 2.0),
        ]);
        assert_eq!(scores, vec![LanguageScore::new("de", 1.0)]);
        assert!(normalize_scores(vec![LanguageScore::new("en", 0.0)]).is_empty());
    }
}
