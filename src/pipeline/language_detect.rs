//! Lightweight language identification for contract paragraphs.
//!
//! Scores English, French, German, Russian and Kazakh from two signals:
//! function-word frequency and script-specific letters. The text is first split
//! by script (Latin vs Cyrillic) so a paragraph quoting a Russian clause inside
//! English prose gets a mixed distribution rather than a coin flip.
//!
//! No model files: the scoring is deterministic and cheap enough to run on
//! every paragraph of a 300 000-character document.

use super::traits::{IdentifyError, LanguageIdentifier};
use super::types::LanguageScore;

// ── Language profiles ─────────────────────────────────────

struct Profile {
    lang: &'static str,
    words: &'static [&'static str],
    marker_chars: &'static [char],
    /// Points per marker character.
    marker_weight: f64,
}

const ENGLISH: Profile = Profile {
    lang: "en",
    words: &[
        "the", "and", "of", "to", "in", "is", "that", "for", "with", "this", "by", "shall",
        "be", "are", "as", "or", "on", "any", "will", "not", "which", "agreement", "party",
        "parties", "hereby", "herein", "between", "from",
    ],
    marker_chars: &[],
    marker_weight: 0.0,
};

const FRENCH: Profile = Profile {
    lang: "fr",
    words: &[
        "le", "la", "les", "un", "une", "des", "du", "de", "et", "est", "en", "au", "aux",
        "pour", "par", "sur", "dans", "avec", "qui", "que", "pas", "ce", "cette", "sont",
        "contrat", "présent", "l", "d", "qu",
    ],
    marker_chars: &['é', 'è', 'ê', 'ë', 'ç', 'à', 'â', 'ù', 'û', 'î', 'ï', 'ô', 'œ'],
    marker_weight: 0.5,
};

const GERMAN: Profile = Profile {
    lang: "de",
    words: &[
        "der", "die", "das", "und", "ist", "nicht", "mit", "von", "zu", "den", "dem", "des",
        "ein", "eine", "im", "auf", "für", "sich", "werden", "wird", "oder", "bei", "vertrag",
        "parteien", "gemäß",
    ],
    marker_chars: &['ä', 'ö', 'ü', 'ß'],
    marker_weight: 0.5,
};

const RUSSIAN: Profile = Profile {
    lang: "ru",
    words: &[
        "и", "в", "во", "не", "на", "что", "это", "по", "для", "с", "со", "как", "к", "от",
        "из", "или", "а", "но", "о", "об", "при", "договор", "договора", "стороны", "сторон",
        "является", "настоящий", "настоящего", "который", "которые",
    ],
    marker_chars: &[],
    marker_weight: 0.0,
};

/// Kazakh shares the Russian alphabet plus nine letters of its own.
const KAZAKH: Profile = Profile {
    lang: "kk",
    words: &[
        "және", "бұл", "мен", "үшін", "осы", "бойынша", "туралы", "немесе", "болып",
        "табылады", "тарап", "тараптар", "шарт", "шартқа", "деп", "ол", "бір", "жоқ",
    ],
    marker_chars: &['ә', 'ғ', 'қ', 'ң', 'ө', 'ұ', 'ү', 'һ', 'і'],
    marker_weight: 1.0,
};

const LATIN_PROFILES: &[&Profile] = &[&ENGLISH, &FRENCH, &GERMAN];
const CYRILLIC_PROFILES: &[&Profile] = &[&RUSSIAN, &KAZAKH];

impl Profile {
    fn score(&self, words: &[&str], lower: &str) -> f64 {
        let word_hits = words.iter().filter(|w| self.words.contains(w)).count() as f64;
        let marker_hits = if self.marker_chars.is_empty() {
            0.0
        } else {
            lower.chars().filter(|c| self.marker_chars.contains(c)).count() as f64
        };
        word_hits + marker_hits * self.marker_weight
    }
}

fn is_cyrillic(c: char) -> bool {
    matches!(c, '\u{0400}'..='\u{04FF}')
}

// ── Identifier ────────────────────────────────────────────

/// Function-word and letter-frequency identifier. Output is unnormalized.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicLanguageIdentifier;

impl HeuristicLanguageIdentifier {
    pub fn new() -> Self {
        Self
    }
}

impl LanguageIdentifier for HeuristicLanguageIdentifier {
    fn identify(&self, text: &str) -> Result<Vec<LanguageScore>, IdentifyError> {
        let lower = text.to_lowercase();

        let (mut latin, mut cyrillic) = (0usize, 0usize);
        for c in lower.chars().filter(|c| c.is_alphabetic()) {
            if is_cyrillic(c) {
                cyrillic += 1;
            } else {
                latin += 1;
            }
        }
        let letters = latin + cyrillic;
        if letters == 0 {
            return Err(IdentifyError("no alphabetic content".into()));
        }

        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphabetic())
            .filter(|w| !w.is_empty())
            .collect();

        let mut scores = Vec::new();
        for (count, profiles, fallback) in [
            (latin, LATIN_PROFILES, "en"),
            (cyrillic, CYRILLIC_PROFILES, "ru"),
        ] {
            if count == 0 {
                continue;
            }
            let share = count as f64 / letters as f64;
            let hits: Vec<(&str, f64)> = profiles
                .iter()
                .map(|p| (p.lang, p.score(&words, &lower)))
                .collect();
            let total: f64 = hits.iter().map(|(_, s)| s).sum();

            if total <= 0.0 {
                scores.push(LanguageScore::new(fallback, share));
                continue;
            }
            scores.extend(
                hits.into_iter()
                    .filter(|(_, s)| *s > 0.0)
                    .map(|(lang, s)| LanguageScore::new(lang, share * s / total)),
            );
        }
        Ok(scores)
    }
}

// ═══════════════════════════════════════════════════════════
// Mock implementations (for testing)
// ═══════════════════════════════════════════════════════════

/// Returns the same scores for every paragraph, or always fails.
pub struct MockLanguageIdentifier {
    scores: Vec<LanguageScore>,
    fail: bool,
}

impl MockLanguageIdentifier {
    pub fn fixed(scores: Vec<LanguageScore>) -> Self {
        Self {
            scores,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            scores: Vec::new(),
            fail: true,
        }
    }
}

impl LanguageIdentifier for MockLanguageIdentifier {
    fn identify(&self, _text: &str) -> Result<Vec<LanguageScore>, IdentifyError> {
        if self.fail {
            return Err(IdentifyError("Mock identifier failure".into()));
        }
        Ok(self.scores.clone())
    }
}
