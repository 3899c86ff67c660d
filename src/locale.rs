//! Spoken-language detection for caller utterances.
//!
//! Detection scores each supported locale by counting marker-word hits
//! (common function words and request vocabulary, matched on word
//! boundaries via a precompiled Aho-Corasick automaton) plus occurrences
//! of diacritics distinctive of that locale. One pass over the text,
//! O(len), no allocation beyond the normalized copy.
//!
//! A session's locale is sticky: it only switches when a detection for a
//! *different* locale reaches the configured confidence floor. Short or
//! ambiguous input never flips the language.

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};

// ── Locales ────────────────────────────────────────────────────────

/// Languages the orchestrator can greet, listen, and speak in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    En,
    Es,
    Fr,
    De,
    It,
    Pt,
}

impl Locale {
    /// Short language code ("en", "es", ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Locale::En => "en",
            Locale::Es => "es",
            Locale::Fr => "fr",
            Locale::De => "de",
            Locale::It => "it",
            Locale::Pt => "pt",
        }
    }

    /// BCP-47 tag with region, as telephony voice APIs expect.
    pub fn tag(self) -> &'static str {
        match self {
            Locale::En => "en-US",
            Locale::Es => "es-ES",
            Locale::Fr => "fr-FR",
            Locale::De => "de-DE",
            Locale::It => "it-IT",
            Locale::Pt => "pt-BR",
        }
    }

    /// English name, used in model instructions.
    pub fn display_name(self) -> &'static str {
        match self {
            Locale::En => "English",
            Locale::Es => "Spanish",
            Locale::Fr => "French",
            Locale::De => "German",
            Locale::It => "Italian",
            Locale::Pt => "Portuguese",
        }
    }

    /// Parse "es", "es-ES", "ES" and the like. Unknown tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Locale> {
        let lower = tag.to_ascii_lowercase();
        let primary = lower.split(['-', '_']).next().unwrap_or(&lower);
        match primary {
            "en" => Some(Locale::En),
            "es" => Some(Locale::Es),
            "fr" => Some(Locale::Fr),
            "de" => Some(Locale::De),
            "it" => Some(Locale::It),
            "pt" => Some(Locale::Pt),
            _ => None,
        }
    }

    pub fn all() -> [Locale; 6] {
        [
            Locale::En,
            Locale::Es,
            Locale::Fr,
            Locale::De,
            Locale::It,
            Locale::Pt,
        ]
    }
}

impl std::fmt::Display for Locale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Marker data ────────────────────────────────────────────────────

/// Marker words per locale. Matched on word boundaries after
/// normalization, so "the" never fires inside "theatre".
fn marker_words(locale: Locale) -> &'static [&'static str] {
    match locale {
        Locale::En => &[
            "hello", "hi", "please", "thanks", "thank", "would", "could", "want", "need", "book",
            "booking", "reservation", "table", "tomorrow", "today", "open", "hours",
        ],
        Locale::Es => &[
            "hola", "gracias", "por favor", "quiero", "quisiera", "necesito", "reservar",
            "reserva", "mesa", "abierto", "horario", "cuánto", "cuanto", "dónde", "donde",
            "mañana", "habla", "español", "buenos días", "buenas tardes",
        ],
        Locale::Fr => &[
            "bonjour", "bonsoir", "merci", "je voudrais", "je veux", "réserver", "réservation",
            "une table", "ouvert", "horaires", "combien", "demain", "parlez", "français",
            "s il vous plaît",
        ],
        Locale::De => &[
            "hallo", "guten tag", "guten morgen", "danke", "bitte", "ich möchte", "ich will",
            "reservieren", "reservierung", "tisch", "geöffnet", "öffnungszeiten", "wieviel",
            "morgen", "sprechen", "deutsch",
        ],
        Locale::It => &[
            "ciao", "buongiorno", "buonasera", "grazie", "per favore", "vorrei", "prenotare",
            "prenotazione", "tavolo", "aperto", "orari", "domani", "parla", "italiano",
        ],
        Locale::Pt => &[
            "olá", "bom dia", "boa tarde", "obrigado", "obrigada", "gostaria", "reservar",
            "uma mesa", "aberto", "horário", "amanhã", "fala", "português", "preciso",
        ],
    }
}

/// Diacritics distinctive of a single locale. Shared accents (á, é, ç, ù)
/// are deliberately excluded.
fn diacritics(locale: Locale) -> &'static [char] {
    match locale {
        Locale::En => &[],
        Locale::Es => &['ñ', '¿', '¡'],
        Locale::Fr => &['â', 'ê', 'î', 'ô', 'û', 'œ'],
        Locale::De => &['ß', 'ä', 'ö', 'ü'],
        Locale::It => &['ì', 'ò'],
        Locale::Pt => &['ã', 'õ'],
    }
}

/// Lowercase, fold punctuation to spaces, pad with one space on each side
/// so word-boundary patterns (" word ") match at the edges.
pub(crate) fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push(' ');
    for ch in text.chars() {
        if ch.is_alphanumeric() || matches!(ch, '¿' | '¡') {
            out.extend(ch.to_lowercase());
        } else {
            out.push(' ');
        }
    }
    out.push(' ');
    out
}

// ── Detector ───────────────────────────────────────────────────────

/// Outcome of a single detection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub locale: Locale,
    /// Combined marker-word and diacritic hit count.
    pub hits: u32,
}

/// Compiled per-locale automata plus the switch rule.
pub struct LanguageDetector {
    automata: Vec<(Locale, AhoCorasick)>,
    default: Locale,
    min_confidence: u32,
}

impl LanguageDetector {
    pub fn new(default: Locale, min_confidence: u32) -> anyhow::Result<Self> {
        let mut automata = Vec::with_capacity(Locale::all().len());
        for locale in Locale::all() {
            let patterns: Vec<String> = marker_words(locale)
                .iter()
                .map(|w| format!(" {w} "))
                .collect();
            let ac = AhoCorasick::new(&patterns)?;
            automata.push((locale, ac));
        }
        Ok(Self {
            automata,
            default,
            min_confidence: min_confidence.max(1),
        })
    }

    /// Drop scoring for languages outside `enabled`; the default language
    /// is always kept. An empty list leaves every language active.
    pub fn restrict_to(mut self, enabled: &[Locale]) -> Self {
        if !enabled.is_empty() {
            self.automata
                .retain(|(locale, _)| *locale == self.default || enabled.contains(locale));
        }
        self
    }

    pub fn default_locale(&self) -> Locale {
        self.default
    }

    /// Score every locale and return the best. Ties and empty input fall
    /// back to the default locale with zero hits.
    pub fn detect(&self, text: &str) -> Detection {
        let normalized = normalize(text);
        let mut best = Detection {
            locale: self.default,
            hits: 0,
        };
        for (locale, ac) in &self.automata {
            let mut hits = ac.find_iter(&normalized).count() as u32;
            for ch in normalized.chars() {
                if diacritics(*locale).contains(&ch) {
                    hits += 1;
                }
            }
            if hits > best.hits {
                best = Detection {
                    locale: *locale,
                    hits,
                };
            }
        }
        best
    }

    /// The sticky-locale rule: returns the new locale only when a
    /// different one is detected at or above the confidence floor.
    pub fn switch_for(&self, current: Locale, text: &str) -> Option<Locale> {
        let detection = self.detect(text);
        if detection.locale != current && detection.hits >= self.min_confidence {
            Some(detection.locale)
        } else {
            None
        }
    }
}
