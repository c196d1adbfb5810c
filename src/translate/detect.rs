//! Heuristic language detection.
//! Script ranges decide non-Latin languages; Latin-script languages are scored
//! by diacritics and common function words. Long text with no clear signal is
//! handed to whatlang. Anything else falls back to English at 0.5.
//! Deterministic: the same input always yields the same result.

use regex::Regex;
use serde::Serialize;
use whatlang::Lang;

pub const DEFAULT_LANGUAGE: &str = "en";
const DEFAULT_CONFIDENCE: f64 = 0.5;
/// Below this many characters whatlang is not consulted.
const STATISTICAL_MIN_CHARS: usize = 24;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub language: String,
    pub confidence: f64,
}

impl Detection {
    fn new(language: &str, confidence: f64) -> Self {
        Self {
            language: language.to_string(),
            confidence,
        }
    }
}

struct LatinRule {
    code: &'static str,
    diacritics: Option<Regex>,
    keywords: Regex,
}

pub struct LanguageDetector {
    latin: Vec<LatinRule>,
}

impl Default for LanguageDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageDetector {
    pub fn new() -> Self {
        // Order matters: earlier rules win ties.
        let table: [(&'static str, Option<&str>, &[&str]); 6] = [
            (
                "en",
                None,
                &[
                    "the", "and", "is", "are", "you", "hello", "hi", "thanks", "what", "this",
                    "that", "with", "have", "how", "good", "morning", "please", "yes",
                ],
            ),
            (
                "es",
                Some("[ñ¿¡]"),
                &[
                    "el", "los", "las", "que", "es", "por", "para", "como", "está", "hola",
                    "gracias", "buenos", "buenas", "qué", "cómo", "sí", "usted", "muy",
                ],
            ),
            (
                "fr",
                Some("[çœàèêëîïûù]"),
                &[
                    "le", "les", "et", "est", "une", "des", "je", "vous", "nous", "bonjour",
                    "merci", "très", "avec", "pas", "oui", "salut", "ça",
                ],
            ),
            (
                "de",
                Some("[äöüß]"),
                &[
                    "der", "die", "das", "und", "ist", "nicht", "ich", "ein", "eine", "mit",
                    "danke", "hallo", "guten", "bitte", "ja", "auch", "wie",
                ],
            ),
            (
                "pt",
                Some("[ãõ]"),
                &[
                    "não", "você", "obrigado", "obrigada", "olá", "uma", "com", "são", "muito",
                    "tudo", "bem", "sim", "bom", "dia",
                ],
            ),
            (
                "it",
                None,
                &[
                    "il", "che", "non", "sono", "grazie", "ciao", "buongiorno", "della", "per",
                    "è", "anche", "molto", "bene", "come",
                ],
            ),
        ];

        let latin = table
            .into_iter()
            .map(|(code, diacritics, words)| LatinRule {
                code,
                diacritics: diacritics.map(|d| Regex::new(d).expect("diacritic pattern is valid")),
                keywords: Regex::new(&format!(r"(?i)\b(?:{})\b", words.join("|")))
                    .expect("keyword pattern is valid"),
            })
            .collect();

        Self { latin }
    }

    /// Best-guess language code with a confidence in 0.0..=1.0.
    pub fn detect(&self, text: &str) -> Detection {
        let text = text.trim();
        if text.is_empty() {
            return Detection::new(DEFAULT_LANGUAGE, DEFAULT_CONFIDENCE);
        }

        if let Some(found) = detect_script(text) {
            return found;
        }

        if let Some(found) = self.detect_latin(text) {
            return found;
        }

        if text.chars().count() >= STATISTICAL_MIN_CHARS {
            if let Some(info) = whatlang::detect(text) {
                if info.is_reliable() {
                    if let Some(code) = lang_to_code(info.lang()) {
                        return Detection::new(code, info.confidence().min(0.9));
                    }
                }
            }
        }

        Detection::new(DEFAULT_LANGUAGE, DEFAULT_CONFIDENCE)
    }

    fn detect_latin(&self, text: &str) -> Option<Detection> {
        let mut best: Option<(&'static str, usize)> = None;
        for rule in &self.latin {
            let diacritic_hits = rule
                .diacritics
                .as_ref()
                .map_or(0, |re| re.find_iter(text).count());
            let score = diacritic_hits * 2 + rule.keywords.find_iter(text).count();
            if score > 0 && best.map_or(true, |(_, top)| score > top) {
                best = Some((rule.code, score));
            }
        }
        best.map(|(code, score)| Detection::new(code, (0.5 + 0.1 * score as f64).min(0.9)))
    }
}

/// Classify by Unicode script when a non-Latin script dominates the letters.
fn detect_script(text: &str) -> Option<Detection> {
    let mut kana = 0usize;
    let mut hangul = 0usize;
    let mut han = 0usize;
    let mut cyrillic = 0usize;
    let mut ukrainian = 0usize;
    let mut arabic = 0usize;
    let mut devanagari = 0usize;
    let mut thai = 0usize;
    let mut greek = 0usize;
    let mut hebrew = 0usize;
    let mut letters = 0usize;

    for c in text.chars().filter(|c| c.is_alphabetic()) {
        letters += 1;
        match c as u32 {
            0x3040..=0x30FF => kana += 1,
            0xAC00..=0xD7AF | 0x1100..=0x11FF => hangul += 1,
            0x4E00..=0x9FFF | 0x3400..=0x4DBF => han += 1,
            0x0400..=0x04FF => {
                cyrillic += 1;
                if matches!(c, 'і' | 'ї' | 'є' | 'ґ' | 'І' | 'Ї' | 'Є' | 'Ґ') {
                    ukrainian += 1;
                }
            }
            0x0600..=0x06FF => arabic += 1,
            0x0900..=0x097F => devanagari += 1,
            0x0E00..=0x0E7F => thai += 1,
            0x0370..=0x03FF => greek += 1,
            0x0590..=0x05FF => hebrew += 1,
            _ => {}
        }
    }
    if letters == 0 {
        return None;
    }

    // Kana anywhere means Japanese even when kanji dominate.
    let (code, count) = if kana > 0 {
        ("ja", kana + han)
    } else {
        [
            ("ko", hangul),
            ("zh", han),
            (if ukrainian > 0 { "uk" } else { "ru" }, cyrillic),
            ("ar", arabic),
            ("hi", devanagari),
            ("th", thai),
            ("el", greek),
            ("he", hebrew),
        ]
        .into_iter()
        .max_by_key(|&(_, n)| n)?
    };

    let ratio = count as f64 / letters as f64;
    if ratio < 0.3 {
        return None;
    }
    Some(Detection::new(code, (0.6 + 0.35 * ratio).min(0.95)))
}

fn lang_to_code(lang: Lang) -> Option<&'static str> {
    use whatlang::Lang::*;
    let code = match lang {
        Eng => "en",
        Spa => "es",
        Fra => "fr",
        Deu => "de",
        Por => "pt",
        Ita => "it",
        Nld => "nl",
        Pol => "pl",
        Tur => "tr",
        Vie => "vi",
        Swe => "sv",
        Dan => "da",
        Ron => "ro",
        Ces => "cs",
        Hun => "hu",
        Fin => "fi",
        Ind => "id",
        _ => return None,
    };
    Some(code)
}

/// Compare language tags by primary subtag, ignoring case ("es-MX" == "ES").
pub fn same_language(a: &str, b: &str) -> bool {
    fn primary(tag: &str) -> &str {
        tag.trim().split(['-', '_']).next().unwrap_or("")
    }
    let (a, b) = (primary(a), primary(b));
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn english_greeting() {
        let d = LanguageDetector::new().detect("Hello");
        assert_eq!(d.language, "en");
        assert!(d.confidence > 0.5);
    }

    #[test]
    fn spanish_by_diacritics_and_words() {
        let d = LanguageDetector::new().detect("¡Hola! ¿Cómo estás?");
        assert_eq!(d.language, "es");
    }

    #[test]
    fn french_and_german() {
        let det = LanguageDetector::new();
        assert_eq!(det.detect("Bonjour, merci beaucoup").language, "fr");
        assert_eq!(det.detect("Guten Morgen, danke schön").language, "de");
    }

    #[test]
    fn non_latin_scripts() {
        let det = LanguageDetector::new();
        assert_eq!(det.detect("こんにちは世界").language, "ja");
        assert_eq!(det.detect("你好世界").language, "zh");
        assert_eq!(det.detect("안녕하세요").language, "ko");
        assert_eq!(det.detect("Привет, как дела?").language, "ru");
        assert_eq!(det.detect("Привіт, як справи?").language, "uk");
        assert_eq!(det.detect("مرحبا بالعالم").language, "ar");
    }

    #[test]
    fn unknown_text_defaults_to_english() {
        let d = LanguageDetector::new().detect("xyzzy 12345");
        assert_eq!(d, Detection::new(DEFAULT_LANGUAGE, DEFAULT_CONFIDENCE));
        let empty = LanguageDetector::new().detect("   ");
        assert_eq!(empty.language, DEFAULT_LANGUAGE);
    }

    #[test]
    fn detection_is_deterministic() {
        let det = LanguageDetector::new();
        let text = "Das ist nicht gut, aber auch nicht schlecht";
        assert_eq!(det.detect(text), det.detect(text));
    }

    #[test]
    fn language_tag_comparison() {
        assert!(same_language("es", "ES"));
        assert!(same_language("es-MX", "es"));
        assert!(same_language("pt_BR", "pt"));
        assert!(!same_language("en", "es"));
        assert!(!same_language("", ""));
    }
}
