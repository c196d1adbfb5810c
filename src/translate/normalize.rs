//! Text normalization around the translation call.
//! Cache keys use a trimmed, case-folded form of the text. Before the text
//! reaches the model, untranslatable tokens are swapped for placeholder tags
//! and restored afterwards.

use regex::{Captures, Regex};

/// Trim and case-fold text for cache keying.
pub fn normalize_for_key(text: &str) -> String {
    text.trim().to_lowercase()
}

/// A placeholder substitution that must be restored after translation.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderEntry {
    pub tag: String,
    pub original: String,
}

/// Replaces URLs, e-mail addresses, @mentions, inline code and numbers with
/// units by `<<PHn>>` tags so the model leaves them untouched.
///
/// Numbering starts above any `<<PHn>>` already present in the input, so
/// literal tags survive `restore` unchanged.
pub struct PlaceholderProtector {
    patterns: Vec<Regex>,
    tag: Regex,
}

impl Default for PlaceholderProtector {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaceholderProtector {
    pub fn new() -> Self {
        // earlier patterns win overlapping spans
        let sources = [
            r"https?://[^\s,，。)）\]]+",
            r"[a-zA-Z0-9._%+\-]+@[a-zA-Z0-9.\-]+\.[a-zA-Z]{2,}",
            r"(?:^|\B)@[A-Za-z0-9_]{2,32}\b",
            r"`[^`]+`",
            r"[$€¥£]?\d+(?:\.\d+)?(?:%|(?:px|kg|km|mb|gb|ms)\b)",
        ];
        Self {
            patterns: sources
                .iter()
                .map(|p| Regex::new(p).expect("placeholder pattern is valid"))
                .collect(),
            tag: Regex::new(r"<<PH(\d+)>>").expect("tag pattern is valid"),
        }
    }

    /// Returns the protected text and the entries needed to restore it.
    pub fn protect(&self, text: &str) -> (String, Vec<PlaceholderEntry>) {
        let first_free = self
            .tag
            .captures_iter(text)
            .filter_map(|c| c[1].parse::<usize>().ok())
            .map(|n| n.saturating_add(1))
            .max()
            .unwrap_or(0);

        let mut spans: Vec<(usize, usize)> = Vec::new();
        for pat in &self.patterns {
            for m in pat.find_iter(text) {
                let free = spans
                    .iter()
                    .all(|&(start, end)| m.end() <= start || m.start() >= end);
                if free && !m.as_str().is_empty() {
                    spans.push((m.start(), m.end()));
                }
            }
        }
        spans.sort_unstable();

        let mut protected = String::with_capacity(text.len());
        let mut entries = Vec::with_capacity(spans.len());
        let mut cursor = 0;
        for (start, end) in spans {
            protected.push_str(&text[cursor..start]);
            let tag = format!("<<PH{}>>", first_free + entries.len());
            protected.push_str(&tag);
            entries.push(PlaceholderEntry {
                tag,
                original: text[start..end].to_string(),
            });
            cursor = end;
        }
        protected.push_str(&text[cursor..]);

        (protected, entries)
    }

    /// Put the originals back. Tags not produced by `protect` are left as is.
    pub fn restore(&self, text: &str, entries: &[PlaceholderEntry]) -> String {
        if entries.is_empty() {
            return text.to_string();
        }
        self.tag
            .replace_all(text, |caps: &Captures| {
                entries
                    .iter()
                    .find(|e| e.tag == caps[0])
                    .map_or_else(|| caps[0].to_string(), |e| e.original.clone())
            })
            .into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_normalization_trims_and_folds() {
        assert_eq!(normalize_for_key("  Hello WORLD\n"), "hello world");
    }

    #[test]
    fn protects_urls_and_code() {
        let p = PlaceholderProtector::new();
        let (text, entries) = p.protect("see https://example.com/a and run `cargo fmt`");
        assert_eq!(text, "see <<PH0>> and run <<PH1>>");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].original, "https://example.com/a");
        assert_eq!(entries[1].original, "`cargo fmt`");
    }

    #[test]
    fn restore_reverses_protect() {
        let p = PlaceholderProtector::new();
        let original = "mail bob@example.org about the 20% discount";
        let (protected, entries) = p.protect(original);
        assert!(!protected.contains("bob@example.org"));
        assert_eq!(p.restore(&protected, &entries), original);
    }

    #[test]
    fn literal_tags_in_input_survive() {
        let p = PlaceholderProtector::new();
        let original = "the template uses <<PH0>>, docs at https://example.com/t";
        let (protected, entries) = p.protect(original);
        assert_eq!(protected, "the template uses <<PH0>>, docs at <<PH1>>");
        assert_eq!(entries[0].tag, "<<PH1>>");
        assert_eq!(p.restore(&protected, &entries), original);
    }

    #[test]
    fn repeated_tokens_each_get_a_tag() {
        let p = PlaceholderProtector::new();
        let original = "ping @sam then @sam again";
        let (protected, entries) = p.protect(original);
        assert_eq!(protected, "ping <<PH0>> then <<PH1>> again");
        assert_eq!(entries.len(), 2);
        assert_eq!(p.restore(&protected, &entries), original);
    }

    #[test]
    fn plain_text_is_untouched() {
        let p = PlaceholderProtector::new();
        let (text, entries) = p.protect("Hello there");
        assert_eq!(text, "Hello there");
        assert!(entries.is_empty());
    }
}
