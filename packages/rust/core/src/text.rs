//! Text normalization shared by the agents and the deterministic fallbacks.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

/// Words that never distinguish one product from another.
const STOPWORDS: &[&str] = &[
    "a", "o", "as", "os", "e", "de", "da", "do", "das", "dos", "em", "no", "na", "nos", "nas",
    "com", "sem", "para", "por", "um", "uma", "ou", "the", "and", "with", "for", "of",
];

/// Lowercase and strip Portuguese diacritics.
pub fn fold(s: &str) -> String {
    s.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            'ñ' => 'n',
            other => other,
        })
        .collect()
}

/// Folded alphanumeric tokens without stopwords.
pub fn tokens(s: &str) -> Vec<String> {
    fold(s)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Share of `needle`'s tokens that appear in `haystack`. Zero when `needle`
/// has no tokens.
pub fn overlap_ratio(needle: &str, haystack: &str) -> f64 {
    let wanted = tokens(needle);
    if wanted.is_empty() {
        return 0.0;
    }
    let have: HashSet<String> = tokens(haystack).into_iter().collect();
    let hits = wanted.iter().filter(|t| have.contains(*t)).count();
    hits as f64 / wanted.len() as f64
}

/// Whether `text` states `spec` (at least three quarters of its tokens).
pub fn spec_present(spec: &str, text: &str) -> bool {
    overlap_ratio(spec, text) >= 0.75
}

/// Whitespace-separated word count.
pub fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// The first `n` words of `s`.
pub fn first_words(s: &str, n: usize) -> String {
    s.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

/// Collapse runs of whitespace into single spaces.
pub fn squash(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `max` characters of `s`, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Cache key for a description: SHA-256 of its folded alphanumeric words.
pub fn description_key(description: &str) -> String {
    let normalized = fold(description)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Remove numbers (and the decimal separators inside them).
pub fn strip_numerals(s: &str) -> String {
    static NUM_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d+(?:[.,]\d+)*").expect("valid regex"));
    squash(&NUM_RE.replace_all(s, " "))
}

/// Remove search operators (`site:`, `filetype:`, ...), quotes and
/// `+`/`-` prefixes from a query.
pub fn strip_query_operators(query: &str) -> String {
    static OPERATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)\b(?:site|filetype|intitle|inurl|intext|related):\S*").expect("valid regex")
    });

    let without_ops = OPERATOR_RE.replace_all(query, " ");
    let cleaned: Vec<String> = without_ops
        .replace(['"', '“', '”', '\''], " ")
        .split_whitespace()
        .map(|t| t.trim_start_matches(['+', '-']).to_string())
        .filter(|t| !t.is_empty() && t != "OR" && t != "AND")
        .collect();
    cleaned.join(" ")
}

/// Case- and accent-insensitive equality.
pub fn same_text(a: &str, b: &str) -> bool {
    fold(&squash(a)) == fold(&squash(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_strips_accents() {
        assert_eq!(fold("Músicas PRÉ-GRAVADAS ção"), "musicas pre-gravadas cao");
    }

    #[test]
    fn tokens_drop_stopwords() {
        assert_eq!(tokens("Sirene escolar com 72 músicas"), vec!["sirene", "escolar", "72", "musicas"]);
    }

    #[test]
    fn overlap_ratio_counts_needle_tokens() {
        assert_eq!(overlap_ratio("Acme SE-72", "Sirene Acme SE-72 digital"), 1.0);
        assert_eq!(overlap_ratio("Acme SE-72", "Sirene Acme"), 1.0 / 3.0);
        assert_eq!(overlap_ratio("", "anything"), 0.0);
    }

    #[test]
    fn spec_presence_tolerates_accents() {
        assert!(spec_present("72 músicas", "Sirene com 72 MUSICAS pré-gravadas"));
        assert!(!spec_present("72 músicas", "Sirene com 36 músicas"));
    }

    #[test]
    fn description_key_is_stable_under_formatting() {
        assert_eq!(
            description_key("Sirene  Escolar, com 72 músicas"),
            description_key("sirene escolar com 72 MÚSICAS")
        );
        assert_ne!(description_key("sirene"), description_key("caneta"));
        assert_eq!(description_key("x").len(), 64);
    }

    #[test]
    fn numerals_are_stripped() {
        assert_eq!(strip_numerals("72 músicas e 1,5 m"), "músicas e m");
    }

    #[test]
    fn query_operators_are_stripped() {
        assert_eq!(
            strip_query_operators(r#""sirene escolar" site:acme.com +72 -usado filetype:pdf"#),
            "sirene escolar 72 usado"
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("pré-gravadas", 3), "pré");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }

    #[test]
    fn first_words_takes_prefix() {
        assert_eq!(first_words("sirene escolar digital", 2), "sirene escolar");
    }
}
