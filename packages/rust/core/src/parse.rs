//! Structured model output parsing.
//!
//! Grammar, in order of preference:
//! 1. the first fenced block (```` ```json ```` or bare ```` ``` ````) whose
//!    body starts with `{` or `[`;
//! 2. a balanced `{...}` substring of the text, then a balanced `[...]` one.
//!
//! Bracketed prose before the block (`[nota] {...}`) is skipped: each start
//! position is tried until one deserializes.
//!
//! Anything around the block (prose, apologies, trailing notes) is ignored.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

use tenderscout_shared::TenderScoutError;

/// Why model output could not be turned into a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseFailure {
    #[error("empty model output")]
    Empty,
    #[error("no structured block in model output")]
    NoStructuredBlock,
    #[error("malformed structured block: {0}")]
    Malformed(String),
}

impl From<ParseFailure> for TenderScoutError {
    fn from(failure: ParseFailure) -> Self {
        TenderScoutError::parse(failure.to_string())
    }
}

/// Upper bound on unfenced start positions tried per reply.
const MAX_CANDIDATES: usize = 32;

/// Candidate blocks in preference order: fenced bodies, then balanced runs
/// starting at each `{`, then at each `[`.
fn candidate_blocks(text: &str) -> Result<Vec<Result<&str, ParseFailure>>, ParseFailure> {
    static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").expect("valid regex")
    });

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseFailure::Empty);
    }

    let mut blocks = Vec::new();
    for caps in FENCE_RE.captures_iter(trimmed) {
        if let Some(body) = caps.get(1) {
            let inner = body.as_str().trim();
            if inner.starts_with('{') || inner.starts_with('[') {
                blocks.push(Ok(balanced(inner).unwrap_or(inner)));
            }
        }
    }
    for open in ['{', '['] {
        blocks.extend(
            trimmed
                .match_indices(open)
                .take(MAX_CANDIDATES)
                .map(|(start, _)| balanced(&trimmed[start..])),
        );
    }

    if blocks.is_empty() {
        Err(ParseFailure::NoStructuredBlock)
    } else {
        Ok(blocks)
    }
}

/// Locate the structured block inside `text`.
pub fn structured_block(text: &str) -> Result<&str, ParseFailure> {
    let mut first_failure = None;
    for block in candidate_blocks(text)? {
        match block {
            Ok(block) => return Ok(block),
            Err(failure) => {
                first_failure.get_or_insert(failure);
            }
        }
    }
    Err(first_failure.unwrap_or(ParseFailure::NoStructuredBlock))
}

/// The balanced bracket run at the start of `text`, honoring JSON strings.
fn balanced(text: &str) -> Result<&str, ParseFailure> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Ok(&text[..idx + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    Err(ParseFailure::Malformed("unterminated block".into()))
}

/// Parse model output into `T`.
///
/// Candidates are tried in order; the first one that deserializes wins,
/// otherwise the first candidate's failure is returned.
pub fn parse_structured<T: DeserializeOwned>(text: &str) -> Result<T, ParseFailure> {
    let mut first_failure = None;
    for block in candidate_blocks(text)? {
        let failure = match block {
            Ok(block) => match serde_json::from_str(block) {
                Ok(value) => return Ok(value),
                Err(e) => ParseFailure::Malformed(e.to_string()),
            },
            Err(failure) => failure,
        };
        first_failure.get_or_insert(failure);
    }
    Err(first_failure.unwrap_or(ParseFailure::NoStructuredBlock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        found: bool,
        #[serde(default)]
        name: String,
    }

    #[test]
    fn bare_object() {
        let r: Reply = parse_structured(r#"{"found": true, "name": "SE-72"}"#).unwrap();
        assert_eq!(r, Reply { found: true, name: "SE-72".into() });
    }

    #[test]
    fn object_surrounded_by_prose() {
        let text = "Claro! Aqui está:\n{\"found\": false}\nEspero ter ajudado.";
        let r: Reply = parse_structured(text).unwrap();
        assert!(!r.found);
    }

    #[test]
    fn fenced_json_block() {
        let text = "Resultado:\n```json\n{\"found\": true, \"name\": \"X\"}\n```\nfim";
        let r: Reply = parse_structured(text).unwrap();
        assert_eq!(r.name, "X");
    }

    #[test]
    fn bare_fence_and_array() {
        let text = "```\n[1, 2, 3]\n```";
        let v: Vec<u32> = parse_structured(text).unwrap();
        assert_eq!(v, vec![1, 2, 3]);
    }

    #[test]
    fn braces_inside_strings_do_not_close_the_block() {
        let text = r#"note {"found": true, "name": "modelo {v2} \"pro\""} trailing }"#;
        let r: Reply = parse_structured(text).unwrap();
        assert_eq!(r.name, "modelo {v2} \"pro\"");
    }

    #[test]
    fn bracketed_prose_before_object() {
        let r: Reply = parse_structured("[nota] {\"found\": true}").unwrap();
        assert!(r.found);
        assert_eq!(structured_block("[nota] {\"found\": true}"), Ok("{\"found\": true}"));

        let text = "Resposta [parcial]: {\"x\": 1} e depois {\"found\": false, \"name\": \"Y\"}";
        let r: Reply = parse_structured(text).unwrap();
        assert_eq!(r, Reply { found: false, name: "Y".into() });
    }

    #[test]
    fn unfenced_array_of_objects() {
        let v: Vec<Reply> = parse_structured("lista: [{\"found\": true}, {\"found\": false}]").unwrap();
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn typed_failures() {
        assert_eq!(parse_structured::<Reply>("   "), Err(ParseFailure::Empty));
        assert_eq!(
            parse_structured::<Reply>("não encontrei nada"),
            Err(ParseFailure::NoStructuredBlock)
        );
        assert!(matches!(
            parse_structured::<Reply>("{\"found\": tru"),
            Err(ParseFailure::Malformed(_))
        ));
        assert!(matches!(
            parse_structured::<Reply>("{\"name\": \"x\"}"),
            Err(ParseFailure::Malformed(_))
        ));
    }

    #[test]
    fn failure_converts_to_parse_error() {
        let err: TenderScoutError = ParseFailure::Empty.into();
        assert!(err.to_string().starts_with("parse error"));
    }
}
