//! Query string → tokens.

use crate::error::{LexError, LexErrorKind};
use crate::query::ast::{Comparator, Field, WildcardKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// `-` directly attached to the next token.
    Negate,
    /// `~` directly attached to the next token.
    Union,
    Word {
        text: String,
        wildcard: WildcardKind,
    },
    Phrase(String),
    /// `name:value`. The name is kept raw; the parser decides whether it is a field.
    Field {
        name: String,
        comparator: Comparator,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token in the query.
    pub position: usize,
    /// Source text of the token.
    pub raw: String,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];
        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        if c == b'-' || c == b'~' {
            let marker = c as char;
            let attached = bytes
                .get(pos + 1)
                .map(|next| !next.is_ascii_whitespace())
                .unwrap_or(false);
            if !attached {
                return Err(LexError {
                    position: pos,
                    kind: LexErrorKind::DanglingMarker(marker),
                });
            }
            tokens.push(Token {
                kind: if marker == '-' {
                    TokenKind::Negate
                } else {
                    TokenKind::Union
                },
                position: pos,
                raw: marker.to_string(),
            });
            pos += 1;
            continue;
        }

        if c == b'"' {
            let start = pos;
            let close = input[pos + 1..].find('"').ok_or(LexError {
                position: start,
                kind: LexErrorKind::UnterminatedQuote,
            })?;
            let body = &input[pos + 1..pos + 1 + close];
            if body.trim().is_empty() {
                return Err(LexError {
                    position: start,
                    kind: LexErrorKind::EmptyPhrase,
                });
            }
            pos = pos + close + 2;
            tokens.push(Token {
                kind: TokenKind::Phrase(body.to_string()),
                position: start,
                raw: input[start..pos].to_string(),
            });
            continue;
        }

        let start = pos;
        while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() && bytes[pos] != b'"' {
            pos += 1;
        }
        let word = &input[start..pos];
        tokens.push(Token {
            kind: classify_word(word, start)?,
            position: start,
            raw: word.to_string(),
        });
    }

    Ok(tokens)
}

fn classify_word(word: &str, position: usize) -> Result<TokenKind, LexError> {
    if let Some((name, rest)) = word.split_once(':') {
        if !name.is_empty() && name.chars().all(|ch| ch.is_ascii_alphabetic() || ch == '_') {
            if rest.is_empty() {
                return Err(LexError {
                    position,
                    kind: LexErrorKind::EmptyFieldValue(name.to_string()),
                });
            }
            let (comparator, value) = split_comparator(rest);
            let value = if Field::from_name(name) == Some(Field::FileSize) {
                convert_filesize(value).unwrap_or_else(|| value.to_string())
            } else {
                value.to_string()
            };
            return Ok(TokenKind::Field {
                name: name.to_string(),
                comparator,
                value,
            });
        }
    }

    let leading = word.starts_with('*');
    let trailing = word.len() > 1 && word.ends_with('*');
    let wildcard = match (leading, trailing) {
        (true, true) => WildcardKind::Substring,
        (true, false) => WildcardKind::Suffix,
        (false, true) => WildcardKind::Prefix,
        (false, false) => WildcardKind::Exact,
    };
    let text = word.trim_start_matches('*').trim_end_matches('*');
    Ok(TokenKind::Word {
        text: if wildcard == WildcardKind::Exact {
            word.to_string()
        } else {
            text.to_string()
        },
        wildcard,
    })
}

/// Strip one leading comparator. Anything left over stays in the value.
fn split_comparator(rest: &str) -> (Comparator, &str) {
    if let Some(v) = rest.strip_prefix(">=") {
        (Comparator::Ge, v)
    } else if let Some(v) = rest.strip_prefix("<=") {
        (Comparator::Le, v)
    } else if let Some(v) = rest.strip_prefix('>') {
        (Comparator::Gt, v)
    } else if let Some(v) = rest.strip_prefix('<') {
        (Comparator::Lt, v)
    } else if let Some(v) = rest.strip_prefix('=') {
        (Comparator::Eq, v)
    } else {
        (Comparator::Eq, rest)
    }
}

/// Rewrite a size such as `1.5mb` (or a range `1kb..2mb`) into plain bytes.
fn convert_filesize(value: &str) -> Option<String> {
    if let Some((lo, hi)) = value.split_once("..") {
        return Some(format!("{}..{}", size_to_bytes(lo)?, size_to_bytes(hi)?));
    }
    size_to_bytes(value).map(|b| b.to_string())
}

pub fn size_to_bytes(value: &str) -> Option<i64> {
    const UNITS: [(&str, f64); 4] = [
        ("gb", 1024.0 * 1024.0 * 1024.0),
        ("mb", 1024.0 * 1024.0),
        ("kb", 1024.0),
        ("b", 1.0),
    ];
    let lowered = value.trim().to_ascii_lowercase();
    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, mult)| lowered.strip_suffix(suffix).map(|n| (n, *mult)))
        .unwrap_or((lowered.as_str(), 1.0));

    if number.is_empty() || !number.chars().all(|ch| ch.is_ascii_digit() || ch == '.') {
        return None;
    }
    let parsed: f64 = number.parse().ok()?;
    Some((parsed * multiplier) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_bare_words_and_markers() {
        assert_eq!(
            kinds("wolf -fox ~dog"),
            vec![
                TokenKind::Word { text: "wolf".into(), wildcard: WildcardKind::Exact },
                TokenKind::Negate,
                TokenKind::Word { text: "fox".into(), wildcard: WildcardKind::Exact },
                TokenKind::Union,
                TokenKind::Word { text: "dog".into(), wildcard: WildcardKind::Exact },
            ]
        );
    }

    #[test]
    fn test_field_clause_comparators() {
        assert_eq!(
            kinds("score:>=10 id:5"),
            vec![
                TokenKind::Field { name: "score".into(), comparator: Comparator::Ge, value: "10".into() },
                TokenKind::Field { name: "id".into(), comparator: Comparator::Eq, value: "5".into() },
            ]
        );
    }

    #[test]
    fn test_doubled_comparator_left_in_value() {
        assert_eq!(
            kinds("score:>>100"),
            vec![TokenKind::Field { name: "score".into(), comparator: Comparator::Gt, value: ">100".into() }]
        );
    }

    #[test]
    fn test_filesize_converted_to_bytes() {
        assert_eq!(
            kinds("filesize:>1MB size:500kb filesize:1.5kb"),
            vec![
                TokenKind::Field { name: "filesize".into(), comparator: Comparator::Gt, value: "1048576".into() },
                TokenKind::Field { name: "size".into(), comparator: Comparator::Eq, value: "512000".into() },
                TokenKind::Field { name: "filesize".into(), comparator: Comparator::Eq, value: "1536".into() },
            ]
        );
        assert_eq!(size_to_bytes("12b"), Some(12));
        assert_eq!(size_to_bytes("2gb"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(size_to_bytes("mb"), None);
    }

    #[test]
    fn test_wildcards() {
        assert_eq!(
            kinds("cat* *cat *cat* *"),
            vec![
                TokenKind::Word { text: "cat".into(), wildcard: WildcardKind::Prefix },
                TokenKind::Word { text: "cat".into(), wildcard: WildcardKind::Suffix },
                TokenKind::Word { text: "cat".into(), wildcard: WildcardKind::Substring },
                TokenKind::Word { text: "".into(), wildcard: WildcardKind::Suffix },
            ]
        );
    }

    #[test]
    fn test_quoted_phrase() {
        let tokens = tokenize("\"long hair\" wolf").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Phrase("long hair".into()));
        assert_eq!(tokens[0].raw, "\"long hair\"");
        assert_eq!(tokens[1].position, 12);
    }

    #[test]
    fn test_unterminated_quote_reports_position() {
        let err = tokenize("wolf \"long hair").unwrap_err();
        assert_eq!(err.position, 5);
        assert_eq!(err.kind, LexErrorKind::UnterminatedQuote);
    }

    #[test]
    fn test_empty_tokens_rejected() {
        assert_eq!(tokenize("wolf - fox").unwrap_err().kind, LexErrorKind::DanglingMarker('-'));
        assert_eq!(tokenize("wolf ~").unwrap_err().position, 5);
        assert_eq!(tokenize("\"  \"").unwrap_err().kind, LexErrorKind::EmptyPhrase);
        assert_eq!(
            tokenize("score:").unwrap_err().kind,
            LexErrorKind::EmptyFieldValue("score".into())
        );
    }

    #[test]
    fn test_colon_tags_that_are_not_fields() {
        assert_eq!(
            kinds("3:4"),
            vec![TokenKind::Word { text: "3:4".into(), wildcard: WildcardKind::Exact }]
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(tokenize("   ").unwrap().is_empty());
    }
}
