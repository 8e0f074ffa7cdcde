//! Tokens → [`Query`].
//!
//! Runs of `~` terms become one [`TagGroup`]; every group is ANDed with the
//! rest of the query. Only tag terms may join a group.

use crate::error::{ParseError, ParseErrorKind, SearchError};
use crate::query::ast::{
    Comparator, Field, FieldKind, FieldTerm, FieldValue, FileType, Query, QueryNode, Rating,
    TagGroup, TagTerm, WildcardKind,
};
use crate::query::lexer::{tokenize, Token, TokenKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct ParseOptions {
    /// Reject `name:value` clauses whose name is not a known field.
    pub strict_fields: bool,
}

/// What a `name:value` token turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field(FieldTerm),
    FreeTextTag(TagTerm),
}

/// Lex and parse in one step.
pub fn parse_query(input: &str, options: ParseOptions) -> Result<Query, SearchError> {
    let tokens = tokenize(input)?;
    Ok(parse_tokens(&tokens, options)?)
}

pub fn parse_tokens(tokens: &[Token], options: ParseOptions) -> Result<Query, ParseError> {
    let mut nodes = Vec::new();
    let mut group: Vec<TagTerm> = Vec::new();
    let mut iter = tokens.iter();

    loop {
        let mut negated = false;
        let mut union = false;
        let mut prefix = String::new();

        let token = loop {
            match iter.next() {
                Some(Token { kind: TokenKind::Negate, .. }) => {
                    negated = !negated;
                    prefix.push('-');
                }
                Some(Token { kind: TokenKind::Union, .. }) => {
                    union = true;
                    prefix.push('~');
                }
                other => break other,
            }
        };
        let Some(token) = token else {
            break;
        };
        let clause_text = format!("{}{}", prefix, token.raw);

        let clause = match &token.kind {
            TokenKind::Word { text, wildcard } => {
                if *wildcard != WildcardKind::Exact && text.trim_matches('*').is_empty() {
                    return Err(ParseError {
                        clause: clause_text,
                        kind: ParseErrorKind::EmptyWildcard,
                    });
                }
                Clause::FreeTextTag(TagTerm::new(text, *wildcard, negated))
            }
            TokenKind::Phrase(body) => {
                Clause::FreeTextTag(TagTerm::new(body, WildcardKind::Exact, negated))
            }
            TokenKind::Field {
                name,
                comparator,
                value,
            } => resolve_field_clause(token, name, *comparator, value, negated, options)
                .map_err(|kind| ParseError {
                    clause: clause_text.clone(),
                    kind,
                })?,
            TokenKind::Negate | TokenKind::Union => continue,
        };

        match (union, clause) {
            (true, Clause::FreeTextTag(tag)) => group.push(tag),
            (true, Clause::Field(_)) => {
                return Err(ParseError {
                    clause: clause_text,
                    kind: ParseErrorKind::FieldInGroup,
                })
            }
            (false, clause) => {
                flush_group(&mut group, &mut nodes);
                nodes.push(match clause {
                    Clause::Field(term) => QueryNode::Field(term),
                    Clause::FreeTextTag(tag) => QueryNode::Tag(tag),
                });
            }
        }
    }
    flush_group(&mut group, &mut nodes);

    Ok(Query::new(nodes))
}

fn flush_group(group: &mut Vec<TagTerm>, nodes: &mut Vec<QueryNode>) {
    if !group.is_empty() {
        nodes.push(QueryNode::Group(TagGroup {
            members: std::mem::take(group),
            negated: false,
        }));
    }
}

fn resolve_field_clause(
    token: &Token,
    name: &str,
    comparator: Comparator,
    value: &str,
    negated: bool,
    options: ParseOptions,
) -> Result<Clause, ParseErrorKind> {
    let Some(field) = Field::from_name(name) else {
        if options.strict_fields {
            return Err(ParseErrorKind::UnknownField(name.to_string()));
        }
        return Ok(Clause::FreeTextTag(TagTerm::new(
            &token.raw,
            WildcardKind::Exact,
            negated,
        )));
    };

    let typed = match field.kind() {
        FieldKind::Integer => parse_integer_value(value)?,
        FieldKind::Rating => {
            require_equality(field, comparator)?;
            FieldValue::Rating(Rating::parse(value).ok_or(ParseErrorKind::InvalidValue {
                value: value.to_string(),
                expected: "rating (s, q, e)",
            })?)
        }
        FieldKind::FileType => {
            require_equality(field, comparator)?;
            FieldValue::FileType(FileType::parse(value).ok_or(ParseErrorKind::InvalidValue {
                value: value.to_string(),
                expected: "file type",
            })?)
        }
    };

    if matches!(typed, FieldValue::Range(..)) {
        require_equality(field, comparator)?;
    }

    Ok(Clause::Field(FieldTerm {
        field,
        comparator,
        value: typed,
        negated,
    }))
}

fn require_equality(field: Field, comparator: Comparator) -> Result<(), ParseErrorKind> {
    if comparator == Comparator::Eq {
        Ok(())
    } else {
        Err(ParseErrorKind::InvalidComparator {
            field: field.name().to_string(),
            comparator: comparator.symbol().to_string(),
        })
    }
}

fn parse_integer_value(value: &str) -> Result<FieldValue, ParseErrorKind> {
    if value.starts_with(['<', '>', '=']) {
        return Err(ParseErrorKind::MalformedComparator(value.to_string()));
    }
    if let Some((lo, hi)) = value.split_once("..") {
        let lo = parse_int(lo)?;
        let hi = parse_int(hi)?;
        if lo > hi {
            return Err(ParseErrorKind::InvalidValue {
                value: value.to_string(),
                expected: "ascending range",
            });
        }
        return Ok(FieldValue::Range(lo, hi));
    }
    Ok(FieldValue::Int(parse_int(value)?))
}

fn parse_int(value: &str) -> Result<i64, ParseErrorKind> {
    value.trim().parse().map_err(|_| ParseErrorKind::InvalidValue {
        value: value.to_string(),
        expected: "integer",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Query {
        parse_query(input, ParseOptions::default()).unwrap()
    }

    fn parse_err(input: &str, options: ParseOptions) -> ParseError {
        match parse_query(input, options) {
            Err(SearchError::Parse(err)) => err,
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_conjunction_of_tags() {
        let q = parse("wolf dog");
        assert_eq!(
            q.nodes,
            vec![
                QueryNode::Tag(TagTerm::exact("wolf")),
                QueryNode::Tag(TagTerm::exact("dog")),
            ]
        );
    }

    #[test]
    fn test_union_run_collapses_into_group() {
        let q = parse("~wolf ~dog canine ~fox");
        assert_eq!(q.nodes.len(), 3);
        match &q.nodes[0] {
            QueryNode::Group(g) => {
                assert_eq!(g.members, vec![TagTerm::exact("wolf"), TagTerm::exact("dog")]);
            }
            other => panic!("expected group, got {:?}", other),
        }
        assert_eq!(q.nodes[1], QueryNode::Tag(TagTerm::exact("canine")));
        assert!(matches!(&q.nodes[2], QueryNode::Group(g) if g.members.len() == 1));
    }

    #[test]
    fn test_negation_applies_to_single_member() {
        let q = parse("~wolf ~-dog -fox");
        match &q.nodes[0] {
            QueryNode::Group(g) => {
                assert!(!g.members[0].negated);
                assert!(g.members[1].negated);
            }
            other => panic!("expected group, got {:?}", other),
        }
        assert_eq!(
            q.nodes[1],
            QueryNode::Tag(TagTerm::new("fox", WildcardKind::Exact, true))
        );
        assert_eq!(parse("-~wolf ~dog").nodes, parse("~-wolf ~dog").nodes);
    }

    #[test]
    fn test_field_terms_typed() {
        let q = parse("rating:e -type:webm score:>50 filesize:<=1kb width:100..200");
        assert_eq!(
            q.nodes,
            vec![
                QueryNode::Field(FieldTerm {
                    field: Field::Rating,
                    comparator: Comparator::Eq,
                    value: FieldValue::Rating(Rating::Explicit),
                    negated: false,
                }),
                QueryNode::Field(FieldTerm {
                    field: Field::Type,
                    comparator: Comparator::Eq,
                    value: FieldValue::FileType(FileType::Webm),
                    negated: true,
                }),
                QueryNode::Field(FieldTerm {
                    field: Field::Score,
                    comparator: Comparator::Gt,
                    value: FieldValue::Int(50),
                    negated: false,
                }),
                QueryNode::Field(FieldTerm {
                    field: Field::FileSize,
                    comparator: Comparator::Le,
                    value: FieldValue::Int(1024),
                    negated: false,
                }),
                QueryNode::Field(FieldTerm {
                    field: Field::Width,
                    comparator: Comparator::Eq,
                    value: FieldValue::Range(100, 200),
                    negated: false,
                }),
            ]
        );
    }

    #[test]
    fn test_doubled_comparator_is_parse_error() {
        let err = parse_err("wolf score:>>100", ParseOptions::default());
        assert_eq!(err.clause, "score:>>100");
        assert_eq!(err.kind, ParseErrorKind::MalformedComparator(">100".into()));
    }

    #[test]
    fn test_invalid_comparator_for_enum_field() {
        let err = parse_err("-rating:>s", ParseOptions::default());
        assert_eq!(err.clause, "-rating:>s");
        assert!(matches!(err.kind, ParseErrorKind::InvalidComparator { .. }));
    }

    #[test]
    fn test_bad_values() {
        let err = parse_err("score:lots", ParseOptions::default());
        assert!(matches!(err.kind, ParseErrorKind::InvalidValue { expected: "integer", .. }));
        let err = parse_err("type:bmp", ParseOptions::default());
        assert!(matches!(err.kind, ParseErrorKind::InvalidValue { expected: "file type", .. }));
        let err = parse_err("filesize:>1zb", ParseOptions::default());
        assert!(matches!(err.kind, ParseErrorKind::InvalidValue { .. }));
        let err = parse_err("id:9..3", ParseOptions::default());
        assert!(matches!(err.kind, ParseErrorKind::InvalidValue { expected: "ascending range", .. }));
    }

    #[test]
    fn test_empty_wildcard() {
        assert_eq!(parse_err("*", ParseOptions::default()).kind, ParseErrorKind::EmptyWildcard);
        assert_eq!(parse_err("wolf **", ParseOptions::default()).clause, "**");
    }

    #[test]
    fn test_unknown_field_strict_and_lenient() {
        let strict = ParseOptions { strict_fields: true };
        assert_eq!(
            parse_err("artist:someone", strict).kind,
            ParseErrorKind::UnknownField("artist".into())
        );
        let q = parse("artist:Someone");
        assert_eq!(q.nodes, vec![QueryNode::Tag(TagTerm::exact("artist:someone"))]);
    }

    #[test]
    fn test_field_in_group_rejected() {
        let err = parse_err("~wolf ~rating:s", ParseOptions::default());
        assert_eq!(err.kind, ParseErrorKind::FieldInGroup);
        assert_eq!(err.clause, "~rating:s");
    }

    #[test]
    fn test_lex_error_propagates() {
        assert!(matches!(
            parse_query("\"open", ParseOptions::default()),
            Err(SearchError::Lex(_))
        ));
    }

    #[test]
    fn test_quoted_phrase_is_exact_tag() {
        let q = parse("\"Long  Hair\"");
        assert_eq!(q.nodes, vec![QueryNode::Tag(TagTerm::exact("long hair"))]);
    }
}
