//! AST → SQL predicate over `posts p`.
//!
//! All user-supplied values travel as bound parameters; the SQL text is
//! assembled only from fixed fragments and column names owned by [`Field`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput};
use tracing::debug;

use crate::error::CompileError;
use crate::query::ast::{Field, FieldTerm, FieldValue, Query, QueryNode, TagGroup, TagTerm, WildcardKind};

const TAG_EXISTS: &str = "EXISTS (SELECT 1 FROM post_tags pt JOIN tags t ON t.id = pt.tag_id WHERE pt.post_id = p.id AND ";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SqlParam {
    Int(i64),
    Text(String),
}

impl ToSql for SqlParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlParam::Int(v) => v.to_sql(),
            SqlParam::Text(v) => v.to_sql(),
        }
    }
}

/// Compiled query: a boolean SQL expression over `posts p` plus its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Predicate {
    pub sql: String,
    pub params: Vec<SqlParam>,
    /// Canonical query text this predicate was compiled from.
    pub key: String,
    /// No index path exists; callers should prefer streaming.
    pub scan: bool,
}

pub fn compile(query: &Query) -> Result<Predicate, CompileError> {
    let canonical = query.canonical();
    let mut params = Vec::new();
    let mut fragments = Vec::with_capacity(canonical.nodes.len());

    for node in &canonical.nodes {
        fragments.push(match node {
            QueryNode::Tag(term) => compile_tag(term, &mut params)?,
            QueryNode::Group(group) => compile_group(group, &mut params)?,
            QueryNode::Field(term) => compile_field(term, &mut params),
        });
    }

    let sql = if fragments.is_empty() {
        "1 = 1".to_string()
    } else {
        fragments.join(" AND ")
    };

    Ok(Predicate {
        sql,
        params,
        key: canonical.to_string(),
        scan: canonical.needs_scan(),
    })
}

fn compile_tag(term: &TagTerm, params: &mut Vec<SqlParam>) -> Result<String, CompileError> {
    if term.pattern.is_empty() {
        return Err(CompileError(format!("tag term with empty pattern: {:?}", term)));
    }

    let test = match term.wildcard {
        WildcardKind::Exact => {
            params.push(SqlParam::Text(term.pattern.clone()));
            "t.name = ?"
        }
        kind => {
            let escaped = escape_like(&term.pattern);
            let pattern = match kind {
                WildcardKind::Prefix => format!("{}%", escaped),
                WildcardKind::Suffix => format!("%{}", escaped),
                _ => format!("%{}%", escaped),
            };
            params.push(SqlParam::Text(pattern));
            "t.name LIKE ? ESCAPE '\\'"
        }
    };

    let exists = format!("{}{})", TAG_EXISTS, test);
    Ok(if term.negated {
        format!("NOT {}", exists)
    } else {
        exists
    })
}

fn compile_group(group: &TagGroup, params: &mut Vec<SqlParam>) -> Result<String, CompileError> {
    if group.members.is_empty() {
        return Err(CompileError("empty tag group".to_string()));
    }
    let members = group
        .members
        .iter()
        .map(|member| compile_tag(member, params))
        .collect::<Result<Vec<_>, _>>()?;
    let disjunction = format!("({})", members.join(" OR "));

    Ok(if group.negated {
        format!("NOT {}", disjunction)
    } else {
        disjunction
    })
}

fn compile_field(term: &FieldTerm, params: &mut Vec<SqlParam>) -> String {
    let column = term.field.column();
    let test = match &term.value {
        FieldValue::Int(v) => {
            params.push(SqlParam::Int(*v));
            format!("p.{} {} ?", column, term.comparator.sql())
        }
        FieldValue::Range(lo, hi) => {
            params.push(SqlParam::Int(*lo));
            params.push(SqlParam::Int(*hi));
            format!("p.{} BETWEEN ? AND ?", column)
        }
        FieldValue::Rating(rating) => {
            debug_assert_eq!(term.field, Field::Rating);
            params.push(SqlParam::Text(rating.code().to_string()));
            format!("p.{} = ?", column)
        }
        FieldValue::FileType(file_type) => {
            params.push(SqlParam::Text(file_type.extension().to_string()));
            format!("p.{} = ?", column)
        }
    };

    if term.negated {
        format!("NOT ({})", test)
    } else {
        test
    }
}

/// Escape `LIKE` metacharacters; tag names are full of underscores.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Compiled predicates keyed by canonical query.
pub struct PredicateCache {
    entries: Mutex<HashMap<Query, Arc<Predicate>>>,
    capacity: usize,
}

impl PredicateCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn get_or_compile(&self, query: &Query) -> Result<Arc<Predicate>, CompileError> {
        let key = query.canonical();
        if let Some(hit) = self.entries.lock().get(&key) {
            return Ok(Arc::clone(hit));
        }

        let predicate = Arc::new(compile(&key)?);
        if self.capacity > 0 {
            let mut entries = self.entries.lock();
            if entries.len() >= self.capacity {
                debug!(entries = entries.len(), "predicate cache full, clearing");
                entries.clear();
            }
            entries.insert(key, Arc::clone(&predicate));
        }
        Ok(predicate)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::{parse_query, ParseOptions};

    fn compiled(input: &str) -> Predicate {
        compile(&parse_query(input, ParseOptions::default()).unwrap()).unwrap()
    }

    #[test]
    fn test_equivalent_queries_compile_identically() {
        assert_eq!(compiled("wolf dog"), compiled("dog   wolf"));
        assert_eq!(compiled("~wolf ~dog rating:s"), compiled("rating:s ~dog ~wolf"));
        assert_eq!(compiled("wolf wolf"), compiled("wolf"));
        assert_eq!(compiled("~fox"), compiled("fox"));
        assert_ne!(compiled("wolf"), compiled("-wolf"));
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let q = parse_query("canine -fox rating:s score:>50 *cat*", ParseOptions::default()).unwrap();
        assert_eq!(compile(&q).unwrap(), compile(&q).unwrap());
    }

    #[test]
    fn test_values_are_bound_not_inlined() {
        let p = compiled("score:>100 \"robert'); drop table posts;--\"");
        assert!(!p.sql.contains("100"));
        assert!(!p.sql.contains("drop"));
        assert!(p.params.contains(&SqlParam::Int(100)));
        assert!(p
            .params
            .contains(&SqlParam::Text("robert'); drop table posts;--".into())));
    }

    #[test]
    fn test_wildcards_escape_like_metacharacters() {
        let p = compiled("long_hair*");
        assert_eq!(p.params, vec![SqlParam::Text("long\\_hair%".into())]);
        assert!(!p.scan);
        assert!(compiled("*hair").scan);
        assert!(compiled("*hair*").scan);
    }

    #[test]
    fn test_negated_group() {
        let q = Query::new(vec![QueryNode::Group(TagGroup {
            members: vec![TagTerm::exact("wolf"), TagTerm::exact("dog")],
            negated: true,
        })]);
        let p = compile(&q).unwrap();
        assert!(p.sql.starts_with("NOT ("));
        assert_eq!(
            p.params,
            vec![SqlParam::Text("dog".into()), SqlParam::Text("wolf".into())]
        );
    }

    #[test]
    fn test_empty_query_matches_everything() {
        assert_eq!(compiled("").sql, "1 = 1");
    }

    #[test]
    fn test_broken_ast_is_compile_error() {
        let q = Query::new(vec![QueryNode::Group(TagGroup {
            members: Vec::new(),
            negated: false,
        })]);
        assert!(compile(&q).is_err());
    }

    #[test]
    fn test_cache_shares_equal_queries() {
        let cache = PredicateCache::new(8);
        let a = cache
            .get_or_compile(&parse_query("wolf dog", ParseOptions::default()).unwrap())
            .unwrap();
        let b = cache
            .get_or_compile(&parse_query("dog wolf", ParseOptions::default()).unwrap())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_separates_phrases_from_syntax() {
        let cache = PredicateCache::new(8);
        assert!(cache.is_empty());
        let parse = |q: &str| parse_query(q, ParseOptions::default()).unwrap();

        let phrase = cache.get_or_compile(&parse("\"cat*\"")).unwrap();
        let prefix = cache.get_or_compile(&parse("cat*")).unwrap();
        assert!(!Arc::ptr_eq(&phrase, &prefix));
        assert_eq!(*prefix, compiled("cat*"));
        assert!(prefix.sql.contains("LIKE"));

        let phrase = cache.get_or_compile(&parse("\"-wolf\"")).unwrap();
        let negated = cache.get_or_compile(&parse("-wolf")).unwrap();
        assert!(!Arc::ptr_eq(&phrase, &negated));
        assert!(negated.sql.starts_with("NOT EXISTS"));
        assert_eq!(phrase.params, vec![SqlParam::Text("-wolf".into())]);
        assert_eq!(cache.len(), 4);
    }
}
