//! Query AST.
//!
//! A query is a conjunction of [`QueryNode`]s. Every node renders to a
//! canonical text form that drives canonicalization. Distinct nodes never
//! render alike: tag text that could be read as syntax is quoted.

use std::fmt;

/// Trim, lowercase and collapse internal whitespace.
pub fn normalize_tag(raw: &str) -> String {
    raw.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rating {
    Safe,
    Questionable,
    Explicit,
}

impl Rating {
    /// Single-letter code stored in the `posts.rating` column.
    pub fn code(self) -> &'static str {
        match self {
            Rating::Safe => "s",
            Rating::Questionable => "q",
            Rating::Explicit => "e",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "s" | "safe" => Some(Rating::Safe),
            "q" | "questionable" => Some(Rating::Questionable),
            "e" | "explicit" => Some(Rating::Explicit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileType {
    Jpg,
    Png,
    Gif,
    Webm,
    Webp,
    Swf,
    Mp4,
}

impl FileType {
    pub fn extension(self) -> &'static str {
        match self {
            FileType::Jpg => "jpg",
            FileType::Png => "png",
            FileType::Gif => "gif",
            FileType::Webm => "webm",
            FileType::Webp => "webp",
            FileType::Swf => "swf",
            FileType::Mp4 => "mp4",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(FileType::Jpg),
            "png" => Some(FileType::Png),
            "gif" => Some(FileType::Gif),
            "webm" => Some(FileType::Webm),
            "webp" => Some(FileType::Webp),
            "swf" => Some(FileType::Swf),
            "mp4" => Some(FileType::Mp4),
            _ => None,
        }
    }
}

/// How a field's value is typed at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Rating,
    FileType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Rating,
    Score,
    FavCount,
    Width,
    Height,
    FileSize,
    Id,
    Type,
}

impl Field {
    /// Resolve a field name or one of its accepted aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "rating" => Some(Field::Rating),
            "score" => Some(Field::Score),
            "favcount" | "fav_count" | "favorites" => Some(Field::FavCount),
            "width" => Some(Field::Width),
            "height" => Some(Field::Height),
            "filesize" | "file_size" | "size" => Some(Field::FileSize),
            "id" => Some(Field::Id),
            "type" | "filetype" | "file_type" => Some(Field::Type),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Rating => "rating",
            Field::Score => "score",
            Field::FavCount => "favcount",
            Field::Width => "width",
            Field::Height => "height",
            Field::FileSize => "filesize",
            Field::Id => "id",
            Field::Type => "type",
        }
    }

    /// Column in `posts` holding this field.
    pub fn column(self) -> &'static str {
        match self {
            Field::Rating => "rating",
            Field::Score => "score",
            Field::FavCount => "fav_count",
            Field::Width => "width",
            Field::Height => "height",
            Field::FileSize => "file_size",
            Field::Id => "id",
            Field::Type => "file_ext",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Field::Rating => FieldKind::Rating,
            Field::Type => FieldKind::FileType,
            _ => FieldKind::Integer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Comparator {
    Eq,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparator {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparator::Eq => "",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
        }
    }

    pub fn sql(self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Int(i64),
    /// Inclusive on both ends.
    Range(i64, i64),
    Rating(Rating),
    FileType(FileType),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Range(lo, hi) => write!(f, "{}..{}", lo, hi),
            FieldValue::Rating(r) => f.write_str(r.code()),
            FieldValue::FileType(t) => f.write_str(t.extension()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WildcardKind {
    Exact,
    /// `cat*`
    Prefix,
    /// `*cat`
    Suffix,
    /// `*cat*`
    Substring,
}

impl WildcardKind {
    /// Wildcards that cannot be answered from the tag-name index.
    pub fn needs_scan(self) -> bool {
        matches!(self, WildcardKind::Suffix | WildcardKind::Substring)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagTerm {
    /// Normalized tag text with wildcard markers stripped.
    pub pattern: String,
    pub wildcard: WildcardKind,
    pub negated: bool,
}

impl TagTerm {
    pub fn new(pattern: &str, wildcard: WildcardKind, negated: bool) -> Self {
        Self {
            pattern: normalize_tag(pattern),
            wildcard,
            negated,
        }
    }

    pub fn exact(pattern: &str) -> Self {
        Self::new(pattern, WildcardKind::Exact, false)
    }
}

impl fmt::Display for TagTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("-")?;
        }
        let body = if needs_quotes(&self.pattern) {
            let mut quoted = String::with_capacity(self.pattern.len() + 2);
            quoted.push('"');
            for ch in self.pattern.chars() {
                if matches!(ch, '"' | '\\') {
                    quoted.push('\\');
                }
                quoted.push(ch);
            }
            quoted.push('"');
            quoted
        } else {
            self.pattern.clone()
        };
        match self.wildcard {
            WildcardKind::Exact => write!(f, "{}", body),
            WildcardKind::Prefix => write!(f, "{}*", body),
            WildcardKind::Suffix => write!(f, "*{}", body),
            WildcardKind::Substring => write!(f, "*{}*", body),
        }
    }
}

fn needs_quotes(pattern: &str) -> bool {
    pattern.is_empty()
        || pattern.starts_with(['-', '~'])
        || pattern
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '*' | ':' | '(' | ')'))
}

/// Disjunction of tag terms. A negated group means none of the members hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TagGroup {
    pub members: Vec<TagTerm>,
    pub negated: bool,
}

impl fmt::Display for TagGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("-(")?;
        }
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "~{}", member)?;
        }
        if self.negated {
            f.write_str(")")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldTerm {
    pub field: Field,
    pub comparator: Comparator,
    pub value: FieldValue,
    pub negated: bool,
}

impl fmt::Display for FieldTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("-")?;
        }
        write!(
            f,
            "{}:{}{}",
            self.field.name(),
            self.comparator.symbol(),
            self.value
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryNode {
    Tag(TagTerm),
    Group(TagGroup),
    Field(FieldTerm),
}

impl fmt::Display for QueryNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryNode::Tag(t) => t.fmt(f),
            QueryNode::Group(g) => g.fmt(f),
            QueryNode::Field(t) => t.fmt(f),
        }
    }
}

/// Top-level conjunction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Query {
    pub nodes: Vec<QueryNode>,
}

impl Query {
    pub fn new(nodes: Vec<QueryNode>) -> Self {
        Self { nodes }
    }

    /// Reorder and deduplicate so that logically equal queries become equal values.
    ///
    /// Group members are sorted and deduplicated, a lone un-negated member
    /// replaces its group, and top-level nodes are sorted by their rendering.
    pub fn canonical(&self) -> Query {
        let mut nodes: Vec<QueryNode> = self
            .nodes
            .iter()
            .map(|node| match node {
                QueryNode::Group(group) => canonical_group(group),
                other => other.clone(),
            })
            .collect();

        nodes.sort_by_cached_key(|n| n.to_string());
        nodes.dedup();
        Query { nodes }
    }

    /// Canonical text; equal for logically equal queries.
    pub fn normalized_text(&self) -> String {
        self.canonical().to_string()
    }

    /// True when some term can only be answered by scanning the tag dictionary.
    pub fn needs_scan(&self) -> bool {
        self.nodes.iter().any(|node| match node {
            QueryNode::Tag(t) => t.wildcard.needs_scan(),
            QueryNode::Group(g) => g.members.iter().any(|m| m.wildcard.needs_scan()),
            QueryNode::Field(_) => false,
        })
    }
}

fn canonical_group(group: &TagGroup) -> QueryNode {
    let mut members = group.members.clone();
    members.sort_by_cached_key(|m| m.to_string());
    members.dedup();

    if members.len() == 1 && !group.negated {
        if let Some(only) = members.pop() {
            return QueryNode::Tag(only);
        }
    }
    QueryNode::Group(TagGroup {
        members,
        negated: group.negated,
    })
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, node) in self.nodes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            node.fmt(f)?;
        }
        Ok(())
    }
}
