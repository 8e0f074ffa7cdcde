use thiserror::Error;

/// A query that could not be split into tokens.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("lexical error at byte {position}: {kind}")]
pub struct LexError {
    pub position: usize,
    pub kind: LexErrorKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LexErrorKind {
    #[error("unterminated quoted phrase")]
    UnterminatedQuote,

    #[error("empty quoted phrase")]
    EmptyPhrase,

    #[error("prefix marker '{0}' is not attached to a term")]
    DanglingMarker(char),

    #[error("field '{0}' has no value")]
    EmptyFieldValue(String),
}

/// A well-tokenized query whose clauses make no sense for the schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid clause '{clause}': {kind}")]
pub struct ParseError {
    pub clause: String,
    pub kind: ParseErrorKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("comparator '{comparator}' is not valid for field '{field}'")]
    InvalidComparator { field: String, comparator: String },

    #[error("malformed comparator in value '{0}'")]
    MalformedComparator(String),

    #[error("cannot convert '{value}' to {expected}")]
    InvalidValue { value: String, expected: &'static str },

    #[error("wildcard pattern has no literal text")]
    EmptyWildcard,

    #[error("field clauses cannot take part in an OR-group")]
    FieldInGroup,
}

/// Broken internal invariant while turning an AST into a predicate.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("internal compiler error: {0}")]
pub struct CompileError(pub String);

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("store unavailable: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Everything `search` can report back to a caller.
#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

impl SearchError {
    /// Only store-side failures are worth retrying; a malformed query stays malformed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SearchError::Execution(_))
    }
}

/// A single source line that could not be turned into a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("shard {shard} line {line}: {reason}")]
pub struct RecordError {
    pub shard: String,
    pub line: u64,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("shard {shard} failed after {attempts} attempts: {message}")]
    Shard {
        shard: String,
        attempts: u32,
        message: String,
    },

    #[error("listing shards failed: {0}")]
    Listing(String),

    #[error("ingestion is already running")]
    AlreadyRunning,

    #[error("failed to start ingestion thread: {0}")]
    Thread(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("unexpected listing payload: {0}")]
    Listing(#[from] serde_json::Error),

    #[error("unknown shard: {0}")]
    UnknownShard(String),
}
