//! Tag search over a dataset that is still being ingested.
//!
//! Queries go lexer → parser → compiler → executor against a SQLite store
//! that a background pipeline keeps filling from JSON-lines shards.

pub mod database;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod query;
pub mod utils;

pub use engine::{Engine, EngineOptions};
pub use error::{IngestError, SearchError};
pub use ingest::pipeline::IngestMode;
pub use query::executor::{PageRequest, SearchPage, SortOrder};
