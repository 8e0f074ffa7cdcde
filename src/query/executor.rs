//! Runs compiled predicates against the committed state of the store.
//!
//! Every call reads inside one SQLite read transaction, so a page and its
//! count (or all chunks of a stream) come from the same snapshot and never
//! straddle an ingestion commit.

use std::collections::VecDeque;

use rusqlite::params_from_iter;
use tracing::{debug, warn};

use crate::database::repo::{PooledReader, Store};
use crate::error::ExecutionError;
use crate::query::compiler::{Predicate, SqlParam};
use crate::utils::cancel::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    IdDesc,
    IdAsc,
}

impl SortOrder {
    fn order_by(self) -> &'static str {
        match self {
            SortOrder::IdDesc => "ORDER BY p.id DESC",
            SortOrder::IdAsc => "ORDER BY p.id ASC",
        }
    }

    fn after(self) -> &'static str {
        match self {
            SortOrder::IdDesc => "p.id < ?",
            SortOrder::IdAsc => "p.id > ?",
        }
    }
}

/// Zero-based page window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

impl PageRequest {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page, per_page }
    }

    fn offset(&self) -> i64 {
        (self.page.saturating_mul(self.per_page)) as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub ids: Vec<i64>,
    pub total: u64,
    pub page: usize,
    pub per_page: usize,
}

pub fn execute(
    store: &Store,
    predicate: &Predicate,
    page: PageRequest,
    order: SortOrder,
) -> Result<SearchPage, ExecutionError> {
    let reader = store.reader()?;
    let tx = reader.unchecked_transaction()?;

    let ids = {
        let sql = format!(
            "SELECT p.id FROM posts p WHERE {} {} LIMIT ? OFFSET ?",
            predicate.sql,
            order.order_by()
        );
        let window = [SqlParam::Int(page.per_page as i64), SqlParam::Int(page.offset())];
        let mut stmt = tx.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(predicate.params.iter().chain(window.iter())), |row| {
            row.get::<_, i64>(0)
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };

    let total: i64 = {
        let sql = format!("SELECT COUNT(*) FROM posts p WHERE {}", predicate.sql);
        let mut stmt = tx.prepare_cached(&sql)?;
        stmt.query_row(params_from_iter(predicate.params.iter()), |row| row.get(0))?
    };
    tx.commit()?;

    debug!(query = %predicate.key, total, returned = ids.len(), "search executed");
    Ok(SearchPage {
        ids,
        total: total as u64,
        page: page.page,
        per_page: page.per_page,
    })
}

/// Lazily yields matching ids in chunks from one snapshot.
///
/// Stops quietly when the token is cancelled; ids already fetched into the
/// current chunk are still returned.
pub struct MatchStream<'a> {
    reader: PooledReader<'a>,
    predicate: Predicate,
    order: SortOrder,
    chunk_size: usize,
    cancel: CancelToken,
    buffer: VecDeque<i64>,
    last_id: Option<i64>,
    in_transaction: bool,
    exhausted: bool,
}

impl<'a> MatchStream<'a> {
    pub fn open(
        store: &'a Store,
        predicate: Predicate,
        order: SortOrder,
        chunk_size: usize,
        cancel: CancelToken,
    ) -> Result<Self, ExecutionError> {
        let reader = store.reader()?;
        reader.execute_batch("BEGIN DEFERRED")?;
        Ok(Self {
            reader,
            predicate,
            order,
            chunk_size: chunk_size.max(1),
            cancel,
            buffer: VecDeque::new(),
            last_id: None,
            in_transaction: true,
            exhausted: false,
        })
    }

    fn fetch_chunk(&mut self) -> Result<(), ExecutionError> {
        let mut sql = format!("SELECT p.id FROM posts p WHERE ({})", self.predicate.sql);
        let mut params: Vec<SqlParam> = self.predicate.params.clone();
        if let Some(last) = self.last_id {
            sql.push_str(" AND ");
            sql.push_str(self.order.after());
            params.push(SqlParam::Int(last));
        }
        sql.push(' ');
        sql.push_str(self.order.order_by());
        sql.push_str(" LIMIT ?");
        params.push(SqlParam::Int(self.chunk_size as i64));

        let mut stmt = self.reader.prepare_cached(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if ids.len() < self.chunk_size {
            self.exhausted = true;
        }
        self.last_id = ids.last().copied().or(self.last_id);
        self.buffer.extend(ids);
        Ok(())
    }

    fn finish(&mut self) {
        if self.in_transaction {
            self.in_transaction = false;
            if let Err(e) = self.reader.execute_batch("COMMIT") {
                warn!("failed to close stream snapshot: {}", e);
            }
        }
    }
}

impl Iterator for MatchStream<'_> {
    type Item = Result<i64, ExecutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(id) = self.buffer.pop_front() {
            return Some(Ok(id));
        }
        if self.exhausted || self.cancel.is_cancelled() {
            self.finish();
            return None;
        }
        if let Err(e) = self.fetch_chunk() {
            self.exhausted = true;
            self.finish();
            return Some(Err(e));
        }
        match self.buffer.pop_front() {
            Some(id) => Some(Ok(id)),
            None => {
                self.finish();
                None
            }
        }
    }
}

impl Drop for MatchStream<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
