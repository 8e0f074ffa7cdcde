use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ValueRef};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use tracing::debug;

use crate::database::schema::{PRAGMAS, SCHEMA};
use crate::error::ExecutionError;
use crate::query::ast::{FileType, Rating};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CaptionKind {
    Tags,
    Summary,
    Parts,
    Midjourney,
    Commission,
}

impl CaptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptionKind::Tags => "tags",
            CaptionKind::Summary => "summary",
            CaptionKind::Parts => "parts",
            CaptionKind::Midjourney => "midjourney",
            CaptionKind::Commission => "commission",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tags" => Some(CaptionKind::Tags),
            "summary" => Some(CaptionKind::Summary),
            "parts" => Some(CaptionKind::Parts),
            "midjourney" => Some(CaptionKind::Midjourney),
            "commission" => Some(CaptionKind::Commission),
            _ => None,
        }
    }
}

/// A normalized post, as written by ingestion and read back by `Store::post`.
#[derive(Debug, Clone, PartialEq)]
pub struct PostRecord {
    pub id: i64,
    pub rating: Rating,
    pub score: i64,
    pub fav_count: i64,
    pub width: i64,
    pub height: i64,
    pub file_size: i64,
    pub file_type: FileType,
    pub md5: Option<String>,
    pub source: Option<String>,
    pub created_at: Option<String>,
    /// Normalized, sorted, unique.
    pub tags: Vec<String>,
    /// Sorted by kind, at most one per kind.
    pub captions: Vec<(CaptionKind, String)>,
}

/// Last durably committed ingestion position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestCursor {
    pub shard_index: u64,
    pub shard_name: String,
    /// Number of shard lines consumed, committed ones included.
    pub record_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCompletion {
    pub name: String,
    pub digest: Option<String>,
    pub records: u64,
}

/// Unit of one write transaction.
#[derive(Debug, Clone)]
pub struct Batch {
    pub records: Vec<PostRecord>,
    pub cursor: IngestCursor,
    pub completed: Option<ShardCompletion>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub name: String,
    pub status: String,
    pub digest: Option<String>,
    pub records: u64,
    pub error: Option<String>,
}

/// Owns the database. One writer connection guarded for the span of a
/// single batch commit, plus a pool of read-only connections.
pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
    pool_size: usize,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> rusqlite::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.execute_batch(PRAGMAS)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "store opened");

        Ok(Self {
            path,
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
            pool_size: pool_size.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check out a read-only connection; it goes back to the pool on drop.
    pub fn reader(&self) -> Result<PooledReader<'_>, ExecutionError> {
        let pooled = self.readers.lock().pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => {
                let conn = Connection::open_with_flags(
                    &self.path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY
                        | OpenFlags::SQLITE_OPEN_NO_MUTEX
                        | OpenFlags::SQLITE_OPEN_URI,
                )?;
                conn.execute_batch("PRAGMA cache_size = -16000; PRAGMA query_only = ON;")?;
                conn
            }
        };
        Ok(PooledReader {
            store: self,
            conn: Some(conn),
        })
    }

    fn give_back(&self, conn: Connection) {
        let mut readers = self.readers.lock();
        if readers.len() < self.pool_size {
            readers.push(conn);
        }
    }

    /// Write a batch atomically: posts, tags, captions and the cursor.
    pub fn commit_batch(&self, batch: &Batch) -> rusqlite::Result<()> {
        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;

        {
            let mut stmt_post = tx.prepare_cached(
                "INSERT INTO posts (id, rating, score, fav_count, width, height, file_size, file_ext, md5, source, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(id) DO UPDATE SET
                    rating=excluded.rating, score=excluded.score, fav_count=excluded.fav_count,
                    width=excluded.width, height=excluded.height, file_size=excluded.file_size,
                    file_ext=excluded.file_ext, md5=excluded.md5, source=excluded.source,
                    created_at=excluded.created_at",
            )?;
            let mut stmt_clear_tags = tx.prepare_cached("DELETE FROM post_tags WHERE post_id = ?1")?;
            let mut stmt_tag = tx.prepare_cached("INSERT OR IGNORE INTO tags (name) VALUES (?1)")?;
            let mut stmt_get_tag_id = tx.prepare_cached("SELECT id FROM tags WHERE name = ?1")?;
            let mut stmt_post_tag = tx.prepare_cached(
                "INSERT OR IGNORE INTO post_tags (post_id, tag_id) VALUES (?1, ?2)",
            )?;
            let mut stmt_clear_captions = tx.prepare_cached("DELETE FROM captions WHERE post_id = ?1")?;
            let mut stmt_caption = tx.prepare_cached(
                "INSERT INTO captions (post_id, kind, body) VALUES (?1, ?2, ?3)",
            )?;

            for record in &batch.records {
                stmt_post.execute(params![
                    record.id,
                    record.rating.code(),
                    record.score,
                    record.fav_count,
                    record.width,
                    record.height,
                    record.file_size,
                    record.file_type.extension(),
                    record.md5,
                    record.source,
                    record.created_at,
                ])?;

                // Replace, so that a re-delivered record ends up with exactly its own tags and captions.
                stmt_clear_tags.execute(params![record.id])?;
                for tag in &record.tags {
                    stmt_tag.execute(params![tag])?;
                    let tag_id: i64 = stmt_get_tag_id.query_row(params![tag], |row| row.get(0))?;
                    stmt_post_tag.execute(params![record.id, tag_id])?;
                }

                stmt_clear_captions.execute(params![record.id])?;
                for (kind, body) in &record.captions {
                    stmt_caption.execute(params![record.id, kind.as_str(), body])?;
                }
            }

            tx.execute(
                "INSERT INTO ingest_cursor (id, shard_index, shard_name, record_offset)
                 VALUES (1, ?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET shard_index=excluded.shard_index,
                    shard_name=excluded.shard_name, record_offset=excluded.record_offset",
                params![
                    batch.cursor.shard_index as i64,
                    batch.cursor.shard_name,
                    batch.cursor.record_offset as i64
                ],
            )?;

            if let Some(done) = &batch.completed {
                tx.execute(
                    "INSERT INTO shard_ledger (name, status, digest, records, error, updated_at)
                     VALUES (?1, 'completed', ?2, ?3, NULL, CURRENT_TIMESTAMP)
                     ON CONFLICT(name) DO UPDATE SET status='completed', digest=excluded.digest,
                        records=excluded.records, error=NULL, updated_at=CURRENT_TIMESTAMP",
                    params![done.name, done.digest, done.records as i64],
                )?;
            }
        }

        tx.commit()
    }

    pub fn mark_shard_failed(&self, name: &str, error: &str) -> rusqlite::Result<()> {
        let conn = self.writer.lock();
        conn.execute(
            "INSERT INTO shard_ledger (name, status, error, updated_at)
             VALUES (?1, 'failed', ?2, CURRENT_TIMESTAMP)
             ON CONFLICT(name) DO UPDATE SET status='failed', error=excluded.error,
                updated_at=CURRENT_TIMESTAMP",
            params![name, error],
        )?;
        Ok(())
    }

    pub fn cursor(&self) -> Result<Option<IngestCursor>, ExecutionError> {
        let reader = self.reader()?;
        let cursor = reader
            .query_row(
                "SELECT shard_index, shard_name, record_offset FROM ingest_cursor WHERE id = 1",
                [],
                |row| {
                    Ok(IngestCursor {
                        shard_index: row.get::<_, i64>(0)? as u64,
                        shard_name: row.get(1)?,
                        record_offset: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(cursor)
    }

    pub fn completed_shards(&self) -> Result<HashSet<String>, ExecutionError> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare("SELECT name FROM shard_ledger WHERE status = 'completed'")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(names)
    }

    pub fn ledger(&self) -> Result<Vec<LedgerEntry>, ExecutionError> {
        let reader = self.reader()?;
        let mut stmt = reader
            .prepare("SELECT name, status, digest, records, error FROM shard_ledger ORDER BY name")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    name: row.get(0)?,
                    status: row.get(1)?,
                    digest: row.get(2)?,
                    records: row.get::<_, i64>(3)? as u64,
                    error: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn post_count(&self) -> Result<u64, ExecutionError> {
        let reader = self.reader()?;
        let count: i64 = reader.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Full record with its tags and captions.
    pub fn post(&self, id: i64) -> Result<Option<PostRecord>, ExecutionError> {
        let reader = self.reader()?;
        let tx = reader.unchecked_transaction()?;

        let post = tx
            .query_row(
                "SELECT id, rating, score, fav_count, width, height, file_size, file_ext, md5, source, created_at
                 FROM posts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(PostRecord {
                        id: row.get(0)?,
                        rating: row.get(1)?,
                        score: row.get(2)?,
                        fav_count: row.get(3)?,
                        width: row.get(4)?,
                        height: row.get(5)?,
                        file_size: row.get(6)?,
                        file_type: row.get(7)?,
                        md5: row.get(8)?,
                        source: row.get(9)?,
                        created_at: row.get(10)?,
                        tags: Vec::new(),
                        captions: Vec::new(),
                    })
                },
            )
            .optional()?;
        let Some(mut post) = post else {
            return Ok(None);
        };

        let mut stmt = tx.prepare_cached(
            "SELECT t.name FROM post_tags pt JOIN tags t ON t.id = pt.tag_id
             WHERE pt.post_id = ?1 ORDER BY t.name",
        )?;
        post.tags = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = tx.prepare_cached("SELECT kind, body FROM captions WHERE post_id = ?1")?;
        post.captions = stmt
            .query_map(params![id], |row| Ok((row.get::<_, CaptionKind>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        post.captions.sort_by_key(|(kind, _)| *kind);

        Ok(Some(post))
    }
}

fn conversion_error(column: &str, value: &str) -> FromSqlError {
    FromSqlError::Other(format!("unexpected {} value '{}'", column, value).into())
}

impl FromSql for Rating {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_str()?;
        Rating::parse(code).ok_or_else(|| conversion_error("rating", code))
    }
}

impl FromSql for FileType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let ext = value.as_str()?;
        FileType::parse(ext).ok_or_else(|| conversion_error("file_ext", ext))
    }
}

impl FromSql for CaptionKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let kind = value.as_str()?;
        CaptionKind::parse(kind).ok_or_else(|| conversion_error("caption kind", kind))
    }
}

/// Read-only connection on loan from a [`Store`].
pub struct PooledReader<'a> {
    store: &'a Store,
    conn: Option<Connection>,
}

impl Deref for PooledReader<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledReader<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.store.give_back(conn);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn sample_post(id: i64, tags: &[&str]) -> PostRecord {
        PostRecord {
            id,
            rating: Rating::Safe,
            score: 0,
            fav_count: 0,
            width: 100,
            height: 100,
            file_size: 1024,
            file_type: FileType::Png,
            md5: None,
            source: None,
            created_at: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            captions: Vec::new(),
        }
    }

    pub(crate) fn cursor(index: u64, name: &str, offset: u64) -> IngestCursor {
        IngestCursor {
            shard_index: index,
            shard_name: name.to_string(),
            record_offset: offset,
        }
    }

    fn open_temp() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("test.db"), 2).unwrap();
        (dir, store)
    }

    #[test]
    fn test_commit_and_read_back() {
        let (_dir, store) = open_temp();
        let mut post = sample_post(7, &["dog", "wolf"]);
        post.captions = vec![(CaptionKind::Summary, "a wolf".into())];
        store
            .commit_batch(&Batch {
                records: vec![post.clone()],
                cursor: cursor(0, "a.jsonl", 1),
                completed: None,
            })
            .unwrap();

        assert_eq!(store.post(7).unwrap(), Some(post));
        assert_eq!(store.post(8).unwrap(), None);
        assert_eq!(store.cursor().unwrap(), Some(cursor(0, "a.jsonl", 1)));
    }

    #[test]
    fn test_upsert_replaces_tags_without_duplicating() {
        let (_dir, store) = open_temp();
        for tags in [&["dog", "wolf"][..], &["fox"][..]] {
            store
                .commit_batch(&Batch {
                    records: vec![sample_post(1, tags)],
                    cursor: cursor(0, "a.jsonl", 1),
                    completed: None,
                })
                .unwrap();
        }
        assert_eq!(store.post_count().unwrap(), 1);
        assert_eq!(store.post(1).unwrap().unwrap().tags, vec!["fox".to_string()]);
    }

    #[test]
    fn test_upsert_replaces_captions() {
        let (_dir, store) = open_temp();
        let mut first = sample_post(1, &["fox"]);
        first.captions = vec![
            (CaptionKind::Summary, "a fox".into()),
            (CaptionKind::Parts, "ears, tail".into()),
        ];
        let mut second = sample_post(1, &["fox"]);
        second.captions = vec![(CaptionKind::Summary, "a red fox".into())];

        for post in [first, second.clone()] {
            store
                .commit_batch(&Batch {
                    records: vec![post],
                    cursor: cursor(0, "a.jsonl", 1),
                    completed: None,
                })
                .unwrap();
        }
        assert_eq!(store.post(1).unwrap().unwrap().captions, second.captions);
    }

    #[test]
    fn test_ledger_tracks_completed_and_failed() {
        let (_dir, store) = open_temp();
        store
            .commit_batch(&Batch {
                records: Vec::new(),
                cursor: cursor(0, "a.jsonl", 10),
                completed: Some(ShardCompletion {
                    name: "a.jsonl".into(),
                    digest: Some("abc".into()),
                    records: 10,
                }),
            })
            .unwrap();
        store.mark_shard_failed("b.jsonl", "timed out").unwrap();

        let completed = store.completed_shards().unwrap();
        assert!(completed.contains("a.jsonl"));
        assert!(!completed.contains("b.jsonl"));

        let ledger = store.ledger().unwrap();
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[1].status, "failed");
        assert_eq!(ledger[1].error.as_deref(), Some("timed out"));
    }

    #[test]
    fn test_reader_pool_reuses_connections() {
        let (_dir, store) = open_temp();
        {
            let _a = store.reader().unwrap();
            let _b = store.reader().unwrap();
            let _c = store.reader().unwrap();
        }
        assert_eq!(store.readers.lock().len(), 2);
    }
}
