//! Background ingestion: shards → batches → store.
//!
//! One thread walks the shard list in order. Each shard is read line by line;
//! lines are grouped into batches, parsed in parallel and committed in one
//! transaction together with the cursor. A crash or cancellation therefore
//! loses at most the uncommitted tail of a shard, which is re-read on the
//! next run and upserted again.

use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::database::repo::{Batch, IngestCursor, ShardCompletion, Store};
use crate::error::{IngestError, SourceError};
use crate::ingest::hasher::DigestReader;
use crate::ingest::record;
use crate::ingest::source::ShardSource;
use crate::ingest::status::{Phase, StatusHandle};
use crate::utils::cancel::CancelToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    /// Only the first `n` shards.
    Sample(usize),
    Full,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_attempts: 4,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }
}

/// Failure of one attempt at a shard; always retryable.
#[derive(Error, Debug)]
enum AttemptError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("read error: {0}")]
    Io(#[from] io::Error),

    #[error("commit failed: {0}")]
    Store(#[from] rusqlite::Error),
}

enum ShardOutcome {
    Completed,
    Cancelled,
}

pub struct IngestionHandle {
    cancel: CancelToken,
    thread: Option<JoinHandle<()>>,
}

impl IngestionHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map(|t| t.is_finished()).unwrap_or(true)
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("ingestion thread panicked");
            }
        }
    }
}

pub fn spawn(
    store: Arc<Store>,
    source: Arc<dyn ShardSource>,
    mode: IngestMode,
    config: PipelineConfig,
    status: StatusHandle,
) -> Result<IngestionHandle, IngestError> {
    let cancel = CancelToken::new();
    let pipeline = Pipeline {
        store,
        source,
        config,
        status,
        cancel: cancel.clone(),
    };

    let thread = thread::Builder::new()
        .name("ingestion".to_string())
        .spawn(move || pipeline.run(mode))?;

    Ok(IngestionHandle {
        cancel,
        thread: Some(thread),
    })
}

pub(crate) struct Pipeline {
    store: Arc<Store>,
    source: Arc<dyn ShardSource>,
    config: PipelineConfig,
    status: StatusHandle,
    cancel: CancelToken,
}

impl Pipeline {
    pub(crate) fn run(&self, mode: IngestMode) {
        info!(source = %self.source.describe(), ?mode, "ingestion started");
        self.status.begin_run();

        let mut shards = match self.list_with_retry() {
            Ok(Some(shards)) => shards,
            Ok(None) => {
                info!("ingestion cancelled while listing shards");
                self.status.finish(Phase::Cancelled, None);
                return;
            }
            Err(e) => {
                error!("ingestion aborted: {}", e);
                self.status.finish(Phase::Failed, Some(e.to_string()));
                return;
            }
        };
        if let IngestMode::Sample(limit) = mode {
            shards.truncate(limit);
        }
        self.status.shards_listed(shards.len());

        let (completed, cursor) = match (self.store.completed_shards(), self.store.cursor()) {
            (Ok(completed), Ok(cursor)) => (completed, cursor),
            (Err(e), _) | (_, Err(e)) => {
                error!("cannot read ingestion state: {}", e);
                self.status.finish(Phase::Failed, Some(e.to_string()));
                return;
            }
        };

        let mut failures = Vec::new();
        for (index, name) in shards.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            if completed.contains(name) {
                debug!(shard = %name, "already ingested, skipping");
                continue;
            }

            let resume_from = cursor
                .as_ref()
                .filter(|c| c.shard_name == *name)
                .map(|c| c.record_offset)
                .unwrap_or(0);
            self.status.shard_started(index, name);
            info!(shard = %name, index, resume_from, "ingesting shard");

            match self.ingest_with_retry(index, name, resume_from) {
                Ok(ShardOutcome::Completed) => {}
                Ok(ShardOutcome::Cancelled) => break,
                Err(e) => {
                    let message = e.to_string();
                    error!("{}", message);
                    if let Err(db) = self.store.mark_shard_failed(name, &message) {
                        error!(shard = %name, "could not record shard failure: {}", db);
                    }
                    self.status.shard_failed(name, &message);
                    failures.push(message);
                }
            }
        }

        let error = match failures.len() {
            0 => None,
            1 => failures.pop(),
            n => Some(format!("{} shards failed; last: {}", n, failures[n - 1])),
        };
        let phase = if self.cancel.is_cancelled() {
            Phase::Cancelled
        } else {
            Phase::Completed
        };
        info!(?phase, records = self.status.snapshot().records_ingested, "ingestion finished");
        self.status.finish(phase, error);
    }

    /// `None` when cancelled before a listing succeeded.
    fn list_with_retry(&self) -> Result<Option<Vec<String>>, IngestError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.source.list_shards() {
                Ok(shards) => return Ok(Some(shards)),
                Err(e) if attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(attempt, ?delay, "listing shards failed: {}", e);
                    if self.cancel.sleep(delay) {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(IngestError::Listing(e.to_string())),
            }
        }
    }

    fn ingest_with_retry(&self, index: usize, name: &str, resume_from: u64) -> Result<ShardOutcome, IngestError> {
        let mut committed = resume_from;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.ingest_shard(index, name, &mut committed) {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(shard = %name, attempt, ?delay, committed, "shard attempt failed: {}", e);
                    self.status.shard_retrying(name, attempt, &e.to_string());
                    if self.cancel.sleep(delay) {
                        return Ok(ShardOutcome::Cancelled);
                    }
                }
                Err(e) => {
                    return Err(IngestError::Shard {
                        shard: name.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    /// One pass over a shard. `committed` is the number of lines already
    /// durable and is advanced after every successful commit.
    fn ingest_shard(&self, index: usize, name: &str, committed: &mut u64) -> Result<ShardOutcome, AttemptError> {
        let mut reader = DigestReader::new(self.source.fetch(name)?);
        let mut pending: Vec<(u64, Vec<u8>)> = Vec::with_capacity(self.config.batch_size);
        let mut records_in_shard = 0u64;
        let mut line_no = 0u64;
        let mut line = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            line_no += 1;
            if line_no <= *committed || line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            pending.push((line_no, line.clone()));

            if pending.len() >= self.config.batch_size {
                records_in_shard += self.commit(index, name, &mut pending, line_no, None)?;
                *committed = line_no;
                if self.cancel.is_cancelled() {
                    info!(shard = %name, line = line_no, "ingestion cancelled at batch boundary");
                    return Ok(ShardOutcome::Cancelled);
                }
            }
        }

        let bytes = reader.bytes_read();
        let completion = ShardCompletion {
            name: name.to_string(),
            digest: Some(reader.finish()),
            records: records_in_shard,
        };
        // Lines before `committed` were stored by an earlier attempt or run.
        let final_count = self.commit(index, name, &mut pending, line_no, Some(completion))?;
        *committed = line_no;
        debug!(shard = %name, lines = line_no, bytes, records = records_in_shard + final_count, "shard complete");
        Ok(ShardOutcome::Completed)
    }

    /// Parse `pending` and commit it with the cursor at `line_no`. Returns
    /// the number of records written.
    fn commit(
        &self,
        index: usize,
        name: &str,
        pending: &mut Vec<(u64, Vec<u8>)>,
        line_no: u64,
        completed: Option<ShardCompletion>,
    ) -> Result<u64, AttemptError> {
        let parsed: Vec<_> = pending
            .par_iter()
            .map(|(no, raw)| record::parse_bytes(raw, name, *no))
            .collect();

        let mut records = Vec::with_capacity(parsed.len());
        let mut skipped = Vec::new();
        for result in parsed {
            match result {
                Ok(post) => records.push(post),
                Err(e) => skipped.push(e),
            }
        }

        let count = records.len();
        let completed = completed.map(|mut c| {
            c.records += count as u64;
            c
        });
        let batch = Batch {
            records,
            cursor: IngestCursor {
                shard_index: index as u64,
                shard_name: name.to_string(),
                record_offset: line_no,
            },
            completed,
        };
        self.store.commit_batch(&batch)?;
        pending.clear();

        // A failed commit re-reads these lines, so they are only counted once it succeeds.
        for e in skipped {
            warn!("skipping record: {}", e);
            self.status.record_skipped(e);
        }

        self.status.batch_committed(index, count);
        Ok(count as u64)
    }
}
