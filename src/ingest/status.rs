//! Progress reporting for the ingestion thread.
//!
//! Readers either poll [`StatusHandle::snapshot`] or subscribe to
//! [`IngestEvent`]s. Publishing never blocks: a subscriber that falls behind
//! loses events, not the pipeline's time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::RecordError;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Listing,
    Ingesting,
    Completed,
    Cancelled,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Cancelled | Phase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestionStatus {
    pub phase: Phase,
    pub records_ingested: u64,
    pub records_skipped: u64,
    pub current_shard: Option<usize>,
    pub current_shard_name: Option<String>,
    pub total_shards: usize,
    pub failed_shards: Vec<String>,
    /// Set when the run ended with at least one failed shard, or could not start.
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum IngestEvent {
    Started { total_shards: usize },
    ShardStarted { index: usize, name: String },
    BatchCommitted { shard: usize, records: usize, records_ingested: u64 },
    RecordSkipped(RecordError),
    ShardRetrying { name: String, attempt: u32, error: String },
    ShardFailed { name: String, error: String },
    Finished(IngestionStatus),
}

struct ShardState {
    phase: Phase,
    current_shard: Option<usize>,
    current_shard_name: Option<String>,
    total_shards: usize,
    failed_shards: Vec<String>,
    error: Option<String>,
}

struct Inner {
    records: AtomicU64,
    skipped: AtomicU64,
    state: RwLock<ShardState>,
    subscribers: Mutex<Vec<Sender<IngestEvent>>>,
}

#[derive(Clone)]
pub struct StatusHandle {
    inner: Arc<Inner>,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                records: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                state: RwLock::new(ShardState {
                    phase: Phase::Idle,
                    current_shard: None,
                    current_shard_name: None,
                    total_shards: 0,
                    failed_shards: Vec::new(),
                    error: None,
                }),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Receiver<IngestEvent> {
        let (tx, rx) = bounded(EVENT_CAPACITY);
        self.inner.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: IngestEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn snapshot(&self) -> IngestionStatus {
        let state = self.inner.state.read();
        IngestionStatus {
            phase: state.phase,
            records_ingested: self.inner.records.load(Ordering::SeqCst),
            records_skipped: self.inner.skipped.load(Ordering::SeqCst),
            current_shard: state.current_shard,
            current_shard_name: state.current_shard_name.clone(),
            total_shards: state.total_shards,
            failed_shards: state.failed_shards.clone(),
            error: state.error.clone(),
        }
    }

    /// Reset per-run state. Record counters keep growing across runs.
    pub(crate) fn begin_run(&self) {
        let mut state = self.inner.state.write();
        state.phase = Phase::Listing;
        state.current_shard = None;
        state.current_shard_name = None;
        state.total_shards = 0;
        state.failed_shards.clear();
        state.error = None;
    }

    pub(crate) fn shards_listed(&self, total: usize) {
        {
            let mut state = self.inner.state.write();
            state.phase = Phase::Ingesting;
            state.total_shards = total;
        }
        self.publish(IngestEvent::Started { total_shards: total });
    }

    pub(crate) fn shard_started(&self, index: usize, name: &str) {
        {
            let mut state = self.inner.state.write();
            state.current_shard = Some(index);
            state.current_shard_name = Some(name.to_string());
        }
        self.publish(IngestEvent::ShardStarted {
            index,
            name: name.to_string(),
        });
    }

    pub(crate) fn batch_committed(&self, shard: usize, records: usize) {
        let total = self.inner.records.fetch_add(records as u64, Ordering::SeqCst) + records as u64;
        self.publish(IngestEvent::BatchCommitted {
            shard,
            records,
            records_ingested: total,
        });
    }

    pub(crate) fn record_skipped(&self, error: RecordError) {
        self.inner.skipped.fetch_add(1, Ordering::SeqCst);
        self.publish(IngestEvent::RecordSkipped(error));
    }

    pub(crate) fn shard_retrying(&self, name: &str, attempt: u32, error: &str) {
        self.publish(IngestEvent::ShardRetrying {
            name: name.to_string(),
            attempt,
            error: error.to_string(),
        });
    }

    pub(crate) fn shard_failed(&self, name: &str, error: &str) {
        self.inner.state.write().failed_shards.push(name.to_string());
        self.publish(IngestEvent::ShardFailed {
            name: name.to_string(),
            error: error.to_string(),
        });
    }

    /// Enter a terminal phase and announce the final status.
    pub(crate) fn finish(&self, phase: Phase, error: Option<String>) {
        {
            let mut state = self.inner.state.write();
            state.phase = phase;
            if error.is_some() {
                state.error = error;
            }
        }
        self.publish(IngestEvent::Finished(self.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let status = StatusHandle::new();
        status.begin_run();
        status.shards_listed(3);
        status.shard_started(1, "b.jsonl");
        status.batch_committed(1, 10);
        status.batch_committed(1, 5);

        let snap = status.snapshot();
        assert_eq!(snap.phase, Phase::Ingesting);
        assert_eq!(snap.records_ingested, 15);
        assert_eq!(snap.current_shard, Some(1));
        assert_eq!(snap.total_shards, 3);
    }

    #[test]
    fn test_publish_never_blocks_on_slow_subscriber() {
        let status = StatusHandle::new();
        let rx = status.subscribe();
        for _ in 0..(EVENT_CAPACITY * 2) {
            status.batch_committed(0, 1);
        }
        assert_eq!(rx.len(), EVENT_CAPACITY);
        assert_eq!(status.snapshot().records_ingested, (EVENT_CAPACITY * 2) as u64);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let status = StatusHandle::new();
        drop(status.subscribe());
        status.batch_committed(0, 1);
        assert!(status.inner.subscribers.lock().is_empty());
    }

    #[test]
    fn test_finish_keeps_error() {
        let status = StatusHandle::new();
        let rx = status.subscribe();
        status.shard_failed("a.jsonl", "boom");
        status.finish(Phase::Completed, Some("1 shard failed".into()));

        let snap = status.snapshot();
        assert_eq!(snap.failed_shards, vec!["a.jsonl".to_string()]);
        assert_eq!(snap.error.as_deref(), Some("1 shard failed"));
        let last = rx.try_iter().last().unwrap();
        assert!(matches!(last, IngestEvent::Finished(s) if s.phase == Phase::Completed));
    }
}
