//! The surface a display layer talks to: search while ingestion runs.

use std::sync::Arc;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::database::repo::{PostRecord, Store};
use crate::error::{ExecutionError, IngestError, SearchError};
use crate::ingest::pipeline::{self, IngestMode, IngestionHandle, PipelineConfig};
use crate::ingest::source::ShardSource;
use crate::ingest::status::{IngestEvent, IngestionStatus, StatusHandle};
use crate::query::compiler::{Predicate, PredicateCache};
use crate::query::executor::{self, MatchStream, PageRequest, SearchPage, SortOrder};
use crate::query::parser::{parse_query, ParseOptions};
use crate::utils::cancel::CancelToken;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub parse: ParseOptions,
    pub pipeline: PipelineConfig,
    pub cache_capacity: usize,
    pub page_size: usize,
    pub stream_chunk: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            parse: ParseOptions::default(),
            pipeline: PipelineConfig::default(),
            cache_capacity: 256,
            page_size: 50,
            stream_chunk: 500,
        }
    }
}

pub struct Engine {
    store: Arc<Store>,
    source: Arc<dyn ShardSource>,
    options: EngineOptions,
    cache: PredicateCache,
    status: StatusHandle,
    ingestion: Mutex<Option<IngestionHandle>>,
}

impl Engine {
    pub fn new(store: Arc<Store>, source: Arc<dyn ShardSource>, options: EngineOptions) -> Self {
        Self {
            cache: PredicateCache::new(options.cache_capacity),
            store,
            source,
            options,
            status: StatusHandle::new(),
            ingestion: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn default_page(&self, page: usize) -> PageRequest {
        PageRequest::new(page, self.options.page_size)
    }

    fn prepare(&self, query: &str) -> Result<Arc<Predicate>, SearchError> {
        let parsed = parse_query(query, self.options.parse)?;
        let predicate = self.cache.get_or_compile(&parsed)?;
        debug!(query, canonical = %predicate.key, scan = predicate.scan, "query compiled");
        Ok(predicate)
    }

    /// Newest first.
    pub fn search(&self, query: &str, page: PageRequest) -> Result<SearchPage, SearchError> {
        self.search_sorted(query, page, SortOrder::default())
    }

    pub fn search_sorted(
        &self,
        query: &str,
        page: PageRequest,
        order: SortOrder,
    ) -> Result<SearchPage, SearchError> {
        let predicate = self.prepare(query)?;
        Ok(executor::execute(&self.store, &predicate, page, order)?)
    }

    /// Every match, lazily, from one snapshot. Lex and parse errors surface
    /// here, before anything is read.
    pub fn stream(
        &self,
        query: &str,
        order: SortOrder,
        cancel: CancelToken,
    ) -> Result<MatchStream<'_>, SearchError> {
        let predicate = self.prepare(query)?;
        let stream = MatchStream::open(
            &self.store,
            Predicate::clone(&predicate),
            order,
            self.options.stream_chunk,
            cancel,
        )?;
        Ok(stream)
    }

    pub fn post(&self, id: i64) -> Result<Option<PostRecord>, ExecutionError> {
        self.store.post(id)
    }

    pub fn ingestion_status(&self) -> IngestionStatus {
        self.status.snapshot()
    }

    pub fn subscribe(&self) -> Receiver<IngestEvent> {
        self.status.subscribe()
    }

    pub fn start_ingestion(&self, mode: IngestMode) -> Result<(), IngestError> {
        let mut slot = self.ingestion.lock();
        if let Some(handle) = slot.as_mut() {
            if !handle.is_finished() {
                return Err(IngestError::AlreadyRunning);
            }
            handle.join();
        }

        info!(?mode, "starting ingestion");
        let handle = pipeline::spawn(
            Arc::clone(&self.store),
            Arc::clone(&self.source),
            mode,
            self.options.pipeline.clone(),
            self.status.clone(),
        )?;
        *slot = Some(handle);
        Ok(())
    }

    /// Ask the running ingestion to stop at its next batch boundary.
    pub fn cancel_ingestion(&self) {
        if let Some(handle) = self.ingestion.lock().as_ref() {
            info!("cancelling ingestion");
            handle.cancel();
        }
    }

    /// Block until the current run (if any) has ended and return its final status.
    pub fn wait_for_ingestion(&self) -> IngestionStatus {
        let handle = self.ingestion.lock().take();
        if let Some(mut handle) = handle {
            handle.join();
        }
        self.status.snapshot()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(mut handle) = self.ingestion.get_mut().take() {
            handle.cancel();
            handle.join();
        }
    }
}
