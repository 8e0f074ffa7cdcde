//! Where shards come from.
//!
//! A shard is one JSON-lines file. Sources list shard names in a stable order
//! and open a fresh line reader per fetch, so a failed shard can simply be
//! fetched again.

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::time::Duration;

use memmap2::MmapOptions;
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::error::SourceError;

pub const SHARD_EXTENSION: &str = ".jsonl";
const MMAP_THRESHOLD: u64 = 500 * 1024 * 1024; // 500 MB

pub type ShardReader = Box<dyn BufRead + Send>;

pub trait ShardSource: Send + Sync {
    /// Shard names in ingestion order.
    fn list_shards(&self) -> Result<Vec<String>, SourceError>;

    fn fetch(&self, shard: &str) -> Result<ShardReader, SourceError>;

    fn describe(&self) -> String;
}

/// Local mirror: every `*.jsonl` below `root`, by relative path.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ShardSource for DirectorySource {
    fn list_shards(&self) -> Result<Vec<String>, SourceError> {
        let mut names = Vec::new();
        for entry in WalkDir::new(&self.root)
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let name = relative.to_string_lossy().replace('\\', "/");
            if name.ends_with(SHARD_EXTENSION) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    fn fetch(&self, shard: &str) -> Result<ShardReader, SourceError> {
        let path = self.root.join(shard);
        if !path.starts_with(&self.root) || shard.split('/').any(|part| part == "..") {
            return Err(SourceError::UnknownShard(shard.to_string()));
        }
        open_local(&path)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

fn open_local(path: &Path) -> Result<ShardReader, SourceError> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();

    if len > MMAP_THRESHOLD {
        // The shard is treated as immutable while it is being ingested.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        debug!(path = %path.display(), len, "shard memory-mapped");
        Ok(Box::new(Cursor::new(mmap)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct DatasetInfo {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Deserialize)]
struct Sibling {
    rfilename: String,
}

/// Dataset repository on a Hugging Face compatible hub.
pub struct HttpSource {
    client: Client,
    base_url: String,
    dataset: String,
    revision: String,
}

impl HttpSource {
    pub fn new(base_url: &str, dataset: &str) -> Result<Self, SourceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None::<Duration>)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            dataset: dataset.to_string(),
            revision: "main".to_string(),
        })
    }
}

impl ShardSource for HttpSource {
    fn list_shards(&self) -> Result<Vec<String>, SourceError> {
        let url = format!("{}/api/datasets/{}", self.base_url, self.dataset);
        let body = self.client.get(&url).send()?.error_for_status()?.text()?;
        let info: DatasetInfo = serde_json::from_str(&body)?;

        let mut names: Vec<String> = info
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .filter(|name| name.ends_with(SHARD_EXTENSION))
            .collect();
        names.sort();
        Ok(names)
    }

    fn fetch(&self, shard: &str) -> Result<ShardReader, SourceError> {
        let url = format!(
            "{}/datasets/{}/resolve/{}/{}",
            self.base_url, self.dataset, self.revision, shard
        );
        let response = self.client.get(&url).send()?.error_for_status()?;
        debug!(%url, length = ?response.content_length(), "shard stream opened");
        Ok(Box::new(BufReader::with_capacity(64 * 1024, response)))
    }

    fn describe(&self) -> String {
        format!("{}/datasets/{}", self.base_url, self.dataset)
    }
}
