use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::engine::EngineOptions;
use crate::ingest::pipeline::PipelineConfig;
use crate::ingest::source::{DirectorySource, HttpSource, ShardSource};
use crate::query::parser::ParseOptions;

pub const DEFAULT_HUB_URL: &str = "https://huggingface.co";
pub const DEFAULT_DATASET: &str = "lodestones/e621-captions";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub db_path: PathBuf,
    /// Local mirror; when unset shards are fetched from the hub.
    pub source_dir: Option<PathBuf>,
    pub hub_url: String,
    pub dataset: String,
    pub sample_shards: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub page_size: usize,
    pub strict_fields: bool,
    pub cache_capacity: usize,
    pub reader_pool: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("tagsift.db"),
            source_dir: None,
            hub_url: DEFAULT_HUB_URL.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            sample_shards: 3,
            batch_size: 1000,
            max_attempts: 4,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
            page_size: 50,
            strict_fields: false,
            cache_capacity: 256,
            reader_pool: 4,
        }
    }
}

impl Settings {
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            parse: ParseOptions {
                strict_fields: self.strict_fields,
            },
            pipeline: PipelineConfig {
                batch_size: self.batch_size.max(1),
                max_attempts: self.max_attempts.max(1),
                backoff_base: Duration::from_millis(self.backoff_base_ms),
                backoff_cap: Duration::from_millis(self.backoff_cap_ms),
            },
            cache_capacity: self.cache_capacity,
            page_size: self.page_size.max(1),
            ..EngineOptions::default()
        }
    }

    pub fn open_source(&self) -> Result<Arc<dyn ShardSource>> {
        match &self.source_dir {
            Some(dir) => Ok(Arc::new(DirectorySource::new(dir.clone()))),
            None => {
                let source = HttpSource::new(&self.hub_url, &self.dataset)
                    .context("Failed to build HTTP client")?;
                Ok(Arc::new(source))
            }
        }
    }
}

/// Settings from `path` if it exists, defaults otherwise.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        info!("No settings file at {:?}, using defaults", path);
        return Ok(Settings::default());
    }
    let settings = load_from_env(path).with_context(|| format!("Failed to read settings from {:?}", path))?;
    info!("Loaded settings from {:?}", path);
    Ok(settings)
}

fn load_from_env(path: &Path) -> Result<Settings> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut settings = Settings::default();

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(anyhow!("line {}: expected KEY=VALUE", index + 1));
        };
        let value = value.trim();
        let key = key.trim();

        match key {
            "TAGSIFT_DB_PATH" => settings.db_path = PathBuf::from(value),
            "TAGSIFT_SOURCE_DIR" => {
                settings.source_dir = (!value.is_empty()).then(|| PathBuf::from(value))
            }
            "TAGSIFT_HUB_URL" => settings.hub_url = value.to_string(),
            "TAGSIFT_DATASET" => settings.dataset = value.to_string(),
            "TAGSIFT_SAMPLE_SHARDS" => settings.sample_shards = number(key, value)?,
            "TAGSIFT_BATCH_SIZE" => settings.batch_size = number(key, value)?,
            "TAGSIFT_MAX_ATTEMPTS" => settings.max_attempts = number(key, value)?,
            "TAGSIFT_BACKOFF_BASE_MS" => settings.backoff_base_ms = number(key, value)?,
            "TAGSIFT_BACKOFF_CAP_MS" => settings.backoff_cap_ms = number(key, value)?,
            "TAGSIFT_PAGE_SIZE" => settings.page_size = number(key, value)?,
            "TAGSIFT_STRICT_FIELDS" => settings.strict_fields = number(key, value)?,
            "TAGSIFT_CACHE_CAPACITY" => settings.cache_capacity = number(key, value)?,
            "TAGSIFT_READER_POOL" => settings.reader_pool = number(key, value)?,
            other => debug!("Ignoring unknown setting {}", other),
        }
    }

    Ok(settings)
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("{} has invalid value '{}'", key, value))
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    let mut file = File::create(path).context("Failed to create settings file")?;
    writeln!(file, "TAGSIFT_DB_PATH={}", settings.db_path.display())?;
    if let Some(dir) = &settings.source_dir {
        writeln!(file, "TAGSIFT_SOURCE_DIR={}", dir.display())?;
    }
    writeln!(file, "TAGSIFT_HUB_URL={}", settings.hub_url)?;
    writeln!(file, "TAGSIFT_DATASET={}", settings.dataset)?;
    writeln!(file, "TAGSIFT_SAMPLE_SHARDS={}", settings.sample_shards)?;
    writeln!(file, "TAGSIFT_BATCH_SIZE={}", settings.batch_size)?;
    writeln!(file, "TAGSIFT_MAX_ATTEMPTS={}", settings.max_attempts)?;
    writeln!(file, "TAGSIFT_BACKOFF_BASE_MS={}", settings.backoff_base_ms)?;
    writeln!(file, "TAGSIFT_BACKOFF_CAP_MS={}", settings.backoff_cap_ms)?;
    writeln!(file, "TAGSIFT_PAGE_SIZE={}", settings.page_size)?;
    writeln!(file, "TAGSIFT_STRICT_FIELDS={}", settings.strict_fields)?;
    writeln!(file, "TAGSIFT_CACHE_CAPACITY={}", settings.cache_capacity)?;
    writeln!(file, "TAGSIFT_READER_POOL={}", settings.reader_pool)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_settings() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(".env");
        let settings = Settings {
            db_path: PathBuf::from("/tmp/posts.db"),
            source_dir: Some(PathBuf::from("/data/shards")),
            batch_size: 250,
            strict_fields: true,
            ..Settings::default()
        };

        save_settings(&path, &settings)?;

        let content = fs::read_to_string(&path)?;
        assert!(content.contains("TAGSIFT_DB_PATH=/tmp/posts.db"));
        assert!(content.contains("TAGSIFT_STRICT_FIELDS=true"));

        let loaded = load_settings(&path)?;
        assert_eq!(loaded, settings);
        Ok(())
    }

    #[test]
    fn test_missing_file_gives_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        assert_eq!(load_settings(&dir.path().join("absent.env"))?, Settings::default());
        Ok(())
    }

    #[test]
    fn test_comments_and_bad_values() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join(".env");
        fs::write(&path, "# local mirror\nTAGSIFT_PAGE_SIZE=20\nUNRELATED=1\n")?;
        assert_eq!(load_settings(&path)?.page_size, 20);

        fs::write(&path, "TAGSIFT_BATCH_SIZE=lots\n")?;
        let err = load_settings(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("TAGSIFT_BATCH_SIZE"));

        fs::write(&path, "no separator\n")?;
        assert!(load_settings(&path).is_err());
        Ok(())
    }

    #[test]
    fn test_engine_options_clamp_zeroes() {
        let settings = Settings {
            batch_size: 0,
            max_attempts: 0,
            ..Settings::default()
        };
        let options = settings.engine_options();
        assert_eq!(options.pipeline.batch_size, 1);
        assert_eq!(options.pipeline.max_attempts, 1);
    }
}
