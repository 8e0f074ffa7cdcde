use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel::RecvTimeoutError;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tagsift::database::repo::Store;
use tagsift::ingest::status::{IngestEvent, Phase};
use tagsift::utils::config::{load_settings, save_settings, Settings};
use tagsift::{Engine, IngestMode, PageRequest, SortOrder};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// KEY=VALUE settings file.
    #[arg(short, long, default_value = ".env")]
    config: PathBuf,

    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Read shards from a local directory instead of the hub.
    #[arg(short, long)]
    source_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pull shards into the local store.
    Ingest {
        /// Only the first N shards (default from settings).
        #[arg(long, conflicts_with = "full")]
        sample: Option<usize>,

        #[arg(long)]
        full: bool,
    },
    /// Run a query against what has been ingested so far.
    Search {
        query: String,

        #[arg(long, default_value_t = 0)]
        page: usize,

        #[arg(long)]
        per_page: Option<usize>,

        #[arg(long)]
        ascending: bool,
    },
    /// Stored posts, resume cursor and shard ledger.
    Status,
    /// One post with its tags and captions.
    Show { id: i64 },
    /// Write the effective settings, flags included, to the settings file.
    Init,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut settings = load_settings(&args.config)?;
    if let Some(db_path) = args.db_path {
        settings.db_path = db_path;
    }
    if let Some(dir) = args.source_dir {
        settings.source_dir = Some(dir);
    }

    if let Command::Init = args.command {
        save_settings(&args.config, &settings)?;
        info!("Saved settings to {:?}", args.config);
        return Ok(());
    }

    let store = Store::open(&settings.db_path, settings.reader_pool.max(1))
        .with_context(|| format!("Failed to open store at {:?}", settings.db_path))?;
    let store = Arc::new(store);

    match args.command {
        Command::Ingest { sample, full } => {
            let mode = if full {
                IngestMode::Full
            } else {
                IngestMode::Sample(sample.unwrap_or(settings.sample_shards))
            };
            ingest(&settings, store, mode)
        }
        Command::Search {
            query,
            page,
            per_page,
            ascending,
        } => {
            let engine = Engine::new(store, settings.open_source()?, settings.engine_options());
            let request = match per_page {
                Some(per_page) => PageRequest::new(page, per_page.max(1)),
                None => engine.default_page(page),
            };
            let order = if ascending { SortOrder::IdAsc } else { SortOrder::IdDesc };

            let result = engine.search_sorted(&query, request, order)?;
            println!(
                "{} matches (page {}, {} per page)",
                result.total, result.page, result.per_page
            );
            for id in result.ids {
                match engine.post(id)? {
                    Some(post) => println!("{:>10}  {}  {:>6}  {}", id, post.rating.code(), post.score, post.tags.join(" ")),
                    None => println!("{:>10}", id),
                }
            }
            Ok(())
        }
        Command::Status => {
            println!("posts: {}", store.post_count()?);
            match store.cursor()? {
                Some(cursor) => println!(
                    "cursor: shard #{} {} at line {}",
                    cursor.shard_index, cursor.shard_name, cursor.record_offset
                ),
                None => println!("cursor: none"),
            }
            for entry in store.ledger()? {
                println!(
                    "{:<40} {:<9} {:>8}  {}",
                    entry.name,
                    entry.status,
                    entry.records,
                    entry.error.or(entry.digest).unwrap_or_default()
                );
            }
            Ok(())
        }
        Command::Init => Ok(()),
        Command::Show { id } => {
            let post = store.post(id)?.ok_or_else(|| anyhow!("post {} not found", id))?;
            println!("id:       {}", post.id);
            println!("rating:   {}", post.rating.code());
            println!("score:    {}  favs: {}", post.score, post.fav_count);
            println!("size:     {}x{} {} bytes {}", post.width, post.height, post.file_size, post.file_type.extension());
            if let Some(source) = &post.source {
                println!("source:   {}", source);
            }
            println!("tags:     {}", post.tags.join(" "));
            for (kind, body) in &post.captions {
                println!("\n[{}]\n{}", kind.as_str(), body);
            }
            Ok(())
        }
    }
}

fn ingest(settings: &Settings, store: Arc<Store>, mode: IngestMode) -> Result<()> {
    let engine = Engine::new(store, settings.open_source()?, settings.engine_options());
    let events = engine.subscribe();
    engine.start_ingestion(mode)?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] shard {pos}/{len} {msg}")
            .map_err(|e| anyhow!("bad progress template: {}", e))?,
    );

    loop {
        match events.recv_timeout(Duration::from_millis(250)) {
            Ok(IngestEvent::Started { total_shards }) => bar.set_length(total_shards as u64),
            Ok(IngestEvent::ShardStarted { index, name }) => {
                bar.set_position(index as u64);
                bar.set_message(name);
            }
            Ok(IngestEvent::BatchCommitted { records_ingested, .. }) => {
                let name = engine.ingestion_status().current_shard_name.unwrap_or_default();
                bar.set_message(format!("{} ({} records)", name, records_ingested));
            }
            Ok(IngestEvent::RecordSkipped(_)) => {}
            Ok(IngestEvent::ShardRetrying { name, attempt, error }) => {
                bar.suspend(|| warn!("retrying {} (attempt {}): {}", name, attempt, error));
            }
            Ok(IngestEvent::ShardFailed { name, error }) => {
                bar.suspend(|| error!("shard {} failed: {}", name, error));
            }
            Ok(IngestEvent::Finished(_)) => break,
            Err(RecvTimeoutError::Timeout) => {
                // Events are dropped when the channel is full; the status handle is not.
                if engine.ingestion_status().phase.is_terminal() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let status = engine.wait_for_ingestion();
    bar.finish_and_clear();
    info!(
        "ingestion {:?}: {} records, {} skipped, {} failed shards",
        status.phase,
        status.records_ingested,
        status.records_skipped,
        status.failed_shards.len()
    );

    match (status.phase, status.error) {
        (Phase::Failed, error) => Err(anyhow!(error.unwrap_or_else(|| "ingestion failed".to_string()))),
        (_, Some(error)) => {
            error!("{}", error);
            Ok(())
        }
        _ => Ok(()),
    }
}
