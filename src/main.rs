//! WolfPage - Durable Page Store WAL and Checkpoint Engine
//!
//! Command line tool for inspecting and maintaining a page store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfpage::config::WolfPageConfig;
use wolfpage::storage::{FilePageStore, PageMemory};
use wolfpage::tuning;
use wolfpage::wal::{segment_infos, ReadPolicy, RecordPayload, WalIterator, WalPaths, WalPointer, WalRecord};
use wolfpage::Engine;

/// WolfPage - Durable Page Store WAL and Checkpoint Engine
#[derive(Parser)]
#[command(name = "wolfpage")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfpage.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact), defaults to the configured format
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfpage.toml")]
        output: PathBuf,

        /// Data directory
        #[arg(long, default_value = "/var/lib/wolfpage")]
        data_dir: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show store and segment information
    Info,

    /// Print the records of the log
    Dump {
        /// Print one JSON object per record
        #[arg(long)]
        json: bool,

        /// Stop after this many records
        #[arg(long)]
        limit: Option<usize>,

        /// Fail on the first corrupted frame instead of skipping the segment tail
        #[arg(long)]
        strict: bool,
    },

    /// Replay the log without writing anything and report what was found
    Recover {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Open the store, run one checkpoint and close it
    Checkpoint {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_format = cli.log_format.clone().unwrap_or_else(|| {
        WolfPageConfig::from_file(&cli.config)
            .map(|config| config.logging.format)
            .unwrap_or_else(|_| "pretty".to_string())
    });
    init_logging(&cli.log_level, &log_format);

    match cli.command {
        Commands::Init { output, data_dir } => run_init(output, data_dir),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Dump {
            json,
            limit,
            strict,
        } => run_dump(cli.config, json, limit, strict),
        Commands::Recover { json } => run_recover(cli.config, json).await,
        Commands::Checkpoint { json } => run_checkpoint(cli.config, json).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<WolfPageConfig> {
    WolfPageConfig::from_file(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn run_init(output: PathBuf, data_dir: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }

    let config_content = format!(
        r#"# WolfPage Configuration
# Generated configuration file

[storage]
data_dir = "{data_dir}"
page_size = 4096

[wal]
batch_size = 256
flush_interval_ms = 10
compression = false
segment_size_mb = 64
fsync = true
archive = true

[checkpoint]
# 0 = auto-tune from the detected hardware
threads = 0
sort_threads = 0
batch_pages = 512
# 0 disables periodic checkpoints
frequency_ms = 180000
worker_shutdown_timeout_secs = 120
sort_shutdown_timeout_secs = 2

[logging]
level = "info"
format = "pretty"
"#,
        data_dir = data_dir.display()
    );

    std::fs::write(&output, config_content)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("Inspect the store with: wolfpage --config {} info", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match WolfPageConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Data Directory: {}", config.data_dir().display());
            println!("  Page Size:      {} bytes", config.storage.page_size);
            println!("  Segment Size:   {} MB", config.wal.segment_size_mb);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e.into())
        }
    }
}

fn run_info(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let paths = WalPaths::from_config(&config);

    println!("WolfPage Store Information");
    println!("==========================");
    println!();
    println!("Data Directory:   {}", config.data_dir().display());
    println!("Page Size:        {} bytes", config.storage.page_size);
    println!();
    println!("WAL Configuration:");
    println!("  Batch Size:     {}", config.wal.batch_size);
    println!("  Compression:    {}", config.wal.compression);
    println!("  Segment Size:   {} MB", config.wal.segment_size_mb);
    println!("  Fsync:          {}", config.wal.fsync);
    println!("  Archive:        {}", config.wal.archive);
    println!();
    println!("Checkpoint Configuration:");
    println!("  Writer Threads: {}", config.checkpoint.worker_threads());
    println!("  Sort Threads:   {}", config.checkpoint.sort_pool_threads());
    println!("  Batch Pages:    {}", config.checkpoint.batch_pages);
    match config.checkpoint.frequency() {
        Some(frequency) => println!("  Frequency:      {} ms", frequency.as_millis()),
        None => println!("  Frequency:      disabled"),
    }
    println!();
    println!("{}", tuning::tuning_summary(&tuning::auto_tune()));
    println!();

    if !paths.work_dir.exists() {
        println!("No WAL directory yet");
        return Ok(());
    }

    let segments = segment_infos(&paths).context("Failed to list WAL segments")?;
    println!("Segments ({}):", segments.len());
    for segment in segments {
        println!(
            "  {:>8}  {:<8}  {:<6}  {} bytes",
            segment.index,
            if segment.archived { "archive" } else { "work" },
            if segment.sealed { "sealed" } else { "active" },
            segment.bytes
        );
    }

    Ok(())
}

#[derive(Serialize)]
struct DumpLine<'a> {
    pointer: WalPointer,
    record: &'a WalRecord,
}

fn run_dump(config_path: PathBuf, json: bool, limit: Option<usize>, strict: bool) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let paths = WalPaths::from_config(&config);
    let policy = if strict { ReadPolicy::Fail } else { ReadPolicy::Tolerate };

    let mut iter = WalIterator::open(&paths, policy).context("Failed to open the log")?;
    let mut count = 0usize;

    for item in iter.by_ref() {
        if limit.map_or(false, |limit| count >= limit) {
            break;
        }
        let (pointer, record) = item.context("Failed to read the log")?;

        if json {
            println!("{}", serde_json::to_string(&DumpLine { pointer, record: &record })?);
        } else {
            println!("{:<24} {:<34} {}", pointer.to_string(), record.record_type(), describe(&record));
        }
        count += 1;
    }

    if !json {
        println!();
        println!("{} records, {} unknown frames skipped", count, iter.skipped());
    }
    Ok(())
}

/// One-line summary of a record payload
fn describe(record: &WalRecord) -> String {
    match record.payload() {
        RecordPayload::Tx(r) => format!("xid={} state={:?}", r.xid, r.state),
        RecordPayload::PageSnapshot(r) => format!("page={} bytes={}", r.page, r.data.len()),
        RecordPayload::Data(r) => format!("entries={}", r.entries.len()),
        RecordPayload::StoreOperation(r) => format!(
            "{:?} group={} link={:#x} index={}",
            r.op, r.group_id, r.link, r.index_id
        ),
        RecordPayload::Checkpoint(r) if r.end => format!(
            "end id={} begin={} pages={}",
            r.checkpoint_id,
            r.mark.map_or_else(|| "-".to_string(), |p| p.to_string()),
            r.page_count
        ),
        RecordPayload::Checkpoint(r) => format!("begin id={}", r.checkpoint_id),
        RecordPayload::Header(r) => format!("segment={} version={}", r.segment, r.format_version),
        RecordPayload::InitNewPage(r) => {
            format!("page={} io_type={} io_version={}", r.page, r.io_type, r.io_version)
        }
        RecordPayload::PageDelta(r) => {
            format!("page={} offset={} bytes={}", r.page, r.offset, r.payload.len())
        }
        RecordPayload::PageErase(r) => format!("page={} offset={} len={}", r.page, r.offset, r.len),
        RecordPayload::PartitionCounters(r) => format!(
            "group={} partition={} counter={} size={}",
            r.group_id, r.partition, r.update_counter, r.size
        ),
        RecordPayload::PartitionState(r) => {
            format!("group={} partition={} state={:?}", r.group_id, r.partition, r.state)
        }
        RecordPayload::PartitionDestroy(r) => format!("group={} partition={}", r.group_id, r.partition),
        RecordPayload::MemoryRecovery(r) => format!("at={}", r.timestamp),
        RecordPayload::Exchange(r) => format!(
            "{:?} node={}",
            r.kind,
            r.const_id.as_deref().unwrap_or("-")
        ),
        RecordPayload::SwitchSegment => String::new(),
    }
}

async fn run_recover(config_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let paths = WalPaths::from_config(&config);
    let store = FilePageStore::open(config.pages_dir(), config.storage.page_size)
        .context("Failed to open page store")?;
    let memory = PageMemory::new(Arc::new(store));

    let stats = tokio::task::spawn_blocking(move || {
        let stats = wolfpage::recovery::recover(&paths, &memory, ReadPolicy::Default, |_, _| Ok(()));
        stats.map(|stats| (stats, memory.dirty_count()))
    })
    .await
    .context("Recovery task failed")?;
    let (stats, dirty) = stats.context("Recovery failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Recovery Report");
    println!("===============");
    println!(
        "Last Checkpoint:  {}",
        stats.last_checkpoint.map_or_else(|| "none".to_string(), |id| id.to_string())
    );
    println!(
        "Replay From:      {}",
        stats.replay_from.map_or_else(|| "start of log".to_string(), |p| p.to_string())
    );
    println!("Records Read:     {}", stats.records_read);
    println!("Pages Applied:    {}", stats.pages_applied);
    println!("Dirty Pages:      {}", dirty);
    println!("Logical Records:  {}", stats.logical_records);
    println!("Unknown Frames:   {}", stats.skipped);
    println!("Partitions:       {}", stats.partitions.len());
    Ok(())
}

async fn run_checkpoint(config_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let mut config = load_config(&config_path)?;
    config.checkpoint.frequency_ms = 0;

    let engine = Engine::open(config).await.context("Failed to open page store")?;
    let result = engine.checkpoint("manual").await;
    engine.shutdown().await.context("Failed to close page store")?;
    let stats = result.context("Checkpoint failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "Checkpoint {} wrote {} pages in {} batches ({} ms)",
            stats.checkpoint_id, stats.pages, stats.batches, stats.duration_ms
        );
    }
    Ok(())
}
