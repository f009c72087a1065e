//! Tempora CLI - operate on a Tempora data directory

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tempora_core::wal::{WalConfig, WalReader};
use tempora_core::{
    StorageConfig, StorageEngine, StreamKey, StreamSelector, TimeRange, Timestamp, WriteBatch,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tempora")]
#[command(version = tempora_core::VERSION)]
#[command(about = "Inspect and operate a Tempora time-series data directory")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory
    #[arg(long, default_value = "data", global = true)]
    data_dir: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Write points to one stream
    Write {
        /// Stream key, e.g. `cpu,host=a`
        stream: String,
        /// Points as `timestamp:value`
        #[arg(required = true)]
        points: Vec<String>,
    },

    /// Read points in a time range
    Read {
        /// Exact stream key
        #[arg(long, conflicts_with = "series")]
        stream: Option<String>,
        /// Every stream of a series
        #[arg(long)]
        series: Option<String>,
        /// Tag filter for --series, as key=value
        #[arg(short = 'T', long = "tag", requires = "series")]
        tags: Vec<String>,
        /// Range start (inclusive)
        #[arg(long, default_value_t = Timestamp::MIN, allow_hyphen_values = true)]
        start: Timestamp,
        /// Range end (inclusive)
        #[arg(long, default_value_t = Timestamp::MAX, allow_hyphen_values = true)]
        end: Timestamp,
        /// Print points as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// List streams and their time coverage
    Describe,

    /// Flush the MemTable rebuilt from the WAL into an SSTable
    Flush,

    /// Show engine statistics as JSON
    Stats,

    /// Scan the WAL without opening the engine
    WalCheck,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = StorageConfig::new(&cli.data_dir);

    // Reads the WAL as-is; opening the engine would truncate a torn tail
    if let Commands::WalCheck = cli.command {
        return wal_check(&config);
    }

    let engine = StorageEngine::open(config)
        .with_context(|| format!("failed to open {}", cli.data_dir.display()))?;
    run(&engine, cli.command)?;
    engine.close().context("failed to close the engine")
}

fn run(engine: &StorageEngine, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Write { stream, points } => {
            let key = StreamKey::parse(&stream).context("invalid stream key")?;
            let mut batch = WriteBatch::new();
            for point in &points {
                let (ts, value) = parse_point(point)?;
                batch = batch.with(key.clone(), ts, value);
            }
            engine.write(&batch).context("write rejected")?;
            info!(stream = %key, points = batch.len(), "Wrote points");
        }

        Commands::Read {
            stream,
            series,
            tags,
            start,
            end,
            json,
        } => {
            let selector = selector(stream, series, &tags)?;
            let scan = engine.read(&selector, TimeRange::new(start, end))?;
            for point in scan {
                let point = point.context("read failed")?;
                if json {
                    let line = serde_json::json!({
                        "stream": point.key.canonical(),
                        "timestamp": point.timestamp,
                        "value": point.value,
                    });
                    println!("{}", line);
                } else {
                    println!("{}\t{}\t{}", point.key, point.timestamp, point.value);
                }
            }
        }

        Commands::Describe => {
            for coverage in engine.describe() {
                println!(
                    "{}\t{}..{}\t{} points",
                    coverage.key, coverage.range.start, coverage.range.end, coverage.points
                );
            }
        }

        Commands::Flush => {
            engine.flush().context("flush failed")?;
            let stats = engine.stats();
            info!(sstables = stats.sstable_count, "Flush complete");
        }

        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        }

        Commands::WalCheck => wal_check(engine.config())?,
    }
    Ok(())
}

fn wal_check(config: &StorageConfig) -> anyhow::Result<()> {
    let wal = WalConfig {
        dir: config.wal_dir(),
        ..config.wal.clone()
    };
    let replay = WalReader::new(wal)
        .replay()
        .with_context(|| format!("failed to scan {}", config.wal_dir().display()))?;

    println!("segments: {}", replay.segments.len());
    for segment in &replay.segments {
        let damaged = if segment.damaged { "\tdamaged" } else { "" };
        match (segment.first_sequence, segment.last_sequence) {
            (Some(first), Some(last)) => {
                println!("  {:020}\t{}..{}{}", segment.id, first, last, damaged)
            }
            _ => println!("  {:020}\tempty{}", segment.id, damaged),
        }
    }
    println!("records: {}", replay.records.len());
    for corrupt in &replay.corrupt {
        println!(
            "corrupt: segment {} offset {}: {}",
            corrupt.segment_id, corrupt.offset, corrupt.reason
        );
    }
    if let Some(torn) = &replay.torn_tail {
        println!(
            "torn tail: segment {} offset {} ({} bytes)",
            torn.segment_id, torn.offset, torn.discarded
        );
    }
    Ok(())
}

fn parse_point(point: &str) -> anyhow::Result<(Timestamp, f64)> {
    let Some((ts, value)) = point.split_once(':') else {
        bail!("point '{}' is not timestamp:value", point);
    };
    let ts = ts
        .parse()
        .with_context(|| format!("invalid timestamp in '{}'", point))?;
    let value = value
        .parse()
        .with_context(|| format!("invalid value in '{}'", point))?;
    Ok((ts, value))
}

fn selector(
    stream: Option<String>,
    series: Option<String>,
    tags: &[String],
) -> anyhow::Result<StreamSelector> {
    if let Some(stream) = stream {
        return Ok(StreamSelector::exact(StreamKey::parse(&stream)?));
    }
    let Some(series) = series else {
        return Ok(StreamSelector::All);
    };

    let mut selector = StreamSelector::series(series);
    for tag in tags {
        let Some((k, v)) = tag.split_once('=') else {
            bail!("tag filter '{}' is not key=value", tag);
        };
        selector = selector.with_tag(k, v);
    }
    Ok(selector)
}
