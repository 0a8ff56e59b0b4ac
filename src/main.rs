//! WAL replay driver
//!
//! Loads a JSON fixture of WAL batches and drives the replication endpoint
//! against the stdout producer, printing every record that would have been
//! published. Useful for inspecting payload shapes and configuration
//! without a broker.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use wal2kafka::broker::stdout::StdoutProducer;
use wal2kafka::{
    Cell, ConfigMap, HostContext, ReplicationEndpoint, TableName, WalBatch, WalEntry,
};

#[derive(Parser, Debug)]
#[command(
    name = "wal2kafka",
    about = "Replay WAL batches through the replication endpoint",
    version = "0.1.0"
)]
struct Args {
    /// Path to a JSON fixture: an array of batches, each an array of WAL
    /// entries
    #[arg(long)]
    batch: PathBuf,

    /// Endpoint configuration as key=value pairs
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    options: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FixtureCell {
    row: String,
    family: String,
    qualifier: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    value_hex: Option<String>,
    timestamp: i64,
    #[serde(default)]
    tombstone: bool,
}

#[derive(Debug, Deserialize)]
struct FixtureEntry {
    table: String,
    #[serde(default)]
    sequence_id: Option<i64>,
    #[serde(default)]
    write_time: Option<i64>,
    cells: Vec<FixtureCell>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let args = Args::parse();

    let config = match parse_options(&args.options) {
        Ok(config) => config,
        Err(bad) => {
            error!("Invalid configuration argument: '{}'", bad);
            error!("Usage example:");
            error!(
                "  wal2kafka --batch edits.json broker.bootstrap=localhost:9092 \
                 family.name=0 payload.include-meta=true"
            );
            std::process::exit(1);
        }
    };

    let producer = Arc::new(StdoutProducer::new());
    let context = HostContext::new(config, producer);
    let endpoint = ReplicationEndpoint::init(&context)?;
    endpoint.start();

    let batches = load_fixture(&args.batch)?;
    info!("Replaying {} batches from {}", batches.len(), args.batch.display());

    let mut acknowledged = 0usize;
    for (index, batch) in batches.iter().enumerate() {
        if endpoint.replicate(batch).await {
            acknowledged += 1;
        } else {
            error!("Batch {} was not acknowledged", index);
        }
    }

    endpoint.stop().await;
    info!("Replayed {}/{} batches", acknowledged, batches.len());
    Ok(())
}

/// Parse trailing `key=value` arguments into the configuration map. The
/// stdout producer needs no broker endpoints, so the bootstrap entry gets a
/// local placeholder when absent.
fn parse_options(options: &[String]) -> std::result::Result<ConfigMap, String> {
    let mut config = ConfigMap::new();
    for option in options {
        match option.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                config.set(key.trim(), value.trim());
            }
            _ => return Err(option.clone()),
        }
    }
    if config.get(wal2kafka::config::KEY_BOOTSTRAP).is_none() {
        config.set(wal2kafka::config::KEY_BOOTSTRAP, "local");
    }
    Ok(config)
}

fn load_fixture(path: &PathBuf) -> Result<Vec<WalBatch>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    let batches: Vec<Vec<FixtureEntry>> =
        serde_json::from_str(&raw).context("parsing fixture JSON")?;

    batches
        .into_iter()
        .map(|entries| {
            let entries = entries
                .into_iter()
                .map(fixture_entry_to_wal)
                .collect::<Result<Vec<_>>>()?;
            Ok(WalBatch::new(entries))
        })
        .collect()
}

fn fixture_entry_to_wal(entry: FixtureEntry) -> Result<WalEntry> {
    let table = TableName::parse(&entry.table);
    let cells = entry
        .cells
        .into_iter()
        .map(|cell| {
            let value = match (&cell.value, &cell.value_hex) {
                (Some(text), None) => text.clone().into_bytes(),
                (None, Some(encoded)) => hex::decode(encoded)
                    .with_context(|| format!("invalid value_hex for column {}", cell.qualifier))?,
                (None, None) if cell.tombstone => Vec::new(),
                _ => bail!(
                    "cell {} must carry exactly one of value/value_hex",
                    cell.qualifier
                ),
            };
            let cell = if cell.tombstone {
                Cell::tombstone(
                    cell.row.clone().into_bytes(),
                    cell.family.clone().into_bytes(),
                    cell.qualifier.clone().into_bytes(),
                    cell.timestamp,
                )
            } else {
                Cell::put(
                    cell.row.clone().into_bytes(),
                    cell.family.clone().into_bytes(),
                    cell.qualifier.clone().into_bytes(),
                    value,
                    cell.timestamp,
                )
            };
            Ok(cell)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut wal = WalEntry::new(table, cells);
    if let Some(sequence_id) = entry.sequence_id {
        wal = wal.with_sequence_id(sequence_id);
    }
    if let Some(write_time) = entry.write_time {
        wal = wal.with_write_time(write_time);
    }
    Ok(wal)
}
