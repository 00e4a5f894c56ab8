use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use pwatch_core::{RawProductRecord, Snapshot};
use pwatch_match::{detect_changes_with_report, filter_to_site, group_cross_site, IdentityOptions, IdentityResolver};
use pwatch_storage::{JsonDirStore, SnapshotStore};
use pwatch_sync::{load_dictionaries, run_check_once, MonitorConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "pwatch")]
#[command(about = "Price Watch change detection")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one monitoring pass over every active alert.
    Check,
    /// Print the changes between two snapshot files.
    Diff {
        previous: PathBuf,
        current: PathBuf,
        /// Restrict both sides to one site first.
        #[arg(long)]
        site: Option<String>,
    },
    /// Group a snapshot file into cross-site comparison rows.
    Compare {
        snapshot: PathBuf,
        #[arg(long)]
        reference: String,
        #[arg(long)]
        ignore_colors: bool,
    },
    /// Validate raw scraper output and store it as the owner's newest snapshot.
    Import { owner_id: String, records: PathBuf },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("PWATCH_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(fmt::layer().compact().with_writer(std::io::stderr)).init();
    }
}

/// Accepts either a stored snapshot document or a bare array of raw records.
async fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if let Ok(snapshot) = serde_json::from_str::<Snapshot>(&text) {
        return Ok(snapshot);
    }
    let records: Vec<RawProductRecord> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    let (snapshot, rejected) = Snapshot::from_raw("local", Utc::now(), records);
    for (record, reason) in &rejected {
        warn!(path = %path.display(), name = ?record.name, %reason, "rejected product record");
    }
    Ok(snapshot)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = MonitorConfig::from_env();

    match cli.command.unwrap_or(Commands::Check) {
        Commands::Check => {
            let summary = run_check_once(&config).await?;
            println!(
                "check complete: run_id={} checked={} changed={} skipped={} failed={} events={}",
                summary.run_id, summary.checked, summary.changed, summary.skipped, summary.failed, summary.events
            );
        }
        Commands::Diff {
            previous,
            current,
            site,
        } => {
            let previous = read_snapshot(&previous).await?.products;
            let current = read_snapshot(&current).await?.products;
            let (previous, current) = match &site {
                Some(site) => (filter_to_site(&previous, site), filter_to_site(&current, site)),
                None => (previous, current),
            };
            let (changes, report) = detect_changes_with_report(&previous, &current, &config.thresholds);
            info!(?report, "diff complete");
            print_json(&changes)?;
        }
        Commands::Compare {
            snapshot,
            reference,
            ignore_colors,
        } => {
            let snapshot = read_snapshot(&snapshot).await?;
            let resolver = IdentityResolver::new(&load_dictionaries(&config.rules_dir)?)
                .context("compiling identity dictionaries")?;
            let options = IdentityOptions {
                ignore_colors: ignore_colors || config.ignore_colors,
            };
            let rows = group_cross_site(&snapshot.products, &reference, &resolver, options);
            info!(rows = rows.len(), "comparison complete");
            print_json(&rows)?;
        }
        Commands::Import { owner_id, records } => {
            let mut snapshot = read_snapshot(&records).await?;
            snapshot.owner_id = owner_id;
            let store = JsonDirStore::new(config.data_dir.clone());
            store
                .insert_snapshot(&snapshot)
                .await
                .with_context(|| format!("storing snapshot for {}", snapshot.owner_id))?;
            println!(
                "imported snapshot {} for {} ({} products)",
                snapshot.id,
                snapshot.owner_id,
                snapshot.products.len()
            );
        }
    }

    Ok(())
}
