//! Batch migration CLI: replays device and user check-ins from a source
//! record store into a remote MDM service.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use mdmshift::{DeliveryClient, Ledger, Migrator, RedbSource, SelectionFilter};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Migrate MDM check-in state to a remote service")]
struct Args {
    /// Path to the source record store
    #[arg(long)]
    db: PathBuf,

    /// Remote migration endpoint URL
    #[arg(long)]
    url: Option<String>,

    /// Remote API key
    #[arg(long)]
    key: Option<String>,

    /// UDIDs to migrate (comma separated); empty means all
    #[arg(long)]
    udids: Option<String>,

    /// Skip devices with a last seen older than this many days
    #[arg(long)]
    days: Option<i64>,

    /// Path to the dedup ledger; omit to attempt every message
    /// unconditionally
    #[arg(long)]
    ledger: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let source = RedbSource::open(&args.db)
        .with_context(|| format!("open source store {}", args.db.display()))?;

    let client = match (&args.url, &args.key) {
        (Some(url), Some(key)) => Some(DeliveryClient::new(url, key)),
        _ => {
            warn!("remote URL or API key not set; not sending server requests");
            None
        }
    };

    let ledger = args
        .ledger
        .as_ref()
        .map(Ledger::open)
        .transpose()
        .context("open dedup ledger")?;

    let udids: HashSet<String> = args
        .udids
        .as_deref()
        .map(|list| {
            list.split(',')
                .filter(|udid| !udid.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let cutoff = args
        .days
        .filter(|days| *days > 0)
        .map(|days| Utc::now() - chrono::Duration::days(days));

    let migrator = Migrator::new(
        source,
        client,
        ledger,
        SelectionFilter::new(udids, cutoff),
    );
    migrator.run().await.context("enumerate source records")?;
    Ok(())
}
