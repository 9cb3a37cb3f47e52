use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use omreplica::core::Tables;
use omreplica::storage::{list_snapshot_locations, write_location};
use omreplica::{LocalCheckpointFetcher, SnapshotFetcher, SnapshotStoreEngine, StoreInstance, WriteBatch};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "omreplica")]
#[command(about = "Inspect and prepare local metadata snapshot locations")]
pub struct App {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the sequence number and tables of a location
    Inspect { location: PathBuf },
    /// Copy a location into a new snapshot directory under a root
    Checkpoint {
        source: PathBuf,
        snapshot_root: PathBuf,
    },
    /// Create an empty location at a given base sequence number
    Create {
        location: PathBuf,
        #[arg(long, default_value_t = 0)]
        sequence: u64,
    },
    /// Apply a single put to a location, journaled as the next sequence number
    Put {
        location: PathBuf,
        #[arg(long)]
        table: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
    },
    /// List snapshot directories under a root, oldest first
    List { snapshot_root: PathBuf },
}

impl App {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Inspect { location } => inspect(&location).await,
            Command::Checkpoint {
                source,
                snapshot_root,
            } => checkpoint(source, snapshot_root).await,
            Command::Create { location, sequence } => {
                write_location(&location, &Tables::new(), sequence)
                    .with_context(|| format!("Failed to create '{}'", location.display()))?;
                println!("{} (sequence {})", location.display(), sequence);
                Ok(())
            }
            Command::Put {
                location,
                table,
                key,
                value,
            } => put(&location, &table, &key, value).await,
            Command::List { snapshot_root } => {
                for location in list_snapshot_locations(&snapshot_root).await? {
                    println!("{}", location.display());
                }
                Ok(())
            }
        }
    }
}

async fn inspect(location: &Path) -> Result<()> {
    let instance = SnapshotStoreEngine::new()
        .open_instance(location)
        .await
        .with_context(|| format!("Failed to open '{}'", location.display()))?;
    let view = instance.read_view()?;

    println!("location: {}", location.display());
    println!("sequence: {}", view.sequence());
    for table in view.table_names() {
        println!("  {:<24} {:>10} rows", table, view.row_count(&table));
    }
    instance.close()?;
    Ok(())
}

async fn checkpoint(source: PathBuf, snapshot_root: PathBuf) -> Result<()> {
    let fetcher = LocalCheckpointFetcher::new(source, snapshot_root);
    let location = fetcher.fetch().await?;

    // the copy must be openable before anyone is pointed at it
    let instance = SnapshotStoreEngine::new()
        .open_instance(&location)
        .await
        .with_context(|| format!("Checkpoint '{}' does not open", location.display()))?;
    println!("{} (sequence {})", location.display(), instance.latest_sequence_number()?);
    instance.close()?;
    Ok(())
}

async fn put(location: &Path, table: &str, key: &str, value: String) -> Result<()> {
    let instance = SnapshotStoreEngine::new()
        .open_instance(location)
        .await
        .with_context(|| format!("Failed to open '{}'", location.display()))?;
    let next = instance
        .latest_sequence_number()?
        .checked_add(1)
        .context("Sequence number space is exhausted")?;
    let sequence = instance.apply_batch(&WriteBatch::new(next).put(table, key, value.into_bytes()))?;
    println!("sequence: {}", sequence);
    instance.close()?;
    Ok(())
}
