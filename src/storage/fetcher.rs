use super::persistence::staging_path;
use crate::core::{ReplicaError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tracing::{Level, event};

pub const SNAPSHOT_DIR_PREFIX: &str = "om.snapshot.db_";

/// Produces a fully materialized snapshot location ready to be opened.
///
/// Implementations own the atomicity of materialization: the returned path
/// must never be observed half-written.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self) -> Result<PathBuf>;
}

/// Copies a local snapshot location into a fresh directory under
/// `snapshot_root`, staging the copy and renaming it into place.
pub struct LocalCheckpointFetcher {
    source: PathBuf,
    snapshot_root: PathBuf,
    fetched: AtomicU64,
}

impl LocalCheckpointFetcher {
    pub fn new(source: impl Into<PathBuf>, snapshot_root: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            snapshot_root: snapshot_root.into(),
            fetched: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn snapshot_root(&self) -> &Path {
        &self.snapshot_root
    }

    fn next_location(&self) -> PathBuf {
        let n = self.fetched.fetch_add(1, Ordering::Relaxed);
        self.snapshot_root.join(format!(
            "{}{}_{}",
            SNAPSHOT_DIR_PREFIX,
            Utc::now().timestamp_millis(),
            n
        ))
    }
}

#[async_trait]
impl SnapshotFetcher for LocalCheckpointFetcher {
    async fn fetch(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.snapshot_root).await?;

        let dest = self.next_location();
        let staging = staging_path(&dest)?;
        if let Err(err) = copy_dir(&self.source, &staging).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }
        fs::rename(&staging, &dest).await.map_err(|e| {
            ReplicaError::Io(format!("Failed to publish snapshot {}: {}", dest.display(), e))
        })?;

        event!(
            Level::INFO,
            source = %self.source.display(),
            location = %dest.display(),
            "snapshot fetched"
        );
        Ok(dest)
    }
}

async fn copy_dir(source: &Path, dest: &Path) -> Result<()> {
    let mut pending = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir(&to).await.map_err(|e| {
            ReplicaError::Io(format!("Failed to create {}: {}", to.display(), e))
        })?;
        let mut entries = fs::read_dir(&from).await.map_err(|e| {
            ReplicaError::Io(format!("Failed to read {}: {}", from.display(), e))
        })?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                fs::copy(entry.path(), &target).await.map_err(|e| {
                    ReplicaError::Io(format!("Failed to copy {}: {}", entry.path().display(), e))
                })?;
            }
        }
    }
    Ok(())
}

/// Snapshot directories under `root`, oldest first by name.
pub async fn list_snapshot_locations(root: &Path) -> Result<Vec<PathBuf>> {
    let mut locations = Vec::new();
    let mut entries = fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let is_snapshot = name
            .to_str()
            .map(|n| n.starts_with(SNAPSHOT_DIR_PREFIX))
            .unwrap_or(false);
        if is_snapshot && entry.file_type().await?.is_dir() {
            locations.push(entry.path());
        }
    }
    locations.sort();
    Ok(locations)
}
