//! On-disk layout of a snapshot location: manifest, table snapshot and update journal

use crate::core::{ReplicaError, Result, SequenceNumber, Tables, WriteBatch};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{Level, event};
use uuid::Uuid;

pub const FORMAT_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "MANIFEST.json";
pub const TABLES_FILE: &str = "tables.snapshot";
pub const JOURNAL_FILE: &str = "updates.journal";

// ============================================================================
// Durability Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every journal append
    Sync,
    /// flush to the OS, let it decide when to hit the disk
    #[default]
    Async,
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Sequence number of the last write contained in the table snapshot
    pub base_sequence: SequenceNumber,
    pub tables: Vec<String>,
}

impl SnapshotManifest {
    pub fn new(base_sequence: SequenceNumber, tables: &Tables) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            created_at: Utc::now(),
            base_sequence,
            tables: tables.keys().cloned().collect(),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let manifest: SnapshotManifest = serde_json::from_slice(bytes)
            .map_err(|e| ReplicaError::Serialization(format!("Failed to parse manifest: {}", e)))?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(ReplicaError::Serialization(format!(
                "Unsupported snapshot format version {} (expected {})",
                manifest.format_version, FORMAT_VERSION
            )));
        }
        Ok(manifest)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| ReplicaError::Serialization(format!("Failed to serialize manifest: {}", e)))
    }
}

// ============================================================================
// Journal
// ============================================================================

/// Frame a batch as `u32 little-endian length` followed by its MessagePack body.
pub fn encode_journal_record(batch: &WriteBatch) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(batch)
        .map_err(|e| ReplicaError::Serialization(format!("Failed to serialize write batch: {}", e)))?;
    let len = u32::try_from(body.len())
        .map_err(|_| ReplicaError::Serialization("Write batch too large".to_string()))?;
    let mut record = Vec::with_capacity(4 + body.len());
    record.extend_from_slice(&len.to_le_bytes());
    record.extend_from_slice(&body);
    Ok(record)
}

/// Decode every record of a journal. A torn record at the tail is corruption:
/// batches are acknowledged only after their full record is written.
pub fn decode_journal(bytes: &[u8]) -> Result<Vec<WriteBatch>> {
    let mut batches = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < 4 {
            return Err(ReplicaError::Serialization(format!(
                "Truncated journal record header at offset {}",
                offset
            )));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
        let len = u32::from_le_bytes(len_bytes) as usize;
        offset += 4;

        if bytes.len() - offset < len {
            return Err(ReplicaError::Serialization(format!(
                "Truncated journal record at offset {}: need {} bytes, have {}",
                offset - 4,
                len,
                bytes.len() - offset
            )));
        }
        let batch: WriteBatch = rmp_serde::from_slice(&bytes[offset..offset + len])
            .map_err(|e| ReplicaError::Serialization(format!("Failed to decode journal record: {}", e)))?;
        batches.push(batch);
        offset += len;
    }
    Ok(batches)
}

/// Destination of journal records.
///
/// A failed append is rolled back by cutting the file to the length it had
/// before the record, so the journal never holds a torn record that later
/// records are appended after.
pub trait JournalFile: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl JournalFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

pub struct JournalWriter<F: JournalFile = File> {
    path: PathBuf,
    file: BufWriter<F>,
    durability: DurabilityMode,
    /// Length of the journal up to the end of the last complete record
    committed_len: u64,
}

impl JournalWriter<File> {
    pub fn open(path: impl AsRef<Path>, durability: DurabilityMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| ReplicaError::Io(format!("Failed to open journal {}: {}", path.display(), e)))?;
        let committed_len = file
            .metadata()
            .map_err(|e| ReplicaError::Io(format!("Failed to stat journal {}: {}", path.display(), e)))?
            .len();
        Ok(Self::from_file(path, file, durability, committed_len))
    }
}

impl<F: JournalFile> JournalWriter<F> {
    pub fn from_file(path: PathBuf, file: F, durability: DurabilityMode, committed_len: u64) -> Self {
        Self {
            path,
            file: BufWriter::new(file),
            durability,
            committed_len,
        }
    }

    pub fn committed_len(&self) -> u64 {
        self.committed_len
    }

    /// Append one record and hand the writer back.
    ///
    /// On failure the writer is consumed: whatever it still buffers is
    /// discarded and the file is cut back to the last complete record.
    pub fn append(mut self, batch: &WriteBatch) -> Result<Self> {
        let record = encode_journal_record(batch)?;
        match self.write_record(&record) {
            Ok(()) => {
                self.committed_len += record.len() as u64;
                Ok(self)
            }
            Err(err) => {
                self.discard();
                Err(err)
            }
        }
    }

    fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.file
            .write_all(record)
            .map_err(|e| ReplicaError::Io(format!("Failed to write journal: {}", e)))?;
        self.flush()?;
        if self.durability == DurabilityMode::Sync {
            self.file
                .get_mut()
                .sync()
                .map_err(|e| ReplicaError::Io(format!("Failed to sync journal: {}", e)))?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file
            .flush()
            .map_err(|e| ReplicaError::Io(format!("Failed to flush journal {}: {}", self.path.display(), e)))
    }

    fn discard(self) {
        // into_parts hands back the unflushed bytes instead of writing them
        let (mut file, _unflushed) = self.file.into_parts();
        if let Err(err) = file.truncate_to(self.committed_len) {
            event!(
                Level::ERROR,
                path = %self.path.display(),
                committed_len = self.committed_len,
                error = %err,
                "failed to roll back torn journal record"
            );
        }
    }
}

// ============================================================================
// Location load / write
// ============================================================================

#[derive(Debug)]
pub struct LoadedLocation {
    pub manifest: SnapshotManifest,
    pub tables: Tables,
    /// Latest sequence after replaying the journal
    pub sequence: SequenceNumber,
    pub replayed_batches: usize,
}

/// Rebuild a location's state from the raw bytes of its files.
pub fn decode_location(
    manifest_bytes: &[u8],
    tables_bytes: &[u8],
    journal_bytes: Option<&[u8]>,
) -> Result<LoadedLocation> {
    let manifest = SnapshotManifest::decode(manifest_bytes)?;
    let mut tables: Tables = rmp_serde::from_slice(tables_bytes)
        .map_err(|e| ReplicaError::Serialization(format!("Failed to decode table snapshot: {}", e)))?;

    let declared: BTreeSet<&str> = manifest.tables.iter().map(String::as_str).collect();
    let stored: BTreeSet<&str> = tables.keys().map(String::as_str).collect();
    if declared != stored {
        return Err(ReplicaError::Serialization(format!(
            "Manifest declares tables {:?} but snapshot holds {:?}",
            declared, stored
        )));
    }

    let mut sequence = manifest.base_sequence;
    let mut replayed_batches = 0usize;
    if let Some(bytes) = journal_bytes {
        for batch in decode_journal(bytes)? {
            let Some(last) = batch.check_follows(sequence)? else {
                continue;
            };
            for op in &batch.ops {
                op.apply_to(&mut tables);
            }
            sequence = last;
            replayed_batches += 1;
        }
    }

    Ok(LoadedLocation {
        manifest,
        tables,
        sequence,
        replayed_batches,
    })
}

/// Materialize a new location at `dest` holding `tables` as of `sequence`.
///
/// Files are written into a staging directory next to `dest` which is then
/// renamed into place, so `dest` either does not exist or is complete.
pub fn write_location(dest: &Path, tables: &Tables, sequence: SequenceNumber) -> Result<()> {
    if dest.exists() {
        return Err(ReplicaError::InvalidLocation(format!(
            "Target location {} already exists",
            dest.display()
        )));
    }
    let staging = staging_path(dest)?;
    if let Some(parent) = staging.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| ReplicaError::Io(format!("Failed to create snapshot root: {}", e)))?;
    }
    fs::create_dir(&staging)
        .map_err(|e| ReplicaError::Io(format!("Failed to create staging directory: {}", e)))?;

    let result = write_location_files(&staging, tables, sequence).and_then(|_| {
        fs::rename(&staging, dest)
            .map_err(|e| ReplicaError::Io(format!("Failed to publish location {}: {}", dest.display(), e)))
    });
    if result.is_err() {
        let _ = fs::remove_dir_all(&staging);
    }
    result
}

fn write_location_files(dir: &Path, tables: &Tables, sequence: SequenceNumber) -> Result<()> {
    let data = rmp_serde::to_vec(tables)
        .map_err(|e| ReplicaError::Serialization(format!("Failed to serialize tables: {}", e)))?;
    write_synced(&dir.join(TABLES_FILE), &data)?;

    let manifest = SnapshotManifest::new(sequence, tables).encode()?;
    write_synced(&dir.join(MANIFEST_FILE), &manifest)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| ReplicaError::Io(format!("Failed to create {}: {}", path.display(), e)))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(bytes)
        .map_err(|e| ReplicaError::Io(format!("Failed to write {}: {}", path.display(), e)))?;
    writer
        .flush()
        .map_err(|e| ReplicaError::Io(format!("Failed to flush {}: {}", path.display(), e)))?;
    writer
        .get_mut()
        .sync_all()
        .map_err(|e| ReplicaError::Io(format!("Failed to sync {}: {}", path.display(), e)))
}

/// Hidden sibling directory used while a location is being materialized.
pub fn staging_path(dest: &Path) -> Result<PathBuf> {
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ReplicaError::InvalidLocation(format!("No directory name in {}", dest.display())))?;
    let staging_name = format!(".{}.tmp-{}", name, Uuid::new_v4().simple());
    Ok(match dest.parent() {
        Some(parent) => parent.join(staging_name),
        None => PathBuf::from(staging_name),
    })
}
