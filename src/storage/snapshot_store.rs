use super::engine::{StoreEngine, StoreInstance};
use super::persistence::{
    DurabilityMode, JOURNAL_FILE, JournalWriter, LoadedLocation, MANIFEST_FILE, TABLES_FILE,
    decode_location, write_location,
};
use super::view::ReadView;
use crate::core::{ReplicaError, Result, SequenceNumber, Tables, WriteBatch};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs;
use tracing::{Level, event};

/// File-backed engine: a location is a directory holding a manifest, a
/// table snapshot and an optional journal of batches applied after it.
#[derive(Debug, Clone, Default)]
pub struct SnapshotStoreEngine {
    durability: DurabilityMode,
}

impl SnapshotStoreEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_durability(mut self, durability: DurabilityMode) -> Self {
        self.durability = durability;
        self
    }

    /// Open a location directly, without going through the trait object.
    pub async fn open_instance(&self, location: &Path) -> Result<SnapshotInstance> {
        let loaded = load_location(location)
            .await
            .map_err(|e| ReplicaError::open_failure(location, e))?;
        event!(
            Level::DEBUG,
            location = %location.display(),
            sequence = loaded.sequence,
            replayed_batches = loaded.replayed_batches,
            "snapshot location loaded"
        );
        Ok(SnapshotInstance::new(location.to_path_buf(), loaded, self.durability))
    }
}

#[async_trait]
impl StoreEngine for SnapshotStoreEngine {
    fn name(&self) -> &'static str {
        "snapshot-store"
    }

    async fn resolve(&self, location: &Path) -> Result<PathBuf> {
        fs::canonicalize(location)
            .await
            .map_err(|e| ReplicaError::open_failure(location, e))
    }

    async fn open(&self, location: &Path) -> Result<Box<dyn StoreInstance>> {
        Ok(Box::new(self.open_instance(location).await?))
    }
}

async fn load_location(location: &Path) -> Result<LoadedLocation> {
    let metadata = fs::metadata(location).await?;
    if !metadata.is_dir() {
        return Err(ReplicaError::InvalidLocation(format!(
            "{} is not a directory",
            location.display()
        )));
    }

    let manifest = fs::read(location.join(MANIFEST_FILE))
        .await
        .map_err(|e| ReplicaError::Io(format!("Failed to read {}: {}", MANIFEST_FILE, e)))?;
    let tables = fs::read(location.join(TABLES_FILE))
        .await
        .map_err(|e| ReplicaError::Io(format!("Failed to read {}: {}", TABLES_FILE, e)))?;
    let journal = match fs::read(location.join(JOURNAL_FILE)).await {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            return Err(ReplicaError::Io(format!("Failed to read {}: {}", JOURNAL_FILE, e)));
        }
    };

    decode_location(&manifest, &tables, journal.as_deref())
}

struct InstanceState {
    tables: Tables,
    journal: Option<JournalWriter>,
}

pub struct SnapshotInstance {
    location: PathBuf,
    durability: DurabilityMode,
    state: RwLock<InstanceState>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

impl SnapshotInstance {
    fn new(location: PathBuf, loaded: LoadedLocation, durability: DurabilityMode) -> Self {
        Self {
            location,
            durability,
            state: RwLock::new(InstanceState {
                tables: loaded.tables,
                journal: None,
            }),
            sequence: AtomicU64::new(loaded.sequence),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicaError::HandleClosed);
        }
        Ok(())
    }
}

impl StoreInstance for SnapshotInstance {
    fn location(&self) -> &Path {
        &self.location
    }

    fn latest_sequence_number(&self) -> Result<SequenceNumber> {
        self.ensure_open()?;
        Ok(self.sequence.load(Ordering::Acquire))
    }

    fn read_view(&self) -> Result<ReadView> {
        let state = self.state.read()?;
        self.ensure_open()?;
        Ok(ReadView::new(
            self.sequence.load(Ordering::Acquire),
            state.tables.clone(),
        ))
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<SequenceNumber> {
        let mut state = self.state.write()?;
        self.ensure_open()?;

        let current = self.sequence.load(Ordering::Acquire);
        let Some(last) = batch.check_follows(current)? else {
            return Ok(current);
        };

        // a failed append drops the writer; the next batch reopens the journal
        let journal = match state.journal.take() {
            Some(journal) => journal,
            None => JournalWriter::open(self.location.join(JOURNAL_FILE), self.durability)?,
        };
        state.journal = Some(journal.append(batch)?);

        let mut tables = state.tables.clone();
        for op in &batch.ops {
            op.apply_to(&mut tables);
        }
        state.tables = tables;
        // data first, then the counter
        self.sequence.store(last, Ordering::Release);
        Ok(last)
    }

    fn checkpoint_to(&self, dest: &Path) -> Result<()> {
        let view = self.read_view()?;
        write_location(dest, view.tables(), view.sequence())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.write()?;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        state.tables = Tables::new();
        match state.journal.take() {
            Some(mut journal) => journal.flush(),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
