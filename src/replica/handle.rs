use super::retirement::{LiveLocation, remove_location};
use super::sequence::SequenceTracker;
use crate::core::{ReplicaError, Result, SequenceNumber, WriteBatch};
use crate::storage::{ReadView, StoreEngine, StoreInstance};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{Level, event};

pub type HandleId = u64;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Counter bumped every time a handle is closed
pub(crate) type CloseCounter = Arc<AtomicU64>;

/// One opened store instance and its lifecycle.
///
/// The handle owns every native resource of the instance. It is closed
/// explicitly through [`DbHandle::close`] or implicitly when the last
/// reference is dropped.
pub struct DbHandle {
    id: HandleId,
    location: PathBuf,
    instance: Box<dyn StoreInstance>,
    tracker: SequenceTracker,
    opened_at: DateTime<Utc>,
    closed: AtomicBool,
    close_counter: Option<CloseCounter>,
    remove_on_release: AtomicBool,
    live_location: Option<LiveLocation>,
    released: Arc<AtomicBool>,
}

impl DbHandle {
    pub async fn open(engine: &dyn StoreEngine, location: &Path) -> Result<Self> {
        let instance = engine.open(location).await.map_err(|err| match err {
            ReplicaError::OpenFailure { .. } => err,
            other => ReplicaError::open_failure(location, other),
        })?;
        let handle = Self::from_instance(instance);
        event!(
            Level::INFO,
            handle_id = handle.id,
            engine = engine.name(),
            location = %handle.location.display(),
            "db handle opened"
        );
        Ok(handle)
    }

    pub fn from_instance(instance: Box<dyn StoreInstance>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            location: instance.location().to_path_buf(),
            instance,
            tracker: SequenceTracker::new(),
            opened_at: Utc::now(),
            closed: AtomicBool::new(false),
            close_counter: None,
            remove_on_release: AtomicBool::new(false),
            live_location: None,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn with_close_counter(mut self, counter: CloseCounter) -> Self {
        self.close_counter = Some(counter);
        self
    }

    /// Hold a claim on the location for as long as the handle lives
    pub(crate) fn with_live_location(mut self, live_location: LiveLocation) -> Self {
        self.live_location = Some(live_location);
        self
    }

    /// Delete the location from disk once the handle is released, unless
    /// another live handle still uses it
    pub(crate) fn remove_location_on_release(&self) {
        self.remove_on_release.store(true, Ordering::Release);
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Set once the handle has been dropped and every close side effect ran
    pub(crate) fn released_flag(&self) -> Arc<AtomicBool> {
        self.released.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ReplicaError::HandleClosed);
        }
        Ok(())
    }

    pub fn sequence_number(&self) -> Result<SequenceNumber> {
        self.ensure_open()?;
        let sequence = self.instance.latest_sequence_number()?;
        Ok(self.tracker.observe(sequence))
    }

    pub fn read_view(&self) -> Result<ReadView> {
        self.ensure_open()?;
        self.instance.read_view()
    }

    pub fn apply_batch(&self, batch: &WriteBatch) -> Result<SequenceNumber> {
        self.ensure_open()?;
        let sequence = self.instance.apply_batch(batch)?;
        Ok(self.tracker.observe(sequence))
    }

    pub fn checkpoint_to(&self, dest: &Path) -> Result<()> {
        self.ensure_open()?;
        self.instance.checkpoint_to(dest)
    }

    /// Release the instance. Closing an already closed handle is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.instance.close();
        if let Some(counter) = &self.close_counter {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        event!(
            Level::DEBUG,
            handle_id = self.id,
            location = %self.location.display(),
            last_sequence = ?self.tracker.last_observed(),
            "db handle closed"
        );
        result
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            event!(
                Level::ERROR,
                handle_id = self.id,
                location = %self.location.display(),
                error = %err,
                "failed to close db handle"
            );
        }
        let remove = self.remove_on_release.load(Ordering::Acquire);
        match self.live_location.as_mut() {
            Some(live_location) => live_location.release(remove),
            None if remove => remove_location(&self.location),
            None => {}
        }
        self.released.store(true, Ordering::Release);
    }
}

impl fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbHandle")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("opened_at", &self.opened_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Counted borrow of a handle. The handle stays open for as long as any
/// lease to it is alive, even after a newer handle has been published.
#[derive(Debug, Clone)]
pub struct HandleLease {
    handle: Arc<DbHandle>,
}

impl HandleLease {
    pub(crate) fn new(handle: Arc<DbHandle>) -> Self {
        Self { handle }
    }

    pub fn handle_id(&self) -> HandleId {
        self.handle.id()
    }

    pub fn location(&self) -> &Path {
        self.handle.location()
    }

    pub fn sequence_number(&self) -> Result<SequenceNumber> {
        self.handle.sequence_number()
    }

    pub fn read_view(&self) -> Result<ReadView> {
        self.handle.read_view()
    }

    pub fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.read_view()?.get(table, key).map(|value| value.to_vec()))
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        Ok(self.read_view()?.table_names())
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.read_view()?.row_count(table))
    }
}
