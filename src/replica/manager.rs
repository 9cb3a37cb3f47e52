// ============================================================================
// Replica Manager
// ============================================================================
//
// Owns the single published DB handle. Publication is a pointer swap under a
// short write lock; readers clone the Arc under a read lock and release the
// lock before touching the store. A replaced handle is retired: it closes
// when its last lease is dropped.
//
// ============================================================================

use super::config::ReplicaConfig;
use super::handle::{CloseCounter, DbHandle, HandleId, HandleLease};
use super::retirement::{LiveLocations, RetirementRegistry, RetirementReport};
use crate::core::{ReplicaError, Result, SequenceNumber, WriteBatch};
use crate::storage::StoreEngine;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{Instrument, Level, event, info_span};

enum ReplicaState {
    Uninitialized,
    Active(Arc<DbHandle>),
    Closed,
}

impl ReplicaState {
    fn phase(&self) -> ReplicaPhase {
        match self {
            ReplicaState::Uninitialized => ReplicaPhase::Uninitialized,
            ReplicaState::Active(_) => ReplicaPhase::Active,
            ReplicaState::Closed => ReplicaPhase::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPhase {
    Uninitialized,
    Active,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ReplicaStats {
    pub phase: ReplicaPhase,
    pub active_handle: Option<HandleId>,
    pub active_location: Option<PathBuf>,
    pub active_since: Option<DateTime<Utc>>,
    /// Successful publications, including the initial one
    pub swaps: u64,
    pub failed_swaps: u64,
    pub handles_opened: u64,
    pub handles_closed: u64,
    /// Handles unpublished so far, by swaps and shutdown
    pub retired_handles: u64,
    pub pending_retirements: usize,
}

pub struct ReplicaManager {
    engine: Arc<dyn StoreEngine>,
    config: ReplicaConfig,
    state: RwLock<ReplicaState>,
    /// Serializes initialize / update_location / apply_updates / shutdown.
    /// Readers never take it.
    swap_lock: Mutex<()>,
    retired: RetirementRegistry,
    live_locations: Arc<LiveLocations>,
    swaps: AtomicU64,
    failed_swaps: AtomicU64,
    handles_opened: AtomicU64,
    handles_closed: CloseCounter,
}

impl ReplicaManager {
    /// Create an uninitialized manager
    pub fn new(engine: Arc<dyn StoreEngine>, config: ReplicaConfig) -> Result<Self> {
        config.validate().map_err(ReplicaError::InvalidConfig)?;

        Ok(Self {
            engine,
            config,
            state: RwLock::new(ReplicaState::Uninitialized),
            swap_lock: Mutex::new(()),
            retired: RetirementRegistry::new(),
            live_locations: Arc::new(LiveLocations::new()),
            swaps: AtomicU64::new(0),
            failed_swaps: AtomicU64::new(0),
            handles_opened: AtomicU64::new(0),
            handles_closed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Create a manager and publish a handle for `location`
    pub async fn open(
        engine: Arc<dyn StoreEngine>,
        config: ReplicaConfig,
        location: impl AsRef<Path>,
    ) -> Result<Self> {
        let manager = Self::new(engine, config)?;
        manager.initialize(location).await?;
        Ok(manager)
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub async fn phase(&self) -> ReplicaPhase {
        self.state.read().await.phase()
    }

    /// Open the first handle. Valid only while uninitialized.
    pub async fn initialize(&self, location: impl AsRef<Path>) -> Result<()> {
        let location = location.as_ref();
        validate_location(location)?;

        let span = info_span!("replica.initialize", location = %location.display());
        self.initialize_at(location).instrument(span).await
    }

    async fn initialize_at(&self, location: &Path) -> Result<()> {
        let _swap = self.swap_lock.lock().await;
        match self.phase().await {
            ReplicaPhase::Uninitialized => {}
            ReplicaPhase::Active => return Err(ReplicaError::AlreadyInitialized),
            ReplicaPhase::Closed => return Err(ReplicaError::AlreadyClosed),
        }

        let location = self.resolve(location).await?;
        let handle = self.open_handle(&location).await?;
        let previous = self.publish(handle).await;
        debug_assert!(previous.is_none());
        Ok(())
    }

    /// Point the replica at a new location and retire the current handle.
    ///
    /// The new location is opened before anything is published. If opening
    /// fails the current handle stays active and the error is returned. The
    /// old handle is not closed here: it closes once every outstanding lease
    /// has been dropped. Use [`ReplicaManager::await_retirement`] to wait for
    /// that.
    pub async fn update_location(&self, location: impl AsRef<Path>) -> Result<()> {
        let location = location.as_ref();
        validate_location(location)?;

        let span = info_span!("replica.update_location", location = %location.display());
        self.swap_to(location).instrument(span).await
    }

    async fn swap_to(&self, location: &Path) -> Result<()> {
        let _swap = self.swap_lock.lock().await;
        let current = self.current().await?;
        let location = self.resolve(location).await?;
        if current.location() == location.as_path() {
            return Err(ReplicaError::InvalidLocation(format!(
                "{} is already the active location",
                location.display()
            )));
        }
        drop(current);

        let handle = self.open_handle(&location).await?;
        if let Some(previous) = self.publish(handle).await {
            if self.config.remove_retired_locations {
                previous.remove_location_on_release();
            }
            self.retire(previous);
        }
        Ok(())
    }

    /// Latest sequence number of the published handle.
    ///
    /// Fails with `NotInitialized` before the first successful open; zero is
    /// only ever returned when the store itself reports zero.
    pub async fn last_sequence_number(&self) -> Result<SequenceNumber> {
        let handle = self.current().await?;
        handle.sequence_number()
    }

    /// Borrow the published handle for reads. Hold the lease only for the
    /// duration of a read: a retired handle stays open while leased.
    pub async fn lease(&self) -> Result<HandleLease> {
        Ok(HandleLease::new(self.current().await?))
    }

    pub async fn active_location(&self) -> Result<PathBuf> {
        Ok(self.current().await?.location().to_path_buf())
    }

    /// Whether the published instance exposes any table
    pub async fn tables_initialized(&self) -> Result<bool> {
        let view = self.current().await?.read_view()?;
        Ok(!view.tables().is_empty())
    }

    /// Apply an incremental batch to the published handle and return the
    /// new latest sequence number. A batch that does not start right after
    /// the current sequence is rejected with `SequenceGap`.
    pub async fn apply_updates(&self, batch: &WriteBatch) -> Result<SequenceNumber> {
        let _swap = self.swap_lock.lock().await;
        let handle = self.current().await?;
        match handle.apply_batch(batch) {
            Ok(sequence) => {
                event!(
                    Level::DEBUG,
                    handle_id = handle.id(),
                    ops = batch.len(),
                    sequence,
                    "write batch applied"
                );
                Ok(sequence)
            }
            Err(err) => {
                event!(
                    Level::WARN,
                    handle_id = handle.id(),
                    start_sequence = batch.start_sequence,
                    error = %err,
                    "write batch rejected"
                );
                Err(err)
            }
        }
    }

    /// Write a checkpoint of the published handle into a new location
    pub async fn checkpoint_to(&self, dest: impl AsRef<Path>) -> Result<()> {
        let handle = self.current().await?;
        handle.checkpoint_to(dest.as_ref())
    }

    /// Unpublish the active handle. Later calls fail with `AlreadyClosed`.
    /// Calling it twice is not an error.
    pub async fn shutdown(&self) -> Result<()> {
        let _swap = self.swap_lock.lock().await;
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, ReplicaState::Closed)
        };
        if let ReplicaState::Active(handle) = previous {
            event!(
                Level::INFO,
                handle_id = handle.id(),
                location = %handle.location().display(),
                "replica manager shut down"
            );
            self.retire(handle);
        }
        Ok(())
    }

    pub fn retirement_report(&self) -> Result<RetirementReport> {
        self.retired.report(self.config.leak_threshold)
    }

    /// Wait until every retired handle has been closed
    pub async fn await_retirement(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();

        loop {
            let pending = self.retired.pending()?;
            if pending == 0 {
                return Ok(());
            }

            if start.elapsed() >= timeout {
                return Err(ReplicaError::RetirementTimeout { pending });
            }

            tokio::time::sleep(self.config.retirement_poll_interval).await;
        }
    }

    pub async fn stats(&self) -> Result<ReplicaStats> {
        let (phase, active_handle, active_location, active_since) = {
            let state = self.state.read().await;
            match &*state {
                ReplicaState::Active(handle) => (
                    ReplicaPhase::Active,
                    Some(handle.id()),
                    Some(handle.location().to_path_buf()),
                    Some(handle.opened_at()),
                ),
                other => (other.phase(), None, None, None),
            }
        };

        Ok(ReplicaStats {
            phase,
            active_handle,
            active_location,
            active_since,
            swaps: self.swaps.load(Ordering::Relaxed),
            failed_swaps: self.failed_swaps.load(Ordering::Relaxed),
            handles_opened: self.handles_opened.load(Ordering::Relaxed),
            handles_closed: self.handles_closed.load(Ordering::Relaxed),
            retired_handles: self.retired.retired_total(),
            pending_retirements: self.retired.pending()?,
        })
    }

    async fn current(&self) -> Result<Arc<DbHandle>> {
        match &*self.state.read().await {
            ReplicaState::Active(handle) => Ok(Arc::clone(handle)),
            ReplicaState::Uninitialized => Err(ReplicaError::NotInitialized),
            ReplicaState::Closed => Err(ReplicaError::AlreadyClosed),
        }
    }

    /// Canonical location as the engine sees it, so aliases of the active
    /// location are recognized
    async fn resolve(&self, location: &Path) -> Result<PathBuf> {
        match self.engine.resolve(location).await {
            Ok(resolved) => Ok(resolved),
            Err(err) => Err(self.open_failed(location, err)),
        }
    }

    async fn open_handle(&self, location: &Path) -> Result<Arc<DbHandle>> {
        // claimed before opening, so a retiring handle cannot remove it meanwhile
        let live_location = self.live_locations.acquire(location)?;
        match DbHandle::open(self.engine.as_ref(), location).await {
            Ok(handle) => {
                self.handles_opened.fetch_add(1, Ordering::Relaxed);
                Ok(Arc::new(
                    handle
                        .with_close_counter(Arc::clone(&self.handles_closed))
                        .with_live_location(live_location),
                ))
            }
            Err(err) => Err(self.open_failed(location, err)),
        }
    }

    fn open_failed(&self, location: &Path, err: ReplicaError) -> ReplicaError {
        self.failed_swaps.fetch_add(1, Ordering::Relaxed);
        event!(
            Level::WARN,
            location = %location.display(),
            error = %err,
            "failed to open replica location, keeping current handle"
        );
        err
    }

    /// Swap `handle` in and hand back whatever was published before.
    async fn publish(&self, handle: Arc<DbHandle>) -> Option<Arc<DbHandle>> {
        let handle_id = handle.id();
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, ReplicaState::Active(handle))
        };
        self.swaps.fetch_add(1, Ordering::Relaxed);
        event!(Level::INFO, handle_id, "db handle published");

        match previous {
            ReplicaState::Active(previous) => Some(previous),
            ReplicaState::Uninitialized | ReplicaState::Closed => None,
        }
    }

    fn retire(&self, handle: Arc<DbHandle>) {
        if let Err(err) = self.retired.retire(&handle) {
            event!(
                Level::ERROR,
                handle_id = handle.id(),
                error = %err,
                "failed to register retired handle"
            );
        }
        // the handle closes here unless a lease still holds it
        drop(handle);
    }
}

fn validate_location(location: &Path) -> Result<()> {
    if location.as_os_str().is_empty() {
        return Err(ReplicaError::InvalidLocation(
            "location must not be empty".to_string(),
        ));
    }
    Ok(())
}
