use super::handle::{DbHandle, HandleId};
use crate::core::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{Level, event};

#[derive(Debug, Clone)]
pub struct RetiredHandleInfo {
    pub handle_id: HandleId,
    pub location: PathBuf,
    pub retired_for: Duration,
    /// Leases still holding the handle open
    pub outstanding_leases: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RetirementReport {
    /// Retired handles not closed yet
    pub pending: usize,
    /// Pending handles retired longer than the leak threshold
    pub suspected_leaks: Vec<RetiredHandleInfo>,
}

impl RetirementReport {
    pub fn is_quiescent(&self) -> bool {
        self.pending == 0
    }
}

struct RetiredEntry {
    handle_id: HandleId,
    location: PathBuf,
    retired_at: Instant,
    handle: Weak<DbHandle>,
    released: Arc<AtomicBool>,
}

impl RetiredEntry {
    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// Tracks handles that are no longer published but may still be leased.
///
/// Only weak references are kept, so the registry never extends a handle's
/// life. An entry is dropped once its handle has been closed and released.
#[derive(Default)]
pub struct RetirementRegistry {
    entries: Mutex<Vec<RetiredEntry>>,
    retired_total: AtomicU64,
}

impl RetirementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retire(&self, handle: &Arc<DbHandle>) -> Result<()> {
        let entry = RetiredEntry {
            handle_id: handle.id(),
            location: handle.location().to_path_buf(),
            retired_at: Instant::now(),
            handle: Arc::downgrade(handle),
            released: handle.released_flag(),
        };
        let mut entries = self.entries.lock()?;
        entries.retain(|e| !e.is_released());
        entries.push(entry);
        self.retired_total.fetch_add(1, Ordering::Relaxed);

        event!(
            Level::DEBUG,
            handle_id = handle.id(),
            location = %handle.location().display(),
            "db handle retired"
        );
        Ok(())
    }

    /// Number of retired handles still alive
    pub fn pending(&self) -> Result<usize> {
        let mut entries = self.entries.lock()?;
        entries.retain(|e| !e.is_released());
        Ok(entries.len())
    }

    pub fn retired_total(&self) -> u64 {
        self.retired_total.load(Ordering::Relaxed)
    }

    pub fn report(&self, leak_threshold: Duration) -> Result<RetirementReport> {
        let mut entries = self.entries.lock()?;
        entries.retain(|e| !e.is_released());

        let mut suspected_leaks = Vec::new();
        for entry in entries.iter() {
            let retired_for = entry.retired_at.elapsed();
            if retired_for < leak_threshold {
                continue;
            }
            let outstanding_leases = entry.handle.strong_count();
            event!(
                Level::WARN,
                handle_id = entry.handle_id,
                location = %entry.location.display(),
                retired_ms = retired_for.as_millis() as u64,
                outstanding_leases,
                "retired db handle is still referenced"
            );
            suspected_leaks.push(RetiredHandleInfo {
                handle_id: entry.handle_id,
                location: entry.location.clone(),
                retired_for,
                outstanding_leases,
            });
        }

        Ok(RetirementReport {
            pending: entries.len(),
            suspected_leaks,
        })
    }
}

/// Live handle count per location, shared by every handle a manager opens.
///
/// A retired location is only deleted from disk when no other handle holds
/// it. Claims are taken before an open starts, so a location being
/// re-published is never removed underneath the new handle.
#[derive(Debug, Default)]
pub(crate) struct LiveLocations {
    counts: Mutex<HashMap<PathBuf, usize>>,
}

impl LiveLocations {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn acquire(self: &Arc<Self>, location: &Path) -> Result<LiveLocation> {
        *self.counts.lock()?.entry(location.to_path_buf()).or_default() += 1;
        Ok(LiveLocation {
            locations: Arc::clone(self),
            location: location.to_path_buf(),
            held: true,
        })
    }

    #[cfg(test)]
    pub(crate) fn holders(&self, location: &Path) -> Result<usize> {
        Ok(self.counts.lock()?.get(location).copied().unwrap_or(0))
    }
}

/// One handle's claim on its location. Dropping it releases the claim
/// without touching the disk.
#[derive(Debug)]
pub(crate) struct LiveLocation {
    locations: Arc<LiveLocations>,
    location: PathBuf,
    held: bool,
}

impl LiveLocation {
    /// Release the claim. With `remove`, the directory is deleted if this
    /// was the last claim on it.
    pub(crate) fn release(&mut self, remove: bool) {
        if !std::mem::replace(&mut self.held, false) {
            return;
        }
        let mut counts = match self.locations.counts.lock() {
            Ok(counts) => counts,
            Err(poisoned) => poisoned.into_inner(),
        };
        let remaining = match counts.get_mut(&self.location) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        if remaining > 0 {
            if remove {
                event!(
                    Level::DEBUG,
                    location = %self.location.display(),
                    holders = remaining,
                    "retired location is still in use, keeping it"
                );
            }
            return;
        }
        counts.remove(&self.location);
        // removal happens under the lock so a concurrent claim waits for it
        if remove {
            remove_location(&self.location);
        }
    }
}

impl Drop for LiveLocation {
    fn drop(&mut self) {
        self.release(false);
    }
}

pub(crate) fn remove_location(location: &Path) {
    match std::fs::remove_dir_all(location) {
        Ok(()) => event!(Level::DEBUG, location = %location.display(), "retired location removed"),
        Err(err) => event!(
            Level::WARN,
            location = %location.display(),
            error = %err,
            "failed to remove retired location"
        ),
    }
}
