//! In-memory store engine for replica manager tests
//!
//! Locations are registered up front with a starting sequence number; any
//! other location fails to open. Every opened instance is remembered so
//! tests can check which ones were closed.
#![allow(dead_code)]

use async_trait::async_trait;
use omreplica::core::Tables;
use omreplica::{ReadView, ReplicaError, Result, StoreEngine, StoreInstance, WriteBatch};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy)]
struct MockLocation {
    sequence: u64,
    fail_close: bool,
}

#[derive(Default)]
pub struct MockEngine {
    locations: Mutex<HashMap<PathBuf, MockLocation>>,
    opened: Mutex<Vec<Arc<MockState>>>,
}

pub struct MockState {
    pub location: PathBuf,
    sequence: AtomicU64,
    closed: AtomicBool,
    fail_close: bool,
}

impl MockState {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub fn mock_location(name: &str) -> PathBuf {
    PathBuf::from(format!("/mock/{}", name))
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_location(&self, name: &str, sequence: u64) -> PathBuf {
        self.register(name, sequence, false)
    }

    /// A location whose instance reports an error when closed
    pub fn add_failing_close(&self, name: &str, sequence: u64) -> PathBuf {
        self.register(name, sequence, true)
    }

    fn register(&self, name: &str, sequence: u64, fail_close: bool) -> PathBuf {
        let location = mock_location(name);
        self.locations.lock().unwrap().insert(
            location.clone(),
            MockLocation {
                sequence,
                fail_close,
            },
        );
        location
    }

    pub fn opened(&self) -> Vec<Arc<MockState>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn still_open(&self) -> Vec<PathBuf> {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|state| !state.is_closed())
            .map(|state| state.location.clone())
            .collect()
    }
}

#[async_trait]
impl StoreEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&self, location: &Path) -> Result<Box<dyn StoreInstance>> {
        let registered = self.locations.lock().unwrap().get(location).copied();
        let Some(registered) = registered else {
            return Err(ReplicaError::open_failure(location, "no such mock location"));
        };

        let state = Arc::new(MockState {
            location: location.to_path_buf(),
            sequence: AtomicU64::new(registered.sequence),
            closed: AtomicBool::new(false),
            fail_close: registered.fail_close,
        });
        self.opened.lock().unwrap().push(state.clone());
        Ok(Box::new(MockInstance { state }))
    }
}

pub struct MockInstance {
    state: Arc<MockState>,
}

impl MockInstance {
    fn ensure_open(&self) -> Result<()> {
        if self.state.is_closed() {
            return Err(ReplicaError::HandleClosed);
        }
        Ok(())
    }
}

impl StoreInstance for MockInstance {
    fn location(&self) -> &Path {
        &self.state.location
    }

    fn latest_sequence_number(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.state.sequence.load(Ordering::Acquire))
    }

    fn read_view(&self) -> Result<ReadView> {
        self.ensure_open()?;
        Ok(ReadView::new(
            self.state.sequence.load(Ordering::Acquire),
            Tables::new(),
        ))
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<u64> {
        self.ensure_open()?;
        let current = self.state.sequence.load(Ordering::Acquire);
        let Some(last) = batch.check_follows(current)? else {
            return Ok(current);
        };
        self.state.sequence.store(last, Ordering::Release);
        Ok(last)
    }

    fn checkpoint_to(&self, _dest: &Path) -> Result<()> {
        Err(ReplicaError::Io("mock engine cannot checkpoint".to_string()))
    }

    fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.state.fail_close {
            return Err(ReplicaError::Io("mock close failure".to_string()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

/// A batch of `ops` puts starting at `start_sequence`
pub fn batch(start_sequence: u64, ops: usize) -> WriteBatch {
    (0..ops).fold(WriteBatch::new(start_sequence), |batch, i| {
        batch.put("keyTable", &format!("/vol/bucket/key-{}-{}", start_sequence, i), b"x".to_vec())
    })
}
