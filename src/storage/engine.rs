use super::view::ReadView;
use crate::core::{Result, SequenceNumber, WriteBatch};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Storage engine trait - lets the replica manager open any backing store
/// that can be rooted at a location and report a sequence number.
#[async_trait]
pub trait StoreEngine: Send + Sync {
    /// Short engine name used in logs
    fn name(&self) -> &'static str;

    /// Canonical form of `location`. Two paths naming the same instance
    /// resolve to the same value. Engines without aliasing keep it as is.
    async fn resolve(&self, location: &Path) -> Result<PathBuf> {
        Ok(location.to_path_buf())
    }

    /// Open one instance rooted at `location`
    async fn open(&self, location: &Path) -> Result<Box<dyn StoreInstance>>;
}

/// One opened instance of a store engine.
pub trait StoreInstance: Send + Sync {
    /// Location this instance was opened from
    fn location(&self) -> &Path;

    /// Sequence number of the most recent durable write
    fn latest_sequence_number(&self) -> Result<SequenceNumber>;

    /// Point-in-time view of every table together with its sequence number
    fn read_view(&self) -> Result<ReadView>;

    /// Apply a batch of updates and return the new latest sequence number
    fn apply_batch(&self, batch: &WriteBatch) -> Result<SequenceNumber>;

    /// Write a consistent copy of this instance into a new location
    fn checkpoint_to(&self, dest: &Path) -> Result<()>;

    /// Release native resources. Calling it twice is not an error.
    fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}
