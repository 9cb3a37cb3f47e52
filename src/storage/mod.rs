pub mod engine;
pub mod fetcher;
pub mod persistence;
pub mod snapshot_store;
pub mod view;

pub use engine::{StoreEngine, StoreInstance};
pub use fetcher::{LocalCheckpointFetcher, SnapshotFetcher, list_snapshot_locations};
pub use persistence::{DurabilityMode, SnapshotManifest, write_location};
pub use snapshot_store::{SnapshotInstance, SnapshotStoreEngine};
pub use view::ReadView;
