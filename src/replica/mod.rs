// ============================================================================
// Replica Management Module
// ============================================================================
//
// Keeps one published handle to a local copy of the metadata store, swaps it
// for a freshly fetched location on refresh and retires the old one once no
// reader holds it.
//
// ============================================================================

pub mod config;
pub mod handle;
pub mod manager;
pub mod retirement;
pub mod sequence;

pub use config::ReplicaConfig;
pub use handle::{DbHandle, HandleId, HandleLease};
pub use manager::{ReplicaManager, ReplicaPhase, ReplicaStats};
pub use retirement::{RetiredHandleInfo, RetirementReport};
pub use sequence::SequenceTracker;
