// ============================================================================
// omreplica Library
// ============================================================================

pub mod core;
pub mod replica;
pub mod storage;

// Re-export main types for convenience
pub use crate::core::{ReplicaError, Result, SequenceNumber, WriteBatch, WriteOp};
pub use replica::{
    DbHandle, HandleLease, ReplicaConfig, ReplicaManager, ReplicaPhase, ReplicaStats,
    RetirementReport,
};
pub use storage::{
    DurabilityMode, LocalCheckpointFetcher, ReadView, SnapshotFetcher, SnapshotStoreEngine,
    StoreEngine, StoreInstance,
};
