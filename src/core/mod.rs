pub mod error;
pub mod types;

pub use error::{ReplicaError, Result};
pub use types::{SequenceNumber, TableData, Tables, WriteBatch, WriteOp};
