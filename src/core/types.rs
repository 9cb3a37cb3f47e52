use super::error::{ReplicaError, Result};
use serde::{Deserialize, Serialize};

/// Position in the store's write history. Incremented once per applied
/// operation; zero means nothing has been written yet.
pub type SequenceNumber = u64;

pub type TableData = im::OrdMap<String, Vec<u8>>;
pub type Tables = im::OrdMap<String, TableData>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    Put {
        table: String,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        table: String,
        key: String,
    },
}

impl WriteOp {
    pub fn table(&self) -> &str {
        match self {
            WriteOp::Put { table, .. } | WriteOp::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key, .. } => key,
        }
    }

    pub(crate) fn apply_to(&self, tables: &mut Tables) {
        match self {
            WriteOp::Put { table, key, value } => {
                let mut data = tables.get(table).cloned().unwrap_or_default();
                data.insert(key.clone(), value.clone());
                tables.insert(table.clone(), data);
            }
            WriteOp::Delete { table, key } => {
                if let Some(data) = tables.get_mut(table) {
                    data.remove(key);
                }
            }
        }
    }
}

/// A contiguous run of writes shipped from the system of record. The first
/// operation carries `start_sequence`, each following one the next number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub start_sequence: SequenceNumber,
    pub ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new(start_sequence: SequenceNumber) -> Self {
        Self {
            start_sequence,
            ops: Vec::new(),
        }
    }

    pub fn put(mut self, table: &str, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.ops.push(WriteOp::Put {
            table: table.to_string(),
            key: key.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn delete(mut self, table: &str, key: &str) -> Self {
        self.ops.push(WriteOp::Delete {
            table: table.to_string(),
            key: key.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Sequence number of the last operation. `None` for an empty batch or
    /// one that would run past `u64::MAX`.
    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        let extra = (self.ops.len() as u64).checked_sub(1)?;
        self.start_sequence.checked_add(extra)
    }

    /// Check that the batch continues right after `current` and return the
    /// sequence number of its last operation, or `None` if it is empty.
    pub fn check_follows(&self, current: SequenceNumber) -> Result<Option<SequenceNumber>> {
        if self.ops.is_empty() {
            return Ok(None);
        }
        if current.checked_add(1) != Some(self.start_sequence) {
            return Err(ReplicaError::SequenceGap {
                expected: current.saturating_add(1),
                found: self.start_sequence,
            });
        }
        self.last_sequence()
            .map(Some)
            .ok_or(ReplicaError::SequenceOverflow {
                start: self.start_sequence,
                ops: self.ops.len(),
            })
    }
}
