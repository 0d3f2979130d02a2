use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Materialized key space: key to value, ordered by key.
pub type KeyValueState = BTreeMap<String, Vec<u8>>;

/// A single logged state transition.
///
/// A `Sequence` is itself an operation, so batches nest. Asserts are kept in
/// the log even though they never change state: a replica replays exactly what
/// the master validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
    Assert { key: String, expected: Option<Vec<u8>> },
    Sequence(Vec<Operation>),
    /// First entry of every new master; no effect on the key space.
    MasterSet { master: NodeId, epoch: u64 },
}

impl Operation {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Operation::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Operation::Delete { key: key.into() }
    }

    pub fn assert(key: impl Into<String>, expected: Option<Vec<u8>>) -> Self {
        Operation::Assert {
            key: key.into(),
            expected,
        }
    }

    /// Largest value carried by this operation, descending into sequences.
    pub fn max_value_len(&self) -> usize {
        match self {
            Operation::Set { value, .. } => value.len(),
            Operation::Assert {
                expected: Some(v), ..
            } => v.len(),
            Operation::Sequence(ops) => ops.iter().map(|op| op.max_value_len()).max().unwrap_or(0),
            _ => 0,
        }
    }

    /// Number of leaf operations (a sequence counts its members).
    pub fn leaf_count(&self) -> usize {
        match self {
            Operation::Sequence(ops) => ops.iter().map(|op| op.leaf_count()).sum(),
            _ => 1,
        }
    }
}

/// Apply an already-validated operation to `state`.
///
/// Validation (asserts, key existence) happens once on the master; replay is
/// unconditional so every replica converges on the same state.
pub fn apply_operation(state: &mut KeyValueState, op: &Operation) {
    match op {
        Operation::Set { key, value } => {
            state.insert(key.clone(), value.clone());
        }
        Operation::Delete { key } => {
            state.remove(key);
        }
        Operation::Assert { .. } | Operation::MasterSet { .. } => {}
        Operation::Sequence(ops) => {
            for op in ops {
                apply_operation(state, op);
            }
        }
    }
}

/// One record of the write-ahead log.
///
/// Indices start at 1; index 0 stands for "nothing logged yet".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub epoch: u64,
    pub payload: Operation,
    pub checksum: u32,
}

impl LogEntry {
    pub fn new(index: u64, epoch: u64, payload: Operation) -> bincode::Result<Self> {
        let checksum = Self::compute_checksum(index, epoch, &payload)?;
        Ok(Self {
            index,
            epoch,
            payload,
            checksum,
        })
    }

    /// CRC32 over the bincode encoding of `(index, epoch, payload)`.
    pub fn compute_checksum(index: u64, epoch: u64, payload: &Operation) -> bincode::Result<u32> {
        let bytes = bincode::serialize(&(index, epoch, payload))?;
        Ok(crc32fast::hash(&bytes))
    }

    /// An entry whose payload no longer encodes never verifies.
    pub fn verify(&self) -> bool {
        Self::compute_checksum(self.index, self.epoch, &self.payload).is_ok_and(|sum| sum == self.checksum)
    }
}
