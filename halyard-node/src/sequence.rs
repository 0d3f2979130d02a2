use std::collections::BTreeMap;

use halyard_core::{KeyValueState, Operation, Result, StoreError};

/// Validates client operations against the current key space and produces
/// the single operation that goes into the log.
///
/// Validation is all-or-nothing: the first failing check aborts the whole
/// batch and nothing is logged.
#[derive(Debug, Clone, Copy)]
pub struct SequenceExecutor {
    max_value_size: usize,
}

impl SequenceExecutor {
    pub fn new(max_value_size: usize) -> Self {
        Self { max_value_size }
    }

    pub fn max_value_size(&self) -> usize {
        self.max_value_size
    }

    /// A batch of one is logged as that operation; anything else as a
    /// `Sequence`. Returns `None` for an empty batch, which logs nothing.
    pub fn execute(&self, state: &KeyValueState, mut ops: Vec<Operation>) -> Result<Option<Operation>> {
        let op = match ops.len() {
            0 => return Ok(None),
            1 => ops.remove(0),
            _ => Operation::Sequence(ops),
        };
        self.validate(state, &op)?;
        Ok(Some(op))
    }

    pub fn validate(&self, state: &KeyValueState, op: &Operation) -> Result<()> {
        self.check_size(op)?;
        Overlay::new(state).check(op)
    }

    pub fn check_size(&self, op: &Operation) -> Result<()> {
        let size = op.max_value_len();
        if size > self.max_value_size {
            return Err(StoreError::ValueTooLarge {
                size,
                limit: self.max_value_size,
            });
        }
        Ok(())
    }
}

/// Pending changes of a batch layered over the committed state.
struct Overlay<'a> {
    base: &'a KeyValueState,
    changes: BTreeMap<&'a str, Option<&'a [u8]>>,
}

impl<'a> Overlay<'a> {
    fn new(base: &'a KeyValueState) -> Self {
        Self {
            base,
            changes: BTreeMap::new(),
        }
    }

    fn get(&self, key: &str) -> Option<&[u8]> {
        match self.changes.get(key) {
            Some(change) => *change,
            None => self.base.get(key).map(Vec::as_slice),
        }
    }

    fn check(&mut self, op: &'a Operation) -> Result<()> {
        match op {
            Operation::Set { key, value } => {
                self.changes.insert(key, Some(value.as_slice()));
            }
            Operation::Delete { key } => {
                if self.get(key).is_none() {
                    return Err(StoreError::KeyNotFound(key.clone()));
                }
                self.changes.insert(key, None);
            }
            Operation::Assert { key, expected } => {
                if self.get(key) != expected.as_deref() {
                    return Err(StoreError::AssertionFailed(key.clone()));
                }
            }
            Operation::Sequence(ops) => {
                for op in ops {
                    self.check(op)?;
                }
            }
            Operation::MasterSet { .. } => {}
        }
        Ok(())
    }
}
